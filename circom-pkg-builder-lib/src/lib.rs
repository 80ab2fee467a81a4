//! circom-pkg-builder-lib
//! Core library for building installable prove/verify packages from circom sources.

// Modules
pub mod backend;
pub mod compiler;
pub mod config;
pub mod context;
pub mod error;
pub mod formats;
pub mod jobs;
pub mod keys;
pub mod packager;
pub mod process;
pub mod protocol;
pub mod state;
pub mod status;
pub mod storage;
pub mod types;

// Re-exports for convenience
pub use config::BuilderConfig;
pub use context::BuildContext;
pub use error::{BuildError, Error, ErrorKind, Result};
pub use jobs::handle;
pub use state::PackageIndex;
pub use status::{StatusEvent, read_status};
pub use types::{BuildRequest, BuildResponse, Protocol};
