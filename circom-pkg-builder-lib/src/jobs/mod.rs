// Job handlers

// Build a package from circuit sources.
// Input: BuildRequest event (bare or wrapped in `payload`)
// Output: BuildResponse, plus events in status/<requestId>.json
pub mod build;

pub use build::{BuildStage, handle};
