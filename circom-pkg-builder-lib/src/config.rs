use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Environment variable naming the TOML configuration file.
pub const CONFIG_ENV_VAR: &str = "CIRCOM_PKG_BUILDER_CONFIG";

/// Leaves room for the template segment of a package name.
const MAX_PACKAGE_PREFIX_LEN: usize = 32;

/// Service configuration. Every field has a default, so an empty file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuilderConfig {
    /// Holds the package index database
    pub data_dir: PathBuf,
    /// Root for per-request working directories; system temp when unset
    pub work_dir: Option<PathBuf>,
    /// One compiler executable per `circomPath` selector
    pub compilers_dir: PathBuf,
    /// Extra library search paths handed to the compiler
    pub include_dirs: Vec<PathBuf>,
    pub snarkjs_bin: PathBuf,
    /// Dependency version written into generated packages
    pub snarkjs_version: String,
    /// Universal setup files, named `*_<power>.ptau`
    pub ptau_dir: PathBuf,
    pub package_prefix: String,
    pub max_concurrent_builds: usize,
    pub compile_timeout_secs: u64,
    pub setup_timeout_secs: u64,
    /// Lets groth16 builds without a finalZkey run a single-contributor setup.
    /// Keys produced this way are not safe for production use.
    pub allow_unsafe_groth16_setup: bool,
    pub key_fetch: KeyFetchConfig,
    pub store: StoreConfig,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            work_dir: None,
            compilers_dir: PathBuf::from("./compilers"),
            include_dirs: Vec::new(),
            snarkjs_bin: PathBuf::from("snarkjs"),
            snarkjs_version: "0.7.4".to_string(),
            ptau_dir: PathBuf::from("./ptau"),
            package_prefix: "zkpkg".to_string(),
            max_concurrent_builds: 4,
            compile_timeout_secs: 120,
            setup_timeout_secs: 600,
            allow_unsafe_groth16_setup: false,
            key_fetch: KeyFetchConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeyFetchConfig {
    pub timeout_secs: u64,
    pub max_bytes: u64,
    /// Permit plain `http://` key URLs (local testing only)
    pub allow_http: bool,
    pub accept_invalid_certs: bool,
}

impl Default for KeyFetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_bytes: 512 * 1024 * 1024,
            allow_http: false,
            accept_invalid_certs: false,
        }
    }
}

impl KeyFetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Fs,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub kind: StoreKind,
    /// Root directory for the `fs` store
    pub root: PathBuf,
    /// Bucket endpoint for the `http` store
    pub base_url: Option<Url>,
    pub timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Fs,
            root: PathBuf::from("./store"),
            base_url: None,
            timeout_secs: 30,
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl BuilderConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Loads from `$CIRCOM_PKG_BUILDER_CONFIG`, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => Self::load(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_builds == 0 {
            return Err(Error::ConfigError(
                "max_concurrent_builds must be at least 1".to_string(),
            ));
        }
        if self.package_prefix.is_empty()
            || self.package_prefix.len() > MAX_PACKAGE_PREFIX_LEN
            || !self
                .package_prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(Error::ConfigError(format!(
                "package_prefix must be 1-32 lowercase alphanumeric characters: {}",
                self.package_prefix
            )));
        }
        if self.store.kind == StoreKind::Http && self.store.base_url.is_none() {
            return Err(Error::ConfigError(
                "store.base_url is required for the http store".to_string(),
            ));
        }
        Ok(())
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_timeout_secs)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_secs)
    }
}
