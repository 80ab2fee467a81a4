use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use url::Url;

/// The only action the handler understands.
pub const BUILD_ACTION: &str = "build";

/// File stem of the generated entry wrapper. User files may not take it.
pub const ENTRY_WRAPPER_STEM: &str = "zkpkg_main";

const MAX_SEGMENT_LEN: usize = 128;

// Proof systems a package can be built for
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Groth16,
    Plonk,
    Fflonk,
}

impl Protocol {
    pub const ALL: [Protocol; 3] = [Protocol::Groth16, Protocol::Plonk, Protocol::Fflonk];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Groth16 => "groth16",
            Protocol::Plonk => "plonk",
            Protocol::Fflonk => "fflonk",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "groth16" => Ok(Protocol::Groth16),
            "plonk" => Ok(Protocol::Plonk),
            "fflonk" => Ok(Protocol::Fflonk),
            _ => Err(Error::InvalidInput(format!("Invalid protocol: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFile {
    pub code: String,
}

/// Which template to instantiate as the main component, and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSpec {
    /// Entry file, with or without the `.circom` extension
    pub file: String,
    pub template: String,
    #[serde(default)]
    pub params: Vec<i64>,
    /// Input signals to expose as public
    #[serde(default)]
    pub pubs: Vec<String>,
}

impl CircuitSpec {
    /// Resolves `file` against the submitted sources.
    pub fn entry_file<'a>(&self, files: &'a BTreeMap<String, SourceFile>) -> Option<&'a str> {
        if let Some((name, _)) = files.get_key_value(&self.file) {
            return Some(name.as_str());
        }
        files
            .get_key_value(&format!("{}.circom", self.file))
            .map(|(name, _)| name.as_str())
    }
}

/// A build request as delivered by the invoking runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    pub request_id: String,
    pub action: String,
    pub files: BTreeMap<String, SourceFile>,
    /// Compiler release selector, e.g. `circom-v2.1.8`
    pub circom_path: String,
    pub protocol: Protocol,
    pub circuit: CircuitSpec,
    #[serde(default)]
    pub final_zkey: Option<String>,
}

impl BuildRequest {
    /// Accepts either the bare request or an event envelope `{ "payload": {...} }`.
    pub fn from_event(event: serde_json::Value) -> Result<Self> {
        let payload = match event {
            serde_json::Value::Object(mut map) if map.contains_key("payload") => map
                .remove("payload")
                .unwrap_or(serde_json::Value::Null),
            other => other,
        };
        serde_json::from_value(payload)
            .map_err(|e| Error::InvalidInput(format!("Malformed build request: {}", e)))
    }

    /// Request-shape checks that need no configuration.
    pub fn validate(&self) -> Result<()> {
        if self.action != BUILD_ACTION {
            return Err(Error::InvalidInput(format!(
                "Unsupported action: {}",
                self.action
            )));
        }
        if !is_safe_segment(&self.request_id) {
            return Err(Error::InvalidInput(
                "requestId must be 1-128 characters of [A-Za-z0-9._-]".to_string(),
            ));
        }
        if !is_safe_segment(&self.circom_path) {
            return Err(Error::InvalidInput(format!(
                "Invalid circomPath: {}",
                self.circom_path
            )));
        }
        if self.files.is_empty() {
            return Err(Error::InvalidInput("At least one file is required".to_string()));
        }
        for name in self.files.keys() {
            if !is_safe_relative_path(name) {
                return Err(Error::InvalidInput(format!("Invalid file name: {}", name)));
            }
            if name.trim_end_matches(".circom") == ENTRY_WRAPPER_STEM {
                return Err(Error::InvalidInput(format!("Reserved file name: {}", name)));
            }
        }
        if self.circuit.entry_file(&self.files).is_none() {
            return Err(Error::InvalidInput(format!(
                "Entry file not found: {}",
                self.circuit.file
            )));
        }
        if !is_identifier(&self.circuit.template) {
            return Err(Error::InvalidInput(format!(
                "Invalid template name: {}",
                self.circuit.template
            )));
        }
        if let Some(bad) = self.circuit.pubs.iter().find(|p| !is_identifier(p)) {
            return Err(Error::InvalidInput(format!("Invalid public signal: {}", bad)));
        }
        KeySource::parse(self.final_zkey.as_deref())?;
        Ok(())
    }

    pub fn key_source(&self) -> Result<KeySource> {
        KeySource::parse(self.final_zkey.as_deref())
    }
}

/// Where proving key bytes come from. Exactly one variant is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    Absent,
    Inline(String),
    Url(Url),
}

impl KeySource {
    pub fn parse(final_zkey: Option<&str>) -> Result<Self> {
        let Some(raw) = final_zkey.map(str::trim) else {
            return Ok(KeySource::Absent);
        };
        if raw.is_empty() {
            return Ok(KeySource::Absent);
        }
        if raw.starts_with("https://") || raw.starts_with("http://") {
            return Ok(KeySource::Url(Url::parse(raw)?));
        }
        Ok(KeySource::Inline(raw.to_string()))
    }

    pub fn label(&self) -> &'static str {
        match self {
            KeySource::Absent => "absent",
            KeySource::Inline(_) => "inline",
            KeySource::Url(_) => "url",
        }
    }
}

/// Dimensions of a compiled constraint system, read from its header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitShape {
    /// Scalar field modulus, little-endian
    #[serde(with = "hex::serde")]
    pub prime: Vec<u8>,
    pub n_wires: u32,
    pub n_pub_out: u32,
    pub n_pub_in: u32,
    pub n_prv_in: u32,
    pub n_labels: u64,
    pub n_constraints: u32,
}

impl CircuitShape {
    pub fn n_public(&self) -> u32 {
        self.n_pub_out + self.n_pub_in
    }
}

/// Metadata record persisted as `info.json` next to every package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageInfo {
    pub pkg_name: String,
    pub request_id: String,
    pub protocol: Protocol,
    pub circom_path: String,
    pub circuit: CircuitSpec,
    pub shape: CircuitShape,
    /// `inline`, `url`, `universal` or `generated`
    pub key_origin: String,
    pub zkey_sha256: String,
    pub snarkjs_version: String,
    /// Unix time in milliseconds
    pub created_at: u64,
}

/// Synchronous answer handed back to the invoking runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResponse {
    pub status_code: u16,
    /// JSON-encoded body
    pub body: String,
}

impl BuildResponse {
    pub fn ok(pkg_name: &str) -> Self {
        Self::json(200, serde_json::json!({ "pkgName": pkg_name }))
    }

    pub fn bad_request(message: &str) -> Self {
        Self::json(400, serde_json::json!({ "error": message }))
    }

    /// Deep failures only point at the status log.
    pub fn build_failed(status_key: &str) -> Self {
        Self::json(
            500,
            serde_json::json!({ "error": "build failed", "status": status_key }),
        )
    }

    fn json(status_code: u16, body: serde_json::Value) -> Self {
        Self {
            status_code,
            body: body.to_string(),
        }
    }
}

pub(crate) fn is_safe_segment(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_SEGMENT_LEN
        && !s.starts_with('.')
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn is_safe_relative_path(s: &str) -> bool {
    !s.is_empty() && s.split('/').all(is_safe_segment)
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
