//! Key Material Resolver: obtains caller-supplied proving keys and refuses any
//! that do not belong to the circuit that was just compiled.

use crate::config::KeyFetchConfig;
use crate::error::{BuildError, Result};
use crate::formats::zkey::{self, ZkeyHeader};
use crate::types::{CircuitShape, KeySource, Protocol};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::Url;

/// How a protocol treats a caller-supplied key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPolicy {
    /// A valid key must be supplied.
    Required,
    /// Use a supplied key; without one the backend generates a development key.
    GenerateIfAbsent,
    /// Keys come from the universal setup; supplied bytes are not used.
    Ignored,
}

/// Proving key bytes that passed structural validation against a circuit.
/// Only [`validate`] constructs it, so holding one means the check ran.
#[derive(Debug, Clone)]
pub struct ResolvedKeyMaterial {
    bytes: Bytes,
    header: ZkeyHeader,
}

impl ResolvedKeyMaterial {
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn header(&self) -> &ZkeyHeader {
        &self.header
    }

    pub fn sha256_hex(&self) -> String {
        hex::encode(Sha256::digest(&self.bytes))
    }
}

/// Parses the key header and checks it against `protocol` and `shape`.
pub fn validate(
    bytes: Bytes,
    protocol: Protocol,
    shape: &CircuitShape,
) -> std::result::Result<ResolvedKeyMaterial, BuildError> {
    let header = zkey::read_header(&bytes).map_err(|e| BuildError::invalid_key(e.to_string()))?;
    zkey::check_consistency(&header, protocol, shape)
        .map_err(|e| BuildError::invalid_key(e.to_string()))?;
    Ok(ResolvedKeyMaterial { bytes, header })
}

#[derive(Debug, Clone)]
pub struct KeyResolver {
    client: reqwest::Client,
    config: KeyFetchConfig,
}

impl KeyResolver {
    pub fn new(config: &KeyFetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .https_only(!config.allow_http)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// Resolves the key for one build. `Ok(None)` means the protocol strategy
    /// supplies its own key material.
    pub async fn resolve(
        &self,
        source: &KeySource,
        policy: KeyPolicy,
        protocol: Protocol,
        shape: &CircuitShape,
    ) -> std::result::Result<Option<ResolvedKeyMaterial>, BuildError> {
        match (policy, source) {
            (KeyPolicy::Ignored, KeySource::Absent) => return Ok(None),
            (KeyPolicy::Ignored, other) => {
                warn!(%protocol, source = other.label(), "Ignoring finalZkey for universal-setup protocol");
                return Ok(None);
            }
            (KeyPolicy::Required, KeySource::Absent) => return Err(BuildError::MissingKeyMaterial),
            (KeyPolicy::GenerateIfAbsent, KeySource::Absent) => return Ok(None),
            _ => {}
        }

        let bytes = self.obtain(source).await?;
        debug!(%protocol, len = bytes.len(), source = source.label(), "Validating finalZkey");
        match validate(bytes, protocol, shape) {
            Ok(key) => {
                info!(%protocol, sha256 = %key.sha256_hex(), "finalZkey accepted");
                Ok(Some(key))
            }
            Err(e) => {
                if let BuildError::InvalidKeyMaterial { reason } = &e {
                    warn!(%protocol, %reason, "finalZkey rejected");
                }
                Err(e)
            }
        }
    }

    /// Raw bytes for an inline or remote source, without validation.
    pub async fn obtain(&self, source: &KeySource) -> std::result::Result<Bytes, BuildError> {
        match source {
            KeySource::Absent => Err(BuildError::MissingKeyMaterial),
            KeySource::Inline(encoded) => decode_inline(encoded),
            KeySource::Url(url) => self.fetch(url).await,
        }
    }

    async fn fetch(&self, url: &Url) -> std::result::Result<Bytes, BuildError> {
        let scheme_ok = url.scheme() == "https" || (self.config.allow_http && url.scheme() == "http");
        if !scheme_ok {
            return Err(BuildError::KeyFetchFailed(format!(
                "unsupported URL scheme: {}",
                url.scheme()
            )));
        }
        debug!(%url, "Fetching finalZkey");

        let fetch_failed = |e: reqwest::Error| BuildError::KeyFetchFailed(e.to_string());
        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(fetch_failed)?
            .error_for_status()
            .map_err(fetch_failed)?;

        let max = self.config.max_bytes;
        if let Some(len) = response.content_length() {
            if len > max {
                return Err(too_large(max));
            }
        }
        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await.map_err(fetch_failed)? {
            if (body.len() + chunk.len()) as u64 > max {
                return Err(too_large(max));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }
}

fn too_large(max: u64) -> BuildError {
    BuildError::KeyFetchFailed(format!("response exceeds {} bytes", max))
}

fn decode_inline(encoded: &str) -> std::result::Result<Bytes, BuildError> {
    let compact: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD
        .decode(compact.as_bytes())
        .map(Bytes::from)
        .map_err(|e| BuildError::invalid_key(format!("finalZkey is not base64: {}", e)))
}
