//! Protocol Strategy: the per-protocol policy table and the steps that turn a
//! compiled circuit into final key material and a verifier contract.

use crate::backend::{PtauCatalog, SnarkBackend, ceil_log2};
use crate::compiler::{BuildWorkspace, CompiledCircuit};
use crate::error::BuildError;
use crate::keys::{self, KeyPolicy, ResolvedKeyMaterial};
use crate::types::{CircuitShape, Protocol};
use bytes::Bytes;
use rand::RngCore;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const FINAL_ZKEY: &str = "circuit_final.zkey";
pub const VERIFICATION_KEY_JSON: &str = "verification_key.json";
const INITIAL_ZKEY: &str = "circuit_0000.zkey";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolStrategy {
    pub protocol: Protocol,
    /// Per-circuit key material must come from the caller.
    pub requires_key_material: bool,
    /// Name of the contract the verifier template declares.
    pub verifier_contract: &'static str,
    /// Extra universal-setup powers needed beyond the circuit size.
    pub ptau_headroom: u32,
}

static STRATEGIES: [ProtocolStrategy; 3] = [
    ProtocolStrategy {
        protocol: Protocol::Groth16,
        requires_key_material: true,
        verifier_contract: "Groth16Verifier",
        ptau_headroom: 0,
    },
    ProtocolStrategy {
        protocol: Protocol::Plonk,
        requires_key_material: false,
        verifier_contract: "PlonkVerifier",
        ptau_headroom: 1,
    },
    ProtocolStrategy {
        protocol: Protocol::Fflonk,
        requires_key_material: false,
        verifier_contract: "FflonkVerifier",
        ptau_headroom: 4,
    },
];

pub fn strategy(protocol: Protocol) -> &'static ProtocolStrategy {
    match protocol {
        Protocol::Groth16 => &STRATEGIES[0],
        Protocol::Plonk => &STRATEGIES[1],
        Protocol::Fflonk => &STRATEGIES[2],
    }
}

/// Where the final proving key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrigin {
    Inline,
    Url,
    /// Derived from a universal setup file.
    Universal,
    /// Single-contributor groth16 setup; development use only.
    Generated,
}

impl KeyOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyOrigin::Inline => "inline",
            KeyOrigin::Url => "url",
            KeyOrigin::Universal => "universal",
            KeyOrigin::Generated => "generated",
        }
    }
}

/// Validated proving key written into the workspace.
#[derive(Debug, Clone)]
pub struct ProvingKey {
    pub path: PathBuf,
    pub material: ResolvedKeyMaterial,
    pub origin: KeyOrigin,
}

/// Everything the packager needs. Immutable once produced.
#[derive(Debug, Clone)]
pub struct BuildArtifactSet {
    pub protocol: Protocol,
    pub proving_key: ResolvedKeyMaterial,
    pub key_origin: KeyOrigin,
    pub verification_key: Bytes,
    pub witness_generator: Bytes,
    pub verifier_contract: String,
}

impl ProtocolStrategy {
    pub fn key_policy(&self, allow_unsafe_setup: bool) -> KeyPolicy {
        match (self.requires_key_material, allow_unsafe_setup) {
            (false, _) => KeyPolicy::Ignored,
            (true, false) => KeyPolicy::Required,
            (true, true) => KeyPolicy::GenerateIfAbsent,
        }
    }

    /// Smallest universal setup power that can hold this circuit.
    pub fn required_ptau_power(&self, shape: &CircuitShape) -> u32 {
        let public = shape.n_public() as u64;
        let points = match self.protocol {
            Protocol::Groth16 => shape.n_constraints as u64 + public + 1,
            Protocol::Plonk | Protocol::Fflonk => shape.n_constraints as u64 + public,
        };
        ceil_log2(points) + self.ptau_headroom
    }

    fn select_ptau<'c>(
        &self,
        catalog: &'c PtauCatalog,
        shape: &CircuitShape,
    ) -> Result<&'c Path, BuildError> {
        let power = self.required_ptau_power(shape);
        match catalog.select(power) {
            Some((found, path)) => {
                debug!(protocol = %self.protocol, required = power, found, "Selected universal setup");
                Ok(path)
            }
            None => Err(BuildError::SetupError(format!(
                "circuit too large for available setup: needs power {}, largest available is {}",
                power,
                catalog
                    .largest()
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "none".to_string())
            ))),
        }
    }

    /// Produces the final proving key for `compiled`.
    ///
    /// A supplied key is used as is. Otherwise the backend derives one from the
    /// universal setup, and the result goes through the same header checks as
    /// caller-supplied keys.
    pub async fn reduce(
        &self,
        backend: &dyn SnarkBackend,
        catalog: &PtauCatalog,
        compiled: &CompiledCircuit,
        supplied: Option<(ResolvedKeyMaterial, KeyOrigin)>,
        workspace: &BuildWorkspace,
    ) -> Result<ProvingKey, BuildError> {
        let final_path = workspace.keys_dir().join(FINAL_ZKEY);

        if let Some((material, origin)) = supplied {
            if self.protocol != material.header().protocol {
                return Err(BuildError::invalid_key("protocol tag does not match request"));
            }
            tokio::fs::write(&final_path, material.bytes())
                .await
                .map_err(BuildError::setup)?;
            info!(protocol = %self.protocol, origin = origin.as_str(), "Using supplied proving key");
            return Ok(ProvingKey {
                path: final_path,
                material,
                origin,
            });
        }

        let ptau = self.select_ptau(catalog, &compiled.shape)?;
        let origin = if self.requires_key_material {
            warn!(protocol = %self.protocol, "Running single-contributor setup; key is not production safe");
            let initial = workspace.keys_dir().join(INITIAL_ZKEY);
            backend
                .setup(self.protocol, &compiled.r1cs_path, ptau, &initial)
                .await
                .map_err(BuildError::setup)?;
            backend
                .contribute(&initial, &final_path, &fresh_entropy())
                .await
                .map_err(BuildError::setup)?;
            KeyOrigin::Generated
        } else {
            backend
                .setup(self.protocol, &compiled.r1cs_path, ptau, &final_path)
                .await
                .map_err(BuildError::setup)?;
            KeyOrigin::Universal
        };

        let bytes = tokio::fs::read(&final_path).await.map_err(BuildError::setup)?;
        let material = keys::validate(Bytes::from(bytes), self.protocol, &compiled.shape)
            .map_err(|e| match e {
                BuildError::InvalidKeyMaterial { reason } => {
                    BuildError::SetupError(format!("backend produced an unusable key: {}", reason))
                }
                other => other,
            })?;
        info!(protocol = %self.protocol, origin = origin.as_str(), "Generated proving key");
        Ok(ProvingKey {
            path: final_path,
            material,
            origin,
        })
    }

    /// Fills this protocol's verifier template for `key`.
    pub async fn generate_verifier_contract(
        &self,
        backend: &dyn SnarkBackend,
        key: &ProvingKey,
        workspace: &BuildWorkspace,
    ) -> Result<String, BuildError> {
        let out = workspace
            .keys_dir()
            .join(format!("{}_verifier.sol", self.protocol));
        backend
            .export_solidity_verifier(&key.path, &out)
            .await
            .map_err(BuildError::setup)?;
        let source = tokio::fs::read_to_string(&out)
            .await
            .map_err(BuildError::setup)?;
        self.check_verifier_contract(&source)?;
        Ok(source)
    }

    fn check_verifier_contract(&self, source: &str) -> Result<(), BuildError> {
        let declares = format!("contract {}", self.verifier_contract);
        if !source.contains(&declares) || !source.contains("function verifyProof(") {
            return Err(BuildError::SetupError(format!(
                "verifier template does not declare {}.verifyProof",
                self.verifier_contract
            )));
        }
        Ok(())
    }

    /// Runs every exporter and collects the immutable artifact set.
    pub async fn export_artifacts(
        &self,
        backend: &dyn SnarkBackend,
        compiled: &CompiledCircuit,
        key: ProvingKey,
        workspace: &BuildWorkspace,
    ) -> Result<BuildArtifactSet, BuildError> {
        let vkey_path = workspace.keys_dir().join(VERIFICATION_KEY_JSON);
        backend
            .export_verification_key(&key.path, &vkey_path)
            .await
            .map_err(BuildError::setup)?;
        let verification_key = tokio::fs::read(&vkey_path).await.map_err(BuildError::setup)?;
        serde_json::from_slice::<serde_json::Value>(&verification_key).map_err(|e| {
            BuildError::SetupError(format!("verification key is not JSON: {}", e))
        })?;

        let verifier_contract = self.generate_verifier_contract(backend, &key, workspace).await?;
        let witness_generator = tokio::fs::read(&compiled.wasm_path)
            .await
            .map_err(BuildError::setup)?;

        Ok(BuildArtifactSet {
            protocol: self.protocol,
            proving_key: key.material,
            key_origin: key.origin,
            verification_key: Bytes::from(verification_key),
            witness_generator: Bytes::from(witness_generator),
            verifier_contract,
        })
    }
}

fn fresh_entropy() -> String {
    let mut buf = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}
