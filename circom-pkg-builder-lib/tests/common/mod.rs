#![allow(dead_code)]

use circom_pkg_builder_lib::backend::SnarkBackend;
use circom_pkg_builder_lib::compiler::{self, BuildWorkspace, CircuitCompiler, CompiledCircuit};
use circom_pkg_builder_lib::config::BuilderConfig;
use circom_pkg_builder_lib::error::{BuildError, Result};
use circom_pkg_builder_lib::formats::zkey;
use circom_pkg_builder_lib::protocol;
use circom_pkg_builder_lib::storage::{FsObjectStore, ObjectStore};
use circom_pkg_builder_lib::types::{CircuitShape, CircuitSpec, Protocol, SourceFile};
use circom_pkg_builder_lib::{BuildContext, PackageIndex};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const CIRCOM_PATH: &str = "circom-v2.1.8";

pub const MULTIPLIER_SRC: &str = r#"pragma circom 2.1.8;

template Multiplier(n) {
    signal input in[n];
    signal output out;
    signal acc[n];
    acc[0] <== in[0];
    for (var i = 1; i < n; i++) {
        acc[i] <== acc[i - 1] * in[i];
    }
    out <== acc[n - 1];
}
"#;

/// BN254 scalar field modulus, little-endian.
pub const BN254_R: [u8; 32] = [
    0x01, 0x00, 0x00, 0xf0, 0x93, 0xf5, 0xe1, 0x43, 0x91, 0x70, 0xb9, 0x79, 0x48, 0xe8, 0x33, 0x28,
    0x5d, 0x58, 0x81, 0x81, 0xb6, 0x45, 0x50, 0xb8, 0x29, 0xa0, 0x31, 0xe1, 0x72, 0x4e, 0x64, 0x30,
];

const BN254_Q: [u8; 32] = [
    0x47, 0xfd, 0x7c, 0xd8, 0x16, 0x8c, 0x20, 0x3c, 0x8d, 0xca, 0x71, 0x68, 0x91, 0x6a, 0x81, 0x97,
    0x5d, 0x58, 0x81, 0x81, 0xb6, 0x45, 0x50, 0xb8, 0x29, 0xa0, 0x31, 0xe1, 0x72, 0x4e, 0x64, 0x30,
];

/// Header of `Multiplier(2)`: one constraint, one public output, two private inputs.
pub fn multiplier_shape() -> CircuitShape {
    CircuitShape {
        prime: BN254_R.to_vec(),
        n_wires: 4,
        n_pub_out: 1,
        n_pub_in: 0,
        n_prv_in: 2,
        n_labels: 4,
        n_constraints: 1,
    }
}

fn binfile(magic: &[u8; 4], sections: &[(u32, Vec<u8>)]) -> Vec<u8> {
    let mut out = magic.to_vec();
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&(sections.len() as u32).to_le_bytes());
    for (id, body) in sections {
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&(body.len() as u64).to_le_bytes());
        out.extend_from_slice(body);
    }
    out
}

pub fn encode_r1cs(shape: &CircuitShape) -> Vec<u8> {
    let mut header = Vec::new();
    header.extend_from_slice(&(shape.prime.len() as u32).to_le_bytes());
    header.extend_from_slice(&shape.prime);
    for v in [shape.n_wires, shape.n_pub_out, shape.n_pub_in, shape.n_prv_in] {
        header.extend_from_slice(&v.to_le_bytes());
    }
    header.extend_from_slice(&shape.n_labels.to_le_bytes());
    header.extend_from_slice(&shape.n_constraints.to_le_bytes());
    binfile(b"r1cs", &[(1, header)])
}

/// Proving key carrying the sections the validator reads.
pub fn encode_zkey(protocol: Protocol, shape: &CircuitShape) -> Vec<u8> {
    let gates = shape.n_constraints + shape.n_public();
    let domain = match protocol {
        Protocol::Groth16 => zkey::groth16_domain_size(shape) as u32,
        _ => (gates as u64).next_power_of_two() as u32,
    };
    let mut header = Vec::new();
    header.extend_from_slice(&32u32.to_le_bytes());
    header.extend_from_slice(&BN254_Q);
    header.extend_from_slice(&32u32.to_le_bytes());
    header.extend_from_slice(&BN254_R);
    header.extend_from_slice(&shape.n_wires.to_le_bytes());
    header.extend_from_slice(&shape.n_public().to_le_bytes());
    header.extend_from_slice(&domain.to_le_bytes());
    if protocol != Protocol::Groth16 {
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&gates.to_le_bytes());
    }
    let tag = zkey::protocol_tag(protocol).to_le_bytes().to_vec();
    let mut sections = vec![(1, tag), (2, header)];
    if protocol == Protocol::Groth16 {
        sections.push((4, encode_coeffs(shape)));
    }
    binfile(b"zkey", &sections)
}

/// groth16 A-matrix rows: one per constraint, then one per public signal
/// and the constant.
fn encode_coeffs(shape: &CircuitShape) -> Vec<u8> {
    let rows = shape.n_constraints + shape.n_public() + 1;
    let mut out = rows.to_le_bytes().to_vec();
    for row in 0..rows {
        let signal = row.saturating_sub(shape.n_constraints);
        for v in [0, row, signal] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        let mut value = [0u8; 32];
        value[0] = 1;
        out.extend_from_slice(&value);
    }
    out
}

/// Stages sources like the real compiler, then emits canned outputs.
#[derive(Debug)]
pub struct FakeCompiler {
    pub shape: CircuitShape,
    /// When set, every compile fails with this diagnostic.
    pub diagnostic: Option<String>,
}

impl FakeCompiler {
    pub fn new() -> Self {
        Self {
            shape: multiplier_shape(),
            diagnostic: None,
        }
    }

    pub fn failing(diagnostic: &str) -> Self {
        Self {
            shape: multiplier_shape(),
            diagnostic: Some(diagnostic.to_string()),
        }
    }
}

impl CircuitCompiler for FakeCompiler {
    fn has_version(&self, circom_path: &str) -> bool {
        circom_path == CIRCOM_PATH
    }

    fn compile<'a>(
        &'a self,
        files: &'a BTreeMap<String, SourceFile>,
        circuit: &'a CircuitSpec,
        circom_path: &'a str,
        workspace: &'a BuildWorkspace,
    ) -> BoxFuture<'a, std::result::Result<CompiledCircuit, BuildError>> {
        async move {
            compiler::stage_sources(files, circuit, circom_path, workspace)
                .await
                .map_err(|e| BuildError::CompileError(e.to_string()))?;
            if let Some(diagnostic) = &self.diagnostic {
                return Err(BuildError::CompileError(diagnostic.clone()));
            }
            std::fs::write(workspace.r1cs_path(), encode_r1cs(&self.shape))
                .map_err(|e| BuildError::CompileError(e.to_string()))?;
            let wasm = workspace.wasm_path();
            std::fs::create_dir_all(wasm.parent().unwrap()).unwrap();
            std::fs::write(&wasm, b"\0asm\x01\0\0\0").unwrap();
            compiler::read_outputs(workspace).await
        }
        .boxed()
    }
}

/// Writes well-formed keys and protocol-specific verifier templates.
#[derive(Debug)]
pub struct FakeBackend {
    pub shape: CircuitShape,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            shape: multiplier_shape(),
        }
    }
}

fn key_protocol(zkey_path: &Path) -> Result<Protocol> {
    let bytes = std::fs::read(zkey_path)?;
    Ok(zkey::read_header(&bytes)?.protocol)
}

impl SnarkBackend for FakeBackend {
    fn setup<'a>(
        &'a self,
        protocol: Protocol,
        _r1cs: &'a Path,
        _ptau: &'a Path,
        zkey_out: &'a Path,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            std::fs::write(zkey_out, encode_zkey(protocol, &self.shape))?;
            Ok(())
        }
        .boxed()
    }

    fn contribute<'a>(
        &'a self,
        zkey_in: &'a Path,
        zkey_out: &'a Path,
        _entropy: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            std::fs::copy(zkey_in, zkey_out)?;
            Ok(())
        }
        .boxed()
    }

    fn export_verification_key<'a>(
        &'a self,
        zkey: &'a Path,
        out: &'a Path,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let protocol = key_protocol(zkey)?;
            let vkey = json!({ "protocol": protocol.as_str(), "curve": "bn128", "nPublic": 1 });
            std::fs::write(out, serde_json::to_vec_pretty(&vkey)?)?;
            Ok(())
        }
        .boxed()
    }

    fn export_solidity_verifier<'a>(
        &'a self,
        zkey: &'a Path,
        out: &'a Path,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let protocol = key_protocol(zkey)?;
            let name = protocol::strategy(protocol).verifier_contract;
            let params = match protocol {
                Protocol::Groth16 => {
                    "uint[2] calldata _pA, uint[2][2] calldata _pB, uint[2] calldata _pC, uint[1] calldata _pubSignals"
                }
                Protocol::Plonk => "uint256[24] calldata _proof, uint256[1] calldata _pubSignals",
                Protocol::Fflonk => "bytes32[24] calldata proof, uint256[1] calldata pubSignals",
            };
            let src = format!(
                "// SPDX-License-Identifier: GPL-3.0\npragma solidity >=0.7.0 <0.9.0;\n\ncontract {} {{\n    function verifyProof({}) public view returns (bool) {{\n        return true;\n    }}\n}}\n",
                name, params
            );
            std::fs::write(out, src)?;
            Ok(())
        }
        .boxed()
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub ctx: BuildContext,
    pub store: Arc<FsObjectStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_compiler(FakeCompiler::new(), |_| {})
    }

    pub fn with_compiler(compiler: FakeCompiler, tweak: impl FnOnce(&mut BuilderConfig)) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let ptau_dir = dir.path().join("ptau");
        std::fs::create_dir_all(&ptau_dir).unwrap();
        std::fs::write(ptau_dir.join("powersOfTau28_hez_final_12.ptau"), b"").unwrap();

        let mut config = BuilderConfig::default();
        config.data_dir = dir.path().join("data");
        config.work_dir = Some(dir.path().join("work"));
        config.ptau_dir = ptau_dir;
        config.max_concurrent_builds = 2;
        config.key_fetch.allow_http = true;
        config.key_fetch.timeout_secs = 5;
        tweak(&mut config);

        let store = Arc::new(
            FsObjectStore::new(dir.path().join("store"), Duration::from_secs(5)).unwrap(),
        );
        let ctx = BuildContext::with_parts(
            config,
            store.clone(),
            Arc::new(compiler),
            Arc::new(FakeBackend::new()),
            PackageIndex::temporary().unwrap(),
        )
        .unwrap();
        Self { dir, ctx, store }
    }

    pub async fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.store.get(key).await.unwrap()
    }

    /// Files left under the per-request work root.
    pub fn leftover_workspaces(&self) -> usize {
        match std::fs::read_dir(self.dir.path().join("work")) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }
}

pub fn build_event(request_id: &str, protocol: Protocol, final_zkey: Option<String>) -> Value {
    let mut payload = json!({
        "requestId": request_id,
        "action": "build",
        "files": { "multiplier.circom": { "code": MULTIPLIER_SRC } },
        "circomPath": CIRCOM_PATH,
        "protocol": protocol.as_str(),
        "circuit": { "file": "multiplier", "template": "Multiplier", "params": [2], "pubs": [] }
    });
    if let Some(key) = final_zkey {
        payload["finalZkey"] = Value::String(key);
    }
    json!({ "payload": payload })
}

pub fn body(response: &circom_pkg_builder_lib::BuildResponse) -> Value {
    serde_json::from_str(&response.body).unwrap()
}

pub fn zip_entry(zip_bytes: &[u8], name: &str) -> Vec<u8> {
    let mut archive = zip::ZipArchive::new(Cursor::new(zip_bytes)).unwrap();
    let mut out = Vec::new();
    archive
        .by_name(name)
        .unwrap_or_else(|e| panic!("missing {}: {}", name, e))
        .read_to_end(&mut out)
        .unwrap();
    out
}

pub fn zip_names(zip_bytes: &[u8]) -> Vec<String> {
    let archive = zip::ZipArchive::new(Cursor::new(zip_bytes)).unwrap();
    let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
    names.sort();
    names
}
