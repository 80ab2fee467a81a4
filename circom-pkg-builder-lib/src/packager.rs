//! Artifact Packager: names the package, renders the JS glue around the
//! artifacts, and persists the four package objects.

use crate::error::{BuildError, Result};
use crate::protocol::{self, BuildArtifactSet, FINAL_ZKEY, VERIFICATION_KEY_JSON};
use crate::state::PackageIndex;
use crate::storage::{INFO_JSON, ObjectStore, PKG_ZIP, SOURCE_ZIP, VERIFIER_SOL, package_key};
use crate::types::{BuildRequest, CircuitShape, ENTRY_WRAPPER_STEM, PackageInfo, SourceFile};
use rand::RngCore;
use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

const PACKAGE_JSON_TEMPLATE: &str = include_str!("../templates/package.json.tmpl");
const INDEX_JS_TEMPLATE: &str = include_str!("../templates/index.js.tmpl");
/// `exportSolidityCallData` prints comma-separated JSON values for every
/// protocol, in the order the verifier's `verifyProof` takes them.
const CALLDATA_DECODER: &str = include_str!("../templates/calldata.js.tmpl");

const NAME_SUFFIX_BYTES: usize = 6;
/// npm rejects longer package names.
pub const MAX_PACKAGE_NAME_LEN: usize = 214;
const NAME_ATTEMPTS: usize = 8;

/// A persisted package. Its objects are never rewritten.
#[derive(Debug, Clone)]
pub struct Package {
    pub name: String,
    pub info: PackageInfo,
    /// Store keys in the order they were written; `info.json` is last.
    pub object_keys: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Packager {
    store: Arc<dyn ObjectStore>,
    index: PackageIndex,
    prefix: String,
    snarkjs_version: String,
}

impl Packager {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        index: PackageIndex,
        prefix: &str,
        snarkjs_version: &str,
    ) -> Self {
        Self {
            store,
            index,
            prefix: prefix.to_string(),
            snarkjs_version: snarkjs_version.to_string(),
        }
    }

    pub async fn assemble(
        &self,
        request: &BuildRequest,
        shape: &CircuitShape,
        artifacts: &BuildArtifactSet,
    ) -> std::result::Result<Package, BuildError> {
        let name = self.reserve_name(&request.circuit.template, &request.request_id)?;
        let info = PackageInfo {
            pkg_name: name.clone(),
            request_id: request.request_id.clone(),
            protocol: artifacts.protocol,
            circom_path: request.circom_path.clone(),
            circuit: request.circuit.clone(),
            shape: shape.clone(),
            key_origin: artifacts.key_origin.as_str().to_string(),
            zkey_sha256: artifacts.proving_key.sha256_hex(),
            snarkjs_version: self.snarkjs_version.clone(),
            created_at: now_millis(),
        };

        let objects = match self.render_objects(&name, request, artifacts, &info) {
            Ok(objects) => objects,
            Err(e) => {
                self.release(&name);
                return Err(BuildError::package(e));
            }
        };

        let mut written = Vec::with_capacity(objects.len());
        for (object, bytes, content_type) in objects {
            let key = package_key(&name, object);
            debug!(%key, len = bytes.len(), "Writing package object");
            if let Err(e) = self.store.put(&key, bytes, content_type).await {
                self.rollback(&name, &written).await;
                return Err(BuildError::package(e));
            }
            written.push(key);
        }

        if let Err(e) = self.index.publish(&info) {
            self.rollback(&name, &written).await;
            return Err(BuildError::package(e));
        }
        info!(pkg_name = %name, "Package published");
        Ok(Package {
            name,
            info,
            object_keys: written,
        })
    }

    fn reserve_name(&self, template: &str, request_id: &str) -> std::result::Result<String, BuildError> {
        for _ in 0..NAME_ATTEMPTS {
            let name = package_name(&self.prefix, template, request_id);
            if self
                .index
                .reserve(&name, request_id)
                .map_err(BuildError::package)?
            {
                return Ok(name);
            }
            debug!(%name, "Package name collision, retrying");
        }
        Err(BuildError::PackageError(
            "could not reserve a unique package name".to_string(),
        ))
    }

    /// Objects in write order. `info.json` goes last so that its presence
    /// marks a complete package.
    fn render_objects(
        &self,
        name: &str,
        request: &BuildRequest,
        artifacts: &BuildArtifactSet,
        info: &PackageInfo,
    ) -> Result<Vec<(&'static str, Vec<u8>, &'static str)>> {
        Ok(vec![
            (SOURCE_ZIP, source_archive(&request.files)?, "application/zip"),
            (
                VERIFIER_SOL,
                artifacts.verifier_contract.clone().into_bytes(),
                "text/plain",
            ),
            (
                PKG_ZIP,
                self.package_archive(name, &request.circuit.template, artifacts)?,
                "application/zip",
            ),
            (INFO_JSON, serde_json::to_vec_pretty(info)?, "application/json"),
        ])
    }

    fn package_archive(
        &self,
        name: &str,
        template: &str,
        artifacts: &BuildArtifactSet,
    ) -> Result<Vec<u8>> {
        let strategy = protocol::strategy(artifacts.protocol);
        let mut entries: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        entries.insert(
            "package.json".to_string(),
            render_package_json(name, template, artifacts.protocol.as_str(), &self.snarkjs_version)
                .into_bytes(),
        );
        entries.insert(
            "index.js".to_string(),
            render_index_js(artifacts.protocol.as_str()).into_bytes(),
        );
        entries.insert(
            format!("build/circuits/{}.wasm", ENTRY_WRAPPER_STEM),
            artifacts.witness_generator.to_vec(),
        );
        entries.insert(
            format!("build/circuits/{}", FINAL_ZKEY),
            artifacts.proving_key.bytes().to_vec(),
        );
        entries.insert(
            format!("build/circuits/{}", VERIFICATION_KEY_JSON),
            artifacts.verification_key.to_vec(),
        );
        entries.insert(
            verifier_entry(artifacts.protocol.as_str(), strategy.verifier_contract),
            artifacts.verifier_contract.clone().into_bytes(),
        );
        zip_entries(&entries)
    }

    async fn rollback(&self, name: &str, written: &[String]) {
        for key in written.iter().rev() {
            if let Err(e) = self.store.delete(key).await {
                warn!(%key, error = %e, "Failed to remove partial package object");
            }
        }
        self.release(name);
    }

    fn release(&self, name: &str) {
        if let Err(e) = self.index.release(name) {
            warn!(pkg_name = %name, error = %e, "Failed to release package name");
        }
    }
}

/// Verifier contract location inside the package, namespaced by protocol.
pub fn verifier_entry(protocol: &str, contract: &str) -> String {
    format!("contracts/{}/{}.sol", protocol, contract)
}

/// `<prefix>-<template>-<requestId>-<12 hex chars>`, npm-safe. The template
/// segment is cut short when the whole name would exceed npm's limit.
pub fn package_name(prefix: &str, template: &str, request_id: &str) -> String {
    let mut suffix = [0u8; NAME_SUFFIX_BYTES];
    rand::thread_rng().fill_bytes(&mut suffix);
    let fixed = prefix.len() + request_id.len() + 2 * NAME_SUFFIX_BYTES + 3;
    let template_budget = MAX_PACKAGE_NAME_LEN.saturating_sub(fixed);
    let template: String = template.chars().take(template_budget).collect();
    let raw = format!("{}-{}-{}-{}", prefix, template, request_id, hex::encode(suffix));
    raw.chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '-') => c,
            _ => '-',
        })
        .collect()
}

fn render_package_json(name: &str, template: &str, protocol: &str, snarkjs_version: &str) -> String {
    PACKAGE_JSON_TEMPLATE
        .replace("{{PKG_NAME}}", name)
        .replace("{{TEMPLATE}}", template)
        .replace("{{PROTOCOL}}", protocol)
        .replace("{{SNARKJS_VERSION}}", snarkjs_version)
}

fn render_index_js(protocol: &str) -> String {
    INDEX_JS_TEMPLATE
        .replace("{{CALLDATA}}", CALLDATA_DECODER.trim_end())
        .replace("{{PROTOCOL}}", protocol)
        .replace("{{WASM}}", &format!("{}.wasm", ENTRY_WRAPPER_STEM))
        .replace("{{ZKEY}}", FINAL_ZKEY)
        .replace("{{VKEY}}", VERIFICATION_KEY_JSON)
}

/// The caller's sources, as submitted.
pub fn source_archive(files: &BTreeMap<String, SourceFile>) -> Result<Vec<u8>> {
    let entries: BTreeMap<String, Vec<u8>> = files
        .iter()
        .map(|(name, file)| (name.clone(), file.code.clone().into_bytes()))
        .collect();
    zip_entries(&entries)
}

/// Zips `entries` in key order with a fixed timestamp, so equal inputs give
/// equal archives.
pub fn zip_entries(entries: &BTreeMap<String, Vec<u8>>) -> Result<Vec<u8>> {
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
        .unix_permissions(0o644);
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, bytes) in entries {
        writer.start_file(name.as_str(), options)?;
        writer.write_all(bytes)?;
    }
    Ok(writer.finish()?.into_inner())
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
