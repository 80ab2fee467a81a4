//! Circuit Compiler Invoker: stages sources into a per-request workspace and
//! drives the selected circom release over them.

use crate::error::{BuildError, Result};
use crate::formats::r1cs;
use crate::process;
use crate::types::{CircuitShape, CircuitSpec, ENTRY_WRAPPER_STEM, SourceFile};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info};

const SRC_DIR: &str = "src";
const OUT_DIR: &str = "out";
const KEYS_DIR: &str = "keys";

/// Scratch directory owned by one request. Everything below it is removed
/// when the workspace is dropped, whether the build succeeded or not.
#[derive(Debug)]
pub struct BuildWorkspace {
    dir: TempDir,
}

impl BuildWorkspace {
    /// Creates `zkpkg-<requestId>-*` under `root`, or under the system temp dir.
    pub fn create(root: Option<&Path>, request_id: &str) -> Result<Self> {
        let prefix = format!("zkpkg-{}-", request_id);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        for sub in [SRC_DIR, OUT_DIR, KEYS_DIR] {
            std::fs::create_dir(dir.path().join(sub))?;
        }
        debug!(path = %dir.path().display(), "Created build workspace");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Submitted sources plus the generated entry wrapper.
    pub fn src_dir(&self) -> PathBuf {
        self.dir.path().join(SRC_DIR)
    }

    /// Compiler output.
    pub fn out_dir(&self) -> PathBuf {
        self.dir.path().join(OUT_DIR)
    }

    /// Intermediate and final proving keys.
    pub fn keys_dir(&self) -> PathBuf {
        self.dir.path().join(KEYS_DIR)
    }

    pub fn r1cs_path(&self) -> PathBuf {
        self.out_dir().join(format!("{}.r1cs", ENTRY_WRAPPER_STEM))
    }

    pub fn wasm_path(&self) -> PathBuf {
        self.out_dir()
            .join(format!("{}_js", ENTRY_WRAPPER_STEM))
            .join(format!("{}.wasm", ENTRY_WRAPPER_STEM))
    }
}

/// Constraint system and witness generator produced for one request.
#[derive(Debug, Clone)]
pub struct CompiledCircuit {
    pub r1cs_path: PathBuf,
    pub wasm_path: PathBuf,
    pub shape: CircuitShape,
}

pub trait CircuitCompiler: Send + Sync + fmt::Debug {
    /// Whether `circom_path` names an installed compiler release.
    fn has_version(&self, circom_path: &str) -> bool;

    fn compile<'a>(
        &'a self,
        files: &'a BTreeMap<String, SourceFile>,
        circuit: &'a CircuitSpec,
        circom_path: &'a str,
        workspace: &'a BuildWorkspace,
    ) -> BoxFuture<'a, std::result::Result<CompiledCircuit, BuildError>>;
}

/// Runs `<compilers_dir>/<circomPath>` as a child process.
#[derive(Debug, Clone)]
pub struct CircomCompiler {
    compilers_dir: PathBuf,
    include_dirs: Vec<PathBuf>,
    timeout: Duration,
}

impl CircomCompiler {
    pub fn new(compilers_dir: PathBuf, include_dirs: Vec<PathBuf>, timeout: Duration) -> Self {
        Self {
            compilers_dir,
            include_dirs,
            timeout,
        }
    }

    fn binary(&self, circom_path: &str) -> PathBuf {
        self.compilers_dir.join(circom_path)
    }

    async fn run(
        &self,
        files: &BTreeMap<String, SourceFile>,
        circuit: &CircuitSpec,
        circom_path: &str,
        workspace: &BuildWorkspace,
    ) -> std::result::Result<CompiledCircuit, BuildError> {
        let wrapper = stage_sources(files, circuit, circom_path, workspace)
            .await
            .map_err(|e| BuildError::CompileError(format!("failed to stage sources: {}", e)))?;

        let src_dir = workspace.src_dir();
        let mut command = Command::new(self.binary(circom_path));
        command
            .current_dir(&src_dir)
            .arg(&wrapper)
            .args(["--r1cs", "--wasm", "-o"])
            .arg(workspace.out_dir())
            .arg("-l")
            .arg(&src_dir);
        for dir in &self.include_dirs {
            command.arg("-l").arg(dir);
        }

        info!(circom_path, template = %circuit.template, "Compiling circuit");
        let output = process::run(command, self.timeout)
            .await
            .map_err(|e| BuildError::CompileError(e.to_string()))?;
        if !output.status.success() {
            return Err(BuildError::CompileError(process::diagnostic(&output)));
        }
        read_outputs(workspace).await
    }
}

impl CircuitCompiler for CircomCompiler {
    fn has_version(&self, circom_path: &str) -> bool {
        self.binary(circom_path).is_file()
    }

    fn compile<'a>(
        &'a self,
        files: &'a BTreeMap<String, SourceFile>,
        circuit: &'a CircuitSpec,
        circom_path: &'a str,
        workspace: &'a BuildWorkspace,
    ) -> BoxFuture<'a, std::result::Result<CompiledCircuit, BuildError>> {
        self.run(files, circuit, circom_path, workspace).boxed()
    }
}

/// Writes the submitted files and the entry wrapper into `src/`. Returns the
/// wrapper's path.
pub async fn stage_sources(
    files: &BTreeMap<String, SourceFile>,
    circuit: &CircuitSpec,
    circom_path: &str,
    workspace: &BuildWorkspace,
) -> Result<PathBuf> {
    let src_dir = workspace.src_dir();
    for (name, file) in files {
        let path = src_dir.join(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &file.code).await?;
    }

    let entry = circuit.entry_file(files).ok_or_else(|| {
        crate::error::Error::InvalidInput(format!("Entry file not found: {}", circuit.file))
    })?;
    let wrapper = src_dir.join(format!("{}.circom", ENTRY_WRAPPER_STEM));
    tokio::fs::write(&wrapper, entry_wrapper(circuit, entry, circom_path)).await?;
    Ok(wrapper)
}

/// Reads the constraint system header and checks the witness generator exists.
pub async fn read_outputs(
    workspace: &BuildWorkspace,
) -> std::result::Result<CompiledCircuit, BuildError> {
    let r1cs_path = workspace.r1cs_path();
    let wasm_path = workspace.wasm_path();
    let bytes = tokio::fs::read(&r1cs_path).await.map_err(|e| {
        BuildError::CompileError(format!("compiler produced no constraint system: {}", e))
    })?;
    let shape = r1cs::read_shape(&bytes)
        .map_err(|e| BuildError::CompileError(format!("malformed constraint system: {}", e)))?;
    if !tokio::fs::try_exists(&wasm_path).await.unwrap_or(false) {
        return Err(BuildError::CompileError(
            "compiler produced no witness generator".to_string(),
        ));
    }
    debug!(
        constraints = shape.n_constraints,
        public = shape.n_public(),
        "Read constraint system header"
    );
    Ok(CompiledCircuit {
        r1cs_path,
        wasm_path,
        shape,
    })
}

/// Source of the generated main file that instantiates the requested template.
pub fn entry_wrapper(circuit: &CircuitSpec, entry_file: &str, circom_path: &str) -> String {
    let mut out = String::new();
    if let Some(version) = pragma_version(circom_path) {
        out.push_str(&format!("pragma circom {};\n\n", version));
    }
    out.push_str(&format!("include \"{}\";\n\n", entry_file));

    let params = circuit
        .params
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    if circuit.pubs.is_empty() {
        out.push_str(&format!(
            "component main = {}({});\n",
            circuit.template, params
        ));
    } else {
        out.push_str(&format!(
            "component main {{public [{}]}} = {}({});\n",
            circuit.pubs.join(", "),
            circuit.template,
            params
        ));
    }
    out
}

/// `circom-v2.1.8` -> `2.1.8`
fn pragma_version(circom_path: &str) -> Option<&str> {
    let version = circom_path.strip_prefix("circom-v")?;
    let parts: Vec<&str> = version.split('.').collect();
    let numeric = parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    numeric.then_some(version)
}
