use crate::context::BuildContext;
use crate::error::{BuildError, ErrorKind};
use crate::keys::KeyPolicy;
use crate::packager::Package;
use crate::protocol::{self, KeyOrigin};
use crate::status::StatusReporter;
use crate::types::{BuildRequest, BuildResponse, KeySource};
use tracing::{Instrument, debug, error, info, info_span, warn};

pub const COMPILING_MSG: &str = "Compiling circuit...";
pub const RESOLVING_KEY_MSG: &str = "Resolving finalZkey...";
pub const REDUCING_MSG: &str = "Generating keys...";
pub const PACKAGING_MSG: &str = "Packaging...";

/// Where a build is in its pipeline. Stages only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStage {
    Received,
    Compiling,
    ResolvingKeyMaterial,
    Reducing,
    Packaging,
    Succeeded,
    Failed(ErrorKind),
}

/// Entry point for one build event.
///
/// Request-shape problems answer 400 without touching the status log. Once a
/// build starts it always ends with exactly one terminal status event.
pub async fn handle(ctx: &BuildContext, event: serde_json::Value) -> BuildResponse {
    let request = match BuildRequest::from_event(event).and_then(|r| r.validate().map(|_| r)) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Rejected build request");
            return BuildResponse::bad_request(&e.to_string());
        }
    };
    if !ctx.compiler().has_version(&request.circom_path) {
        warn!(circom_path = %request.circom_path, "Unknown compiler selector");
        return BuildResponse::bad_request(&format!(
            "Unknown circomPath: {}",
            request.circom_path
        ));
    }

    let span = info_span!(
        "build",
        request_id = %request.request_id,
        protocol = %request.protocol
    );
    async move {
        let mut pipeline = Pipeline {
            ctx,
            request: &request,
            status: ctx.status_reporter(&request.request_id),
            stage: BuildStage::Received,
        };
        info!("Build received");
        match pipeline.run().await {
            Ok(package) => {
                pipeline.stage = BuildStage::Succeeded;
                pipeline.status.succeeded(&package.name).await;
                info!(pkg_name = %package.name, "Build succeeded");
                BuildResponse::ok(&package.name)
            }
            Err(e) => {
                let failed_in = pipeline.stage;
                pipeline.stage = BuildStage::Failed(e.kind());
                match &e {
                    BuildError::InvalidKeyMaterial { reason } => {
                        error!(stage = ?failed_in, %reason, "Build failed: {}", e)
                    }
                    _ => error!(stage = ?failed_in, "Build failed: {}", e),
                }
                pipeline.status.failed(&e).await;
                BuildResponse::build_failed(pipeline.status.key())
            }
        }
    }
    .instrument(span)
    .await
}

struct Pipeline<'a> {
    ctx: &'a BuildContext,
    request: &'a BuildRequest,
    status: StatusReporter,
    stage: BuildStage,
}

impl Pipeline<'_> {
    async fn enter(&mut self, stage: BuildStage, msg: &str) {
        debug!(from = ?self.stage, to = ?stage, "Stage transition");
        self.stage = stage;
        self.status.append(msg).await;
    }

    async fn run(&mut self) -> Result<Package, BuildError> {
        let ctx = self.ctx;
        let request = self.request;
        let strategy = protocol::strategy(request.protocol);
        let source = request
            .key_source()
            .map_err(|e| BuildError::invalid_key(e.to_string()))?;

        self.enter(BuildStage::Compiling, COMPILING_MSG).await;
        let workspace = ctx
            .workspace(&request.request_id)
            .map_err(|e| BuildError::CompileError(format!("failed to create workspace: {}", e)))?;
        let slot = ctx
            .worker_slot()
            .await
            .map_err(|e| BuildError::CompileError(e.to_string()))?;
        let compiled = ctx
            .compiler()
            .compile(
                &request.files,
                &request.circuit,
                &request.circom_path,
                &workspace,
            )
            .await?;
        info!(
            constraints = compiled.shape.n_constraints,
            public = compiled.shape.n_public(),
            "Circuit compiled"
        );

        let policy = strategy.key_policy(ctx.config().allow_unsafe_groth16_setup);
        let supplied = if policy == KeyPolicy::Ignored {
            if source != KeySource::Absent {
                self.status
                    .append(&format!(
                        "finalZkey ignored: {} uses a universal setup",
                        request.protocol
                    ))
                    .await;
            }
            None
        } else {
            self.enter(BuildStage::ResolvingKeyMaterial, RESOLVING_KEY_MSG)
                .await;
            ctx.keys()
                .resolve(&source, policy, request.protocol, &compiled.shape)
                .await?
                .map(|key| (key, origin_of(&source)))
        };

        self.enter(BuildStage::Reducing, REDUCING_MSG).await;
        let catalog = ctx.ptau_catalog().map_err(BuildError::setup)?;
        let key = strategy
            .reduce(ctx.backend(), &catalog, &compiled, supplied, &workspace)
            .await?;
        let artifacts = strategy
            .export_artifacts(ctx.backend(), &compiled, key, &workspace)
            .await?;
        drop(slot);

        self.enter(BuildStage::Packaging, PACKAGING_MSG).await;
        let package = ctx
            .packager()
            .assemble(request, &compiled.shape, &artifacts)
            .await?;
        drop(workspace);
        Ok(package)
    }
}

fn origin_of(source: &KeySource) -> KeyOrigin {
    match source {
        KeySource::Url(_) => KeyOrigin::Url,
        _ => KeyOrigin::Inline,
    }
}
