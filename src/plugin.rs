//! The seams where resolution and transformation plug in.
//!
//! The builder never calls a [`Resolver`] or [`Transformer`] directly. Both
//! are hosted by a [`PluginWorker`] living on a pool thread, and the builder
//! only talks to the pool in terms of [`WorkerRequest`] and
//! [`WorkerResponse`].

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::core::{BuildOptions, Hash32};
use crate::diagnostic::{Diagnostic, Diagnostifiable, ThrowableDiagnostic, normalize};
use crate::executor::{Worker, WorkerFactory};

#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub specifier: String,
    /// File the specifier was found in. `None` for entries.
    pub resolve_from: Option<Utf8PathBuf>,
    pub is_entry: bool,
    pub options: Arc<BuildOptions>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    File(Utf8PathBuf),
    /// The specifier is intentionally left out of the graph.
    Excluded,
}

#[derive(Debug, Clone)]
pub struct TransformRequest {
    pub asset_id: Hash32,
    pub file_path: Utf8PathBuf,
    pub options: Arc<BuildOptions>,
}

/// A dependency discovered while transforming a file. It is resolved
/// relative to the file that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DependencyRequest {
    pub specifier: String,
    pub is_optional: bool,
}

impl DependencyRequest {
    pub fn new(specifier: impl Into<String>) -> Self {
        Self {
            specifier: specifier.into(),
            is_optional: false,
        }
    }

    pub fn optional(specifier: impl Into<String>) -> Self {
        Self {
            specifier: specifier.into(),
            is_optional: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransformOutput {
    pub content_hash: Hash32,
    pub asset_type: String,
    pub dependencies: Vec<DependencyRequest>,
    pub warnings: Vec<Diagnostic>,
}

impl TransformOutput {
    pub fn new(content_hash: Hash32, asset_type: impl Into<String>) -> Self {
        Self {
            content_hash,
            asset_type: asset_type.into(),
            dependencies: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn with_dependency(mut self, dependency: DependencyRequest) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_warning(mut self, warning: Diagnostic) -> Self {
        self.warnings.push(warning);
        self
    }
}

/// Turns a specifier into a file.
pub trait Resolver: Send + Sync {
    fn name(&self) -> &str {
        "resolver"
    }

    fn resolve(&self, request: &ResolveRequest) -> Result<Resolution, Diagnostifiable>;
}

/// Turns a file into an asset and the specifiers it depends on.
pub trait Transformer: Send + Sync {
    fn name(&self) -> &str {
        "transformer"
    }

    fn transform(&self, request: &TransformRequest) -> Result<TransformOutput, Diagnostifiable>;
}

#[derive(Debug, Clone)]
pub enum WorkerRequest {
    Resolve(ResolveRequest),
    Transform(TransformRequest),
}

impl WorkerRequest {
    /// Short human description used in logs and fault diagnostics.
    pub fn label(&self) -> String {
        match self {
            WorkerRequest::Resolve(req) => match &req.resolve_from {
                Some(from) => format!("resolve '{}' from '{from}'", req.specifier),
                None => format!("resolve entry '{}'", req.specifier),
            },
            WorkerRequest::Transform(req) => format!("transform '{}'", req.file_path),
        }
    }

    /// Where a failure of this request came from, phrased as a hint.
    pub fn context(&self) -> String {
        match self {
            WorkerRequest::Resolve(req) => match &req.resolve_from {
                Some(from) => format!("while resolving '{}' from '{from}'", req.specifier),
                None => format!("while resolving '{}' (entry)", req.specifier),
            },
            WorkerRequest::Transform(req) => format!("while transforming '{}'", req.file_path),
        }
    }

    pub(crate) fn file_path(&self) -> Option<&Utf8Path> {
        match self {
            WorkerRequest::Resolve(req) => req.resolve_from.as_deref(),
            WorkerRequest::Transform(req) => Some(&req.file_path),
        }
    }
}

#[derive(Debug, Clone)]
pub enum WorkerResponse {
    Resolved(Resolution),
    Transformed(Arc<TransformOutput>),
}

/// The worker every builder pool runs: one resolver and one transformer
/// shared by all slots.
pub struct PluginWorker {
    resolver: Arc<dyn Resolver>,
    transformer: Arc<dyn Transformer>,
}

impl PluginWorker {
    pub fn new(resolver: Arc<dyn Resolver>, transformer: Arc<dyn Transformer>) -> Self {
        Self {
            resolver,
            transformer,
        }
    }

    pub fn factory(resolver: Arc<dyn Resolver>, transformer: Arc<dyn Transformer>) -> WorkerFactory {
        Arc::new(move |_| {
            Box::new(PluginWorker::new(resolver.clone(), transformer.clone())) as Box<dyn Worker>
        })
    }
}

impl Worker for PluginWorker {
    fn run(&mut self, request: &WorkerRequest) -> Result<WorkerResponse, ThrowableDiagnostic> {
        match request {
            WorkerRequest::Resolve(req) => self
                .resolver
                .resolve(req)
                .map(WorkerResponse::Resolved)
                .map_err(|err| normalize(err, Some(self.resolver.name()))),
            WorkerRequest::Transform(req) => {
                let origin = self.transformer.name();
                self.transformer
                    .transform(req)
                    .map(|output| WorkerResponse::Transformed(Arc::new(output)))
                    .map_err(|err| {
                        let mut bundle = normalize(err, Some(origin));
                        for diagnostic in bundle.iter_mut() {
                            if diagnostic.file_path.is_none() {
                                diagnostic.file_path = Some(req.file_path.clone());
                            }
                        }
                        bundle
                    })
            }
        }
    }
}
