use camino::Utf8PathBuf;
use thiserror::Error;

use crate::diagnostic::ThrowableDiagnostic;

/// The stage a fatal failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Resolution,
    Transform,
    /// The worker pool went away before the build finished.
    Shutdown,
    /// The work loop ran dry with nodes still incomplete.
    Stalled,
}

/// A fatal failure of a single request, before it is folded into a
/// [`BuildFailure`].
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    #[error("Failed to resolve '{specifier}'{}", from_suffix(.resolve_from))]
    Resolution {
        specifier: String,
        resolve_from: Option<Utf8PathBuf>,
        diagnostics: ThrowableDiagnostic,
    },

    #[error("Failed to transform '{file_path}'")]
    Transform {
        file_path: Utf8PathBuf,
        diagnostics: ThrowableDiagnostic,
    },
}

fn from_suffix(from: &Option<Utf8PathBuf>) -> String {
    match from {
        Some(path) => format!(" from '{path}'"),
        None => String::new(),
    }
}

impl RequestError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RequestError::Resolution { .. } => FailureKind::Resolution,
            RequestError::Transform { .. } => FailureKind::Transform,
        }
    }

    pub fn into_diagnostics(self) -> ThrowableDiagnostic {
        match self {
            RequestError::Resolution { diagnostics, .. }
            | RequestError::Transform { diagnostics, .. } => diagnostics,
        }
    }
}

/// A failed build session. Carries every diagnostic collected before the
/// session stopped, the fatal one first.
#[derive(Debug, Clone, Error)]
#[error("Build failed: {diagnostics}")]
pub struct BuildFailure {
    pub kind: FailureKind,
    pub diagnostics: ThrowableDiagnostic,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Either a worker pool or a resolver and a transformer must be configured")]
    MissingWorkers,

    #[error("Failed to start the worker pool")]
    PoolStart(#[source] std::io::Error),
}
