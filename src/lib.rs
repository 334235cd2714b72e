#![forbid(unsafe_code)]
//! Incremental asset graph builder.
//!
//! Given a set of entry specifiers, `tsumiki` discovers every file they
//! transitively depend on, hands each file to a [`Transformer`], and records
//! the result as an [`AssetGraph`]. The heavy lifting happens on a
//! [`WorkerPool`] sized from the host's CPU topology; the graph itself is
//! only ever touched by the thread that called [`AssetGraphBuilder::build`].
//!
//! Every failure, whatever shape it comes in, is normalized into a
//! [`ThrowableDiagnostic`] before it reaches the caller.
//!
//! ```no_run
//! use std::sync::Arc;
//! # use tsumiki::*;
//! # fn resolver() -> Arc<dyn Resolver> { todo!() }
//! # fn transformer() -> Arc<dyn Transformer> { todo!() }
//!
//! let mut builder = AssetGraphBuilder::config()
//!     .entry("./src/index.js")
//!     .plugins(resolver(), transformer())
//!     .finish()?;
//!
//! match builder.build() {
//!     Ok(success) => println!("{} assets", success.graph.assets().count()),
//!     Err(failure) => eprintln!("{}", failure.diagnostics.render(&RenderOptions::default())),
//! }
//! # Ok::<(), ConfigError>(())
//! ```

mod core;
pub mod diagnostic;
mod engine;
mod error;
pub mod executor;
pub mod graph;
pub mod plugin;
pub mod request;
mod utils;

pub use crate::core::{BuildOptions, Hash32, Mode};
pub use crate::diagnostic::{
    CodeFrame, CodeHighlight, Diagnostic, Diagnostifiable, EmptyDiagnostics, Location,
    PrintableError, RenderOptions, Severity, ThrowableDiagnostic, normalize,
};
pub use crate::engine::{
    AssetGraphBuilder, BuildStats, BuildSuccess, BuilderState, Config,
};
pub use crate::error::*;
pub use crate::executor::{Priority, WorkerPool};
pub use crate::graph::{AssetGraph, Node, NodeKey};
pub use crate::plugin::{
    DependencyRequest, Resolution, ResolveRequest, Resolver, TransformOutput, TransformRequest,
    Transformer,
};

#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
