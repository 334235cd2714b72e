//! The asset graph builder.
//!
//! An [`AssetGraphBuilder`] owns the last successfully built graph (the
//! *committed* graph) and grows it one session at a time. A session is a
//! single call to [`AssetGraphBuilder::build`]:
//!
//! 1. The committed graph is cloned and any queued invalidations are applied
//!    to the clone.
//! 2. Every node that still needs work is turned into a request and sent to
//!    the worker pool through the request tracker.
//! 3. Results come back over a channel owned by the session and are merged
//!    into the clone on the calling thread, which may add more work.
//! 4. When nothing is left the clone becomes the committed graph. On the
//!    first fatal failure the clone is thrown away instead.
//!
//! Only the calling thread ever touches the graph. Workers see nothing but
//! the request they were handed.

mod session;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use rayon::prelude::*;

use crate::core::{BuildOptions, Hash32};
use crate::diagnostic::Diagnostic;
use crate::error::{BuildFailure, ConfigError};
use crate::executor::{PoolStats, WorkerPool, cpu};
use crate::graph::AssetGraph;
use crate::plugin::{PluginWorker, Resolver, Transformer};
use crate::request::RequestTracker;

use self::session::Session;

/// Pool tags must not collide between builders sharing a pool.
static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderState {
    Initializing,
    Growing,
    Completed,
    Failed,
}

/// Counters for one build session.
#[derive(Debug, Clone, Default)]
pub struct BuildStats {
    /// Requests issued by the session, resubmissions included.
    pub requests: usize,
    /// Requests that attached to one already running.
    pub coalesced: usize,
    /// Requests issued again after being cancelled underneath the session.
    pub resubmitted: usize,
    pub resolved: usize,
    pub excluded: usize,
    pub transformed: usize,
    /// Optional branches dropped because they failed.
    pub degraded: usize,
    /// Nodes re-opened by queued invalidations.
    pub invalidated: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct BuildSuccess {
    pub graph: AssetGraph,
    pub warnings: Vec<Diagnostic>,
    pub stats: BuildStats,
    pub pool: PoolStats,
}

/// Configuration for an [`AssetGraphBuilder`].
#[derive(Default)]
pub struct Config {
    entries: Vec<String>,
    options: BuildOptions,
    pool: Option<Arc<WorkerPool>>,
    plugins: Option<(Arc<dyn Resolver>, Arc<dyn Transformer>)>,
    workers: Option<usize>,
}

impl Config {
    pub fn entry(mut self, specifier: impl Into<String>) -> Self {
        self.entries.push(specifier.into());
        self
    }

    pub fn entries<I, S>(mut self, specifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entries.extend(specifiers.into_iter().map(Into::into));
        self
    }

    pub fn options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }

    /// Runs on an existing pool, which may be shared with other builders.
    pub fn pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Starts a private pool hosting these plugins. Ignored when a pool is
    /// given explicitly.
    pub fn plugins(mut self, resolver: Arc<dyn Resolver>, transformer: Arc<dyn Transformer>) -> Self {
        self.plugins = Some((resolver, transformer));
        self
    }

    /// Size of the private pool. Defaults to [`cpu::default_pool_size`].
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn finish(self) -> Result<AssetGraphBuilder, ConfigError> {
        let pool = match (self.pool, self.plugins) {
            (Some(pool), _) => pool,
            (None, Some((resolver, transformer))) => {
                let size = self.workers.unwrap_or_else(cpu::default_pool_size);
                let factory = PluginWorker::factory(resolver, transformer);
                Arc::new(WorkerPool::start(size, factory).map_err(ConfigError::PoolStart)?)
            }
            (None, None) => return Err(ConfigError::MissingWorkers),
        };

        let mut builder = AssetGraphBuilder {
            options: Arc::new(self.options),
            requests: RequestTracker::new(pool),
            committed: AssetGraph::new(),
            state: BuilderState::Initializing,
            stale: BTreeSet::new(),
        };
        builder.init(self.entries);
        Ok(builder)
    }
}

pub struct AssetGraphBuilder {
    options: Arc<BuildOptions>,
    requests: Arc<RequestTracker>,
    committed: AssetGraph,
    state: BuilderState,
    /// Files invalidated since the last successful session.
    stale: BTreeSet<Utf8PathBuf>,
}

impl AssetGraphBuilder {
    pub fn config() -> Config {
        Config::default()
    }

    /// Seeds entry specifiers. Entries already present are left alone.
    pub fn init<I, S>(&mut self, entries: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for entry in entries {
            self.committed.add_entry_specifier(entry.as_ref());
        }
    }

    pub fn state(&self) -> BuilderState {
        self.state
    }

    /// The graph committed by the last successful session.
    pub fn graph(&self) -> &AssetGraph {
        &self.committed
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        self.requests.pool()
    }

    /// Runs one build session.
    #[tracing::instrument(skip_all, name = "build")]
    pub fn build(&mut self) -> Result<BuildSuccess, BuildFailure> {
        let mut graph = self.committed.clone();
        let invalidated = if self.stale.is_empty() {
            0
        } else {
            let paths: Vec<_> = self.stale.iter().collect();
            graph.invalidate(&paths)
        };

        self.state = BuilderState::Growing;
        let tag = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("session {tag} starting, {invalidated} node(s) invalidated");

        let session = Session::new(graph, self.options.clone(), &self.requests, tag);

        match session.run() {
            Ok((mut graph, warnings, mut stats)) => {
                graph.prune_unreachable();
                stats.invalidated = invalidated;

                self.committed = graph;
                self.stale.clear();
                self.state = BuilderState::Completed;

                tracing::info!(
                    "built {} asset(s) in {:.2?} ({} request(s), {} coalesced)",
                    self.committed.assets().count(),
                    stats.elapsed,
                    stats.requests,
                    stats.coalesced,
                );

                Ok(BuildSuccess {
                    graph: self.committed.clone(),
                    warnings,
                    stats,
                    pool: self.pool().stats(),
                })
            }
            Err(failure) => {
                self.state = BuilderState::Failed;
                Err(failure)
            }
        }
    }

    /// Queues files whose contents changed. They are re-opened at the start
    /// of the next [`build`](Self::build). Returns how many paths were newly
    /// queued.
    pub fn invalidate<P: AsRef<Utf8Path>>(&mut self, paths: &[P]) -> usize {
        paths
            .iter()
            .filter(|path| self.stale.insert(path.as_ref().to_owned()))
            .count()
    }

    /// Hashes `paths` and queues only those whose contents differ from what
    /// the committed graph recorded. Unreadable files count as changed;
    /// files the graph never saw are ignored.
    pub fn refresh<P: AsRef<Utf8Path> + Sync>(&mut self, paths: &[P]) -> usize {
        let recorded: HashMap<&Utf8Path, Option<Hash32>> = self
            .committed
            .assets()
            .map(|asset| (asset.file_path.as_path(), asset.content_hash))
            .collect();

        let changed: Vec<Utf8PathBuf> = paths
            .par_iter()
            .filter_map(|path| {
                let path = path.as_ref();
                let recorded = *recorded.get(path)?;
                match Hash32::hash_file(path) {
                    Ok(hash) if Some(hash) == recorded => None,
                    Ok(_) => Some(path.to_owned()),
                    Err(err) => {
                        tracing::debug!("could not hash {path}: {err}");
                        Some(path.to_owned())
                    }
                }
            })
            .collect();

        self.invalidate(&changed)
    }
}
