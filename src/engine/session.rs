use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use petgraph::stable_graph::NodeIndex;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::BuildOptions;
use crate::diagnostic::{Diagnostic, Severity, ThrowableDiagnostic};
use crate::engine::BuildStats;
use crate::error::{BuildFailure, FailureKind, RequestError};
use crate::executor::{JobError, JobResult, Priority};
use crate::graph::{AssetGraph, Node, NodeKey};
use crate::plugin::{
    Resolution, ResolveRequest, TransformOutput, TransformRequest, WorkerRequest, WorkerResponse,
};
use crate::request::{RequestKey, RequestTracker};

/// A finished request on its way back to the session.
pub(super) struct Message {
    target: NodeKey,
    key: RequestKey,
    request: WorkerRequest,
    priority: Priority,
    result: JobResult,
}

pub(super) type SessionOutput = (AssetGraph, Vec<Diagnostic>, BuildStats);

/// One run of the work loop over a working copy of the graph.
pub(super) struct Session<'a> {
    graph: AssetGraph,
    options: Arc<BuildOptions>,
    requests: &'a Arc<RequestTracker>,
    tag: u64,
    tx: Sender<Message>,
    rx: Receiver<Message>,
    in_flight: usize,
    warnings: Vec<Diagnostic>,
    stats: BuildStats,
}

impl<'a> Session<'a> {
    pub(super) fn new(
        graph: AssetGraph,
        options: Arc<BuildOptions>,
        requests: &'a Arc<RequestTracker>,
        tag: u64,
    ) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            graph,
            options,
            requests,
            tag,
            tx,
            rx,
            in_flight: 0,
            warnings: Vec::new(),
            stats: BuildStats::default(),
        }
    }

    pub(super) fn run(mut self) -> Result<SessionOutput, BuildFailure> {
        let start = Instant::now();

        let span = tracing::span!(Level::INFO, "asset_graph", session = self.tag);
        span.pb_set_style(&crate::utils::get_style_build());
        span.pb_set_message("Building asset graph...");
        let _enter = span.enter();

        loop {
            for index in self.graph.ready_nodes() {
                self.dispatch(index);
            }
            span.pb_set_length(self.stats.requests as u64);

            if self.in_flight == 0 {
                break;
            }

            // The session holds a sender, so this only fails if it is dropped.
            let Ok(message) = self.rx.recv() else {
                break;
            };
            self.in_flight -= 1;
            span.pb_inc(1);

            if let Err((kind, diagnostics)) = self.apply(message) {
                return Err(self.abort(kind, diagnostics));
            }
        }

        if !self.graph.is_complete() {
            let stuck = self.graph.incomplete_nodes().len();
            let diagnostic = Diagnostic::error(format!(
                "Build stopped with {stuck} node(s) still incomplete"
            ))
            .with_origin("tsumiki");
            return Err(self.abort(FailureKind::Stalled, diagnostic.into()));
        }

        self.stats.elapsed = start.elapsed();
        Ok((self.graph, self.warnings, self.stats))
    }

    fn dispatch(&mut self, index: NodeIndex) {
        let options = self.options.clone();

        let (request, key, priority) = match self.graph.get(index) {
            Some(Node::EntrySpecifier { specifier, .. }) => (
                WorkerRequest::Resolve(ResolveRequest {
                    specifier: specifier.clone(),
                    resolve_from: None,
                    is_entry: true,
                    options: options.clone(),
                }),
                RequestKey::resolve(options.resolve_id(specifier, None)),
                Priority::Entry,
            ),
            Some(Node::Dependency(dep)) => (
                WorkerRequest::Resolve(ResolveRequest {
                    specifier: dep.specifier.clone(),
                    resolve_from: Some(dep.resolve_from.clone()),
                    is_entry: dep.is_entry,
                    options: options.clone(),
                }),
                RequestKey::resolve(options.resolve_id(&dep.specifier, Some(&dep.resolve_from))),
                Priority::Speculative,
            ),
            Some(Node::Asset(asset)) => (
                WorkerRequest::Transform(TransformRequest {
                    asset_id: asset.id,
                    file_path: asset.file_path.clone(),
                    options: options.clone(),
                }),
                RequestKey::transform(asset.id),
                if self.graph.is_entry_asset(index) {
                    Priority::Entry
                } else {
                    Priority::Speculative
                },
            ),
            _ => return,
        };

        let Some(target) = self.graph.get(index).map(Node::key) else {
            return;
        };

        self.graph.mark_dispatched(index);
        self.submit(target, key, request, priority);
    }

    fn submit(&mut self, target: NodeKey, key: RequestKey, request: WorkerRequest, priority: Priority) {
        tracing::trace!("dispatching {}", request.label());

        let tx = self.tx.clone();
        let message_request = request.clone();

        let started = self.requests.request(key, request, priority, self.tag, move |result| {
            // A closed channel means the session is over; late results are dropped.
            let _ = tx.send(Message {
                target,
                key,
                request: message_request,
                priority,
                result,
            });
        });

        self.in_flight += 1;
        self.stats.requests += 1;
        if !started {
            self.stats.coalesced += 1;
        }
    }

    /// Merges one result. Returns the fatal failure, if this was one.
    fn apply(&mut self, message: Message) -> Result<(), (FailureKind, ThrowableDiagnostic)> {
        let Some(index) = self.graph.index_of(&message.target) else {
            tracing::debug!("dropping result for removed node {}", message.target);
            return Ok(());
        };

        match message.result {
            Ok(WorkerResponse::Resolved(resolution)) => {
                self.on_resolved(index, resolution);
                Ok(())
            }
            Ok(WorkerResponse::Transformed(output)) => {
                self.on_transformed(index, &output);
                Ok(())
            }
            Err(JobError::Failed(diagnostics) | JobError::Fault(diagnostics)) => {
                self.on_failed(index, &message.request, diagnostics)
            }
            Err(JobError::Cancelled) => {
                if self.requests.pool().is_shut_down() {
                    let diagnostic = Diagnostic::error(format!(
                        "Worker pool shut down before '{}' could finish",
                        message.request.label()
                    ))
                    .with_origin("tsumiki");
                    return Err((FailureKind::Shutdown, diagnostic.into()));
                }

                // Another session cancelled the request this one was attached to.
                tracing::debug!("resubmitting cancelled {}", message.request.label());
                self.stats.resubmitted += 1;
                self.submit(message.target, message.key, message.request, message.priority);
                Ok(())
            }
        }
    }

    fn on_resolved(&mut self, index: NodeIndex, resolution: Resolution) {
        let path = match resolution {
            Resolution::Excluded => {
                self.graph.mark_excluded(index);
                self.stats.excluded += 1;
                return;
            }
            Resolution::File(path) => path,
        };

        let asset_id = self.options.asset_id(&path);
        let resolved = match self.graph.get(index) {
            Some(Node::EntrySpecifier { .. }) => self.graph.resolve_entry(index, &path, asset_id),
            Some(Node::Dependency(_)) => self.graph.resolve_dependency(index, &path, asset_id),
            _ => None,
        };

        if resolved.is_some() {
            self.stats.resolved += 1;
        }
    }

    fn on_transformed(&mut self, index: NodeIndex, output: &TransformOutput) {
        let Some(Node::Asset(asset)) = self.graph.get(index) else {
            return;
        };

        for warning in &output.warnings {
            let mut warning = warning.clone();
            if warning.file_path.is_none() {
                warning.file_path = Some(asset.file_path.clone());
            }
            self.warnings.push(warning);
        }

        self.graph.set_asset_transformed(index, output);
        self.stats.transformed += 1;
    }

    fn on_failed(
        &mut self,
        index: NodeIndex,
        request: &WorkerRequest,
        mut diagnostics: ThrowableDiagnostic,
    ) -> Result<(), (FailureKind, ThrowableDiagnostic)> {
        let context = request.context();
        for diagnostic in diagnostics.iter_mut() {
            diagnostic.hints.push(context.clone());
            if diagnostic.file_path.is_none() {
                diagnostic.file_path = request.file_path().map(ToOwned::to_owned);
            }
        }

        let (error, optional_edges) = match (self.graph.get(index), request) {
            (Some(Node::Dependency(dep)), WorkerRequest::Resolve(req)) => {
                let error = RequestError::Resolution {
                    specifier: req.specifier.clone(),
                    resolve_from: req.resolve_from.clone(),
                    diagnostics,
                };
                (error, dep.is_optional.then(|| vec![index]))
            }
            (Some(Node::Asset(_)), WorkerRequest::Transform(req)) => {
                let incoming = self.graph.incoming_dependencies(index);
                let optional = !self.graph.is_entry_asset(index)
                    && !incoming.is_empty()
                    && incoming.iter().all(|&dep| {
                        matches!(self.graph.get(dep), Some(Node::Dependency(d)) if d.is_optional)
                    });

                let error = RequestError::Transform {
                    file_path: req.file_path.clone(),
                    diagnostics,
                };
                (error, optional.then_some(incoming))
            }
            (_, WorkerRequest::Resolve(req)) => {
                let error = RequestError::Resolution {
                    specifier: req.specifier.clone(),
                    resolve_from: req.resolve_from.clone(),
                    diagnostics,
                };
                (error, None)
            }
            (_, WorkerRequest::Transform(req)) => {
                let error = RequestError::Transform {
                    file_path: req.file_path.clone(),
                    diagnostics,
                };
                (error, None)
            }
        };

        let Some(edges) = optional_edges else {
            tracing::error!("{error}");
            return Err((error.kind(), error.into_diagnostics()));
        };

        tracing::warn!("{error}, skipping optional dependency");
        for diagnostic in error.into_diagnostics().into_diagnostics() {
            self.warnings.push(diagnostic.with_severity(Severity::Warn));
        }

        for dep in edges {
            self.graph.mark_excluded(dep);
        }
        self.graph.prune_unreachable();
        self.stats.degraded += 1;
        Ok(())
    }

    /// Stops the session: queued work is cancelled, running work is detached
    /// from the request tracker, and the working graph is dropped along with
    /// the session. The failure carries the fatal diagnostics first, then
    /// the warnings collected so far, then failures that already arrived.
    fn abort(self, kind: FailureKind, mut diagnostics: ThrowableDiagnostic) -> BuildFailure {
        let cancelled = self.requests.pool().cancel(self.tag);
        let detached = self.requests.abandon(self.tag);

        for warning in self.warnings {
            diagnostics.push(warning);
        }

        while let Ok(message) = self.rx.try_recv() {
            if let Err(JobError::Failed(more) | JobError::Fault(more)) = message.result {
                diagnostics.extend(more);
            }
        }

        tracing::error!(
            "build failed with {} diagnostic(s), {cancelled} queued request(s) cancelled, \
             {detached} running request(s) detached",
            diagnostics.len()
        );

        BuildFailure { kind, diagnostics }
    }
}
