//! Async document sessions.
//!
//! Each open document is owned by one tokio task. Commands reach it over a
//! bounded `mpsc` channel; pipeline runs happen on the blocking pool.
//! Edits that queue up while a run is in flight are drained and applied as
//! one batch, and sending an edit cancels the run in flight through the
//! document's [`CancelToken`].
//!
//! Region version changes are broadcast so that every other session can
//! re-trigger itself when something it read has moved on.
//!
//! # Example
//!
//! ```ignore
//! let workspace = Workspace::new(MyGrammar, PipelineConfig::default());
//! let a = workspace.open("A", "x: 1\n").await?;
//! let b = workspace.open("B", "y: {A.x}+1\n").await?;
//!
//! a.edit(TextEdit::new(3..4, "5")).await?;
//! let snapshot = b.snapshot().await?;
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::config::PipelineConfig;
use crate::document::{Document, PipelineReport};
use crate::edit::TextEdit;
use crate::error::Error;
use crate::forest::Registry;
use crate::propagate::CancelToken;
use crate::symbols::QualifiedName;
use crate::traits::RendererCapability;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The session task has stopped.
    #[error("session for `{0}` is closed")]
    Closed(String),

    /// A pipeline run panicked on the blocking pool.
    #[error("pipeline task failed: {0}")]
    Join(String),

    #[error(transparent)]
    Pipeline(#[from] Error),
}

/// Broadcast after a run changed a document's region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionChanged {
    pub document: String,
    pub version: u64,
}

/// Point-in-time view of a session's document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub name: String,
    pub text: String,
    pub version: u64,
    pub converged: bool,
    /// Every binding with its rendered value, sorted by name.
    pub values: Vec<(QualifiedName, Option<String>)>,
}

enum Command {
    Edit(TextEdit),
    Snapshot(oneshot::Sender<Snapshot>),
    Close,
}

/// Spawns and connects document sessions.
#[derive(Debug, Clone)]
pub struct Workspace<C> {
    caps: C,
    config: PipelineConfig,
    registry: Arc<Registry>,
    changes: broadcast::Sender<RegionChanged>,
}

impl<C> Workspace<C>
where
    C: RendererCapability + Clone + 'static,
{
    pub fn new(caps: C, config: PipelineConfig) -> Self {
        let (changes, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            caps,
            config,
            registry: Arc::new(Registry::new()),
            changes,
        }
    }

    #[inline]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Region change notifications from every session.
    pub fn subscribe(&self) -> broadcast::Receiver<RegionChanged> {
        self.changes.subscribe()
    }

    /// Opens a document and spawns its session task.
    pub async fn open(
        &self,
        name: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<SessionHandle, SessionError> {
        let name = name.into();
        if self.registry.contains(&name) {
            return Err(Error::DocumentExists(name).into());
        }
        let text = text.into();
        let caps = self.caps.clone();
        let config = self.config;
        let registry = self.registry.clone();
        let doc_name = name.clone();
        let (doc, report) = tokio::task::spawn_blocking(move || {
            Document::open_with(doc_name, text, caps, config, &*registry)
        })
        .await
        .map_err(|e| SessionError::Join(e.to_string()))??;

        self.registry.insert(doc.region().clone())?;
        let cancel = doc.cancel_token();
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let worker = Worker {
            doc: Some(doc),
            registry: self.registry.clone(),
            changes: self.changes.clone(),
            config: self.config,
            backlog: VecDeque::new(),
            rounds: 0,
        };
        let events = self.changes.subscribe();
        // Announce even an unchanged region: sessions waiting on names in
        // this document can settle now.
        worker.announce(report.version);
        tokio::spawn(worker.run(rx, events));

        Ok(SessionHandle {
            name: Arc::from(name),
            tx,
            cancel,
        })
    }
}

/// Cheap, cloneable handle to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    name: Arc<str>,
    tx: mpsc::Sender<Command>,
    cancel: CancelToken,
}

impl SessionHandle {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues an edit, cancelling the run in flight.
    pub async fn edit(&self, edit: TextEdit) -> Result<(), SessionError> {
        self.cancel.cancel();
        self.send(Command::Edit(edit)).await
    }

    /// Waits for every command sent before it, then captures the document.
    pub async fn snapshot(&self) -> Result<Snapshot, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx)).await?;
        rx.await.map_err(|_| self.closed())
    }

    /// Stops the session, tearing down its tree and scopes.
    pub async fn close(&self) -> Result<(), SessionError> {
        self.send(Command::Close).await
    }

    async fn send(&self, command: Command) -> Result<(), SessionError> {
        self.tx.send(command).await.map_err(|_| self.closed())
    }

    fn closed(&self) -> SessionError {
        SessionError::Closed(self.name.to_string())
    }
}

struct Worker<C> {
    /// Taken while a run is on the blocking pool.
    doc: Option<Document<C>>,
    registry: Arc<Registry>,
    changes: broadcast::Sender<RegionChanged>,
    config: PipelineConfig,
    /// Commands drained while coalescing that were not edits.
    backlog: VecDeque<Command>,
    /// Re-trigger rounds since the last edit.
    rounds: usize,
}

impl<C> Worker<C>
where
    C: RendererCapability + 'static,
{
    fn name(&self) -> &str {
        self.doc.as_ref().map_or("", |d| d.name())
    }

    fn announce(&self, version: u64) {
        let Some(doc) = &self.doc else {
            return;
        };
        // No receivers is fine.
        self.changes
            .send(RegionChanged {
                document: doc.name().to_owned(),
                version,
            })
            .ok();
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<Command>,
        mut events: broadcast::Receiver<RegionChanged>,
    ) {
        loop {
            let command = match self.backlog.pop_front() {
                Some(command) => Some(command),
                None => tokio::select! {
                    command = rx.recv() => match command {
                        Some(command) => Some(command),
                        None => break,
                    },
                    event = events.recv() => {
                        self.on_event(event).await;
                        None
                    }
                },
            };
            let Some(command) = command else {
                continue;
            };

            match command {
                Command::Edit(edit) => {
                    let mut edits = vec![edit];
                    while let Ok(next) = rx.try_recv() {
                        match next {
                            Command::Edit(edit) => edits.push(edit),
                            other => {
                                self.backlog.push_back(other);
                                break;
                            }
                        }
                    }
                    self.rounds = 0;
                    self.apply(edits).await;
                }
                Command::Snapshot(reply) => {
                    if let Some(snapshot) = self.snapshot() {
                        reply.send(snapshot).ok();
                    }
                }
                Command::Close => break,
            }
        }
        self.shutdown();
    }

    async fn apply(&mut self, edits: Vec<TextEdit>) {
        let Some(mut doc) = self.doc.take() else {
            return;
        };
        let registry = self.registry.clone();
        let count = edits.len();
        let joined = tokio::task::spawn_blocking(move || {
            let result = doc.edit_batch(edits, &*registry);
            (doc, result)
        })
        .await;
        match joined {
            Ok((doc, result)) => {
                let before = doc.region().version();
                self.doc = Some(doc);
                match result {
                    Ok(report) => self.after_run(&report, count),
                    Err(err) => {
                        log::warn!("edit of `{}` rejected: {err}", self.name());
                        let now = self.doc.as_ref().map_or(before, |d| d.region().version());
                        self.announce(now);
                    }
                }
            }
            Err(err) => log::warn!("pipeline task failed: {err}"),
        }
    }

    fn after_run(&self, report: &PipelineReport, edits: usize) {
        log::debug!(
            "`{}`: {edits} edits, {} changes, version {}",
            self.name(),
            report.changes.len(),
            report.version
        );
        if !report.rebuilt.is_empty() || report.propagation.is_err() {
            self.announce(report.version);
        } else if let Ok(summary) = &report.propagation {
            if summary.changed > 0 {
                self.announce(report.version);
            }
        }
    }

    async fn on_event(&mut self, event: Result<RegionChanged, broadcast::error::RecvError>) {
        let Some(doc) = &self.doc else {
            return;
        };
        let relevant = match &event {
            Ok(changed) => changed.document != doc.name(),
            Err(broadcast::error::RecvError::Lagged(_)) => true,
            Err(broadcast::error::RecvError::Closed) => false,
        };
        if !relevant {
            return;
        }
        let stale = self.registry.is_stale(&doc.reference_set());
        if !stale && !doc.has_pending() {
            return;
        }
        if self.rounds >= self.config.max_requeue_rounds {
            log::warn!(
                "`{}` re-triggered {} times without an edit; ignoring",
                doc.name(),
                self.rounds
            );
            return;
        }
        self.rounds += 1;

        let Some(mut doc) = self.doc.take() else {
            return;
        };
        let registry = self.registry.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let before = doc.region().version();
            let result = if stale {
                doc.retrigger(&*registry)
            } else {
                doc.settle(&*registry)
            };
            if let Err(err) = &result {
                log::debug!("re-triggering `{}`: {err}", doc.name());
            }
            let after = doc.region().version();
            (doc, (after != before).then_some(after))
        })
        .await;
        match joined {
            Ok((doc, bumped)) => {
                self.doc = Some(doc);
                if let Some(version) = bumped {
                    self.announce(version);
                }
            }
            Err(err) => log::warn!("re-trigger task failed: {err}"),
        }
    }

    fn snapshot(&self) -> Option<Snapshot> {
        let doc = self.doc.as_ref()?;
        let table = doc.region().read().ok()?;
        let values = table
            .bindings()
            .into_iter()
            .map(|(name, binding)| (name, binding.value.as_ref().map(|v| v.to_string())))
            .collect();
        Some(Snapshot {
            name: doc.name().to_owned(),
            text: doc.text().to_owned(),
            version: doc.region().version(),
            converged: doc.tree().converged(),
            values,
        })
    }

    fn shutdown(&mut self) {
        let Some(doc) = self.doc.take() else {
            return;
        };
        let name = doc.name().to_owned();
        let version = doc.region().bump();
        self.registry.remove(&name);
        if let Err(err) = doc.close() {
            log::warn!("closing `{name}`: {err}");
        }
        self.changes
            .send(RegionChanged {
                document: name,
                version,
            })
            .ok();
    }
}
