//! The run loop.
//!
//! # Architecture
//!
//! ```text
//!   add(ItemSpec) ──► Item::create ──► apply(Outcome)
//!                                          │ Enqueue
//!                                          ▼
//!   ┌──────────── run() ─────────────────────────────────────────────┐
//!   │ loop {                                                         │
//!   │   cycle: spawn missing workers, send 600s up to pipeline depth │
//!   │   select! {                                                    │
//!   │     cancelled            => stop                               │
//!   │     events.recv()        => 100/101/102/103/200/201/400/401    │
//!   │     tick                 => idle timeouts, progress pulse      │
//!   │   }                                                            │
//!   │ }                                                              │
//!   └────────────────────────────────────────────────────────────────┘
//!                          │ 201/400
//!                          ▼
//!        Item::done / Item::failed ──► apply(Outcome) ──► more work
//! ```
//!
//! Handlers run while the finished queue entry still counts towards the
//! item's `queue_counter`; the entry is released right after the handler
//! and before its outcome is applied.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{AcquireConfig, QueueMode};
use crate::error::{AcquireError, AcquireResult};
use crate::hashes::Hashes;
use crate::item::{
    Action, DoneInfo, HandlerContext, Item, ItemArena, ItemDesc, ItemId, ItemSpec, ItemStatus, Outcome,
    ReleaseChain,
};
use crate::message::{self, Message};
use crate::mirror::{self, MirrorFailure};
use crate::sources::{FileRequest, PackageVersion, ReleaseSource};
use crate::uri::Uri;

use super::{
    AcquireStatus, EventSink, MethodConfig, NoStatus, ProgressSnapshot, Queue, QueueEntry, Transport,
    TransportFactory, WorkerEvent, WorkerId,
};

/// Shortest interval between two housekeeping ticks.
const MIN_TICK: Duration = Duration::from_millis(10);

// =============================================================================
// Run results
// =============================================================================

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunResult {
    /// Every item finished without a hard or authentication error.
    Continue,
    /// At least one item ended in error.
    Failed,
    /// The run was cancelled.
    Cancelled,
}

/// One item that ended in error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedItem {
    pub uri: String,
    pub description: String,
    pub status: String,
    pub error: String,
}

/// Totals and user-visible messages of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Bytes transferred, excluding resumed parts.
    pub fetched_bytes: u64,
    pub items_done: usize,
    pub items_failed: usize,
    /// Items left in a transient network state, their old copy still in use.
    pub items_transient: usize,
    pub failures: Vec<FailedItem>,
    pub warnings: Vec<String>,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

// =============================================================================
// Workers
// =============================================================================

struct Worker {
    queue: String,
    access: String,
    transport: Box<dyn Transport>,
    /// Set once the transport announced its capabilities.
    config: Option<MethodConfig>,
    last_activity: Instant,
}

#[derive(Clone, Copy)]
enum Dispatch {
    Done,
    Failed,
}

// =============================================================================
// Engine
// =============================================================================

/// Owns every item, queue and worker of a run.
pub struct Acquire {
    config: AcquireConfig,
    transports: Arc<dyn TransportFactory>,
    arena: ItemArena,
    queues: BTreeMap<String, Queue>,
    workers: HashMap<WorkerId, Worker>,
    method_configs: HashMap<String, MethodConfig>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    next_worker: u64,
    status: Box<dyn AcquireStatus>,
    shutdown: CancellationToken,
    summary: RunSummary,
    started: Instant,
}

impl Acquire {
    /// Create an engine and the `partial/` directories it downloads into.
    pub fn new(config: AcquireConfig, transports: Arc<dyn TransportFactory>) -> AcquireResult<Self> {
        for dir in [config.lists_partial_dir(), config.archives_partial_dir()] {
            fs::create_dir_all(&dir).map_err(|source| AcquireError::CreateDirFailed {
                path: dir.clone(),
                source,
            })?;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            transports,
            arena: ItemArena::new(),
            queues: BTreeMap::new(),
            workers: HashMap::new(),
            method_configs: HashMap::new(),
            events_tx,
            events_rx,
            next_worker: 0,
            status: Box::new(NoStatus),
            shutdown: CancellationToken::new(),
            summary: RunSummary::default(),
            started: Instant::now(),
        })
    }

    /// Report progress to `status`.
    pub fn with_status(mut self, status: Box<dyn AcquireStatus>) -> Self {
        self.status = status;
        self
    }

    /// Stop the run when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &AcquireConfig {
        &self.config
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    pub fn item(&self, id: ItemId) -> Option<&Item> {
        self.arena.get(id)
    }

    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.arena.iter()
    }

    pub fn queues(&self) -> impl Iterator<Item = &Queue> {
        self.queues.values()
    }

    // -------------------------------------------------------------------------
    // Seeding
    // -------------------------------------------------------------------------

    /// Create the items for `spec` and queue their first transfers.
    pub fn add(&mut self, spec: ItemSpec) -> Vec<ItemId> {
        let first = self.arena.next_id();
        let created = {
            let ctx = HandlerContext {
                config: &self.config,
                arena: &self.arena,
            };
            Item::create(first, spec, &ctx)
        };

        let mut pending = Vec::with_capacity(created.len());
        for (item, out) in created {
            debug!(item = %item.id(), kind = item.kind_name(), uri = %item.desc().uri, "item created");
            pending.push((self.arena.insert(item), out));
        }
        let ids = pending.iter().map(|(id, _)| *id).collect();
        for (id, out) in pending {
            self.apply(id, out);
        }
        ids
    }

    /// Fetch and verify the metadata of one distribution, then its indexes.
    ///
    /// The clear-signed file is tried first when the source has one.
    pub fn add_release(&mut self, source: &ReleaseSource) -> ItemId {
        let chain = ReleaseChain::new(source);
        let spec = match &source.inrelease {
            Some(inrelease) => ItemSpec::MetaClearSig {
                inrelease: inrelease.clone(),
                chain,
            },
            None => ItemSpec::MetaSig {
                signature: source.signature.clone(),
                chain,
            },
        };
        self.add_one(spec)
    }

    pub fn add_file(&mut self, request: FileRequest) -> ItemId {
        self.add_one(ItemSpec::File(request))
    }

    pub fn add_archive(&mut self, version: PackageVersion) -> ItemId {
        self.add_one(ItemSpec::Archive(version))
    }

    fn add_one(&mut self, spec: ItemSpec) -> ItemId {
        let first = self.arena.next_id();
        self.add(spec);
        first
    }

    // -------------------------------------------------------------------------
    // Outcomes
    // -------------------------------------------------------------------------

    fn apply(&mut self, id: ItemId, out: Outcome) {
        for action in out.actions {
            match action {
                Action::Enqueue(desc) => self.enqueue(id, desc),
                Action::Dequeue => self.dequeue(id),
                Action::Spawn(spec) => {
                    self.add(spec);
                }
                Action::Warning(text) => {
                    warn!(item = %id, "{}", text);
                    self.summary.warnings.push(text);
                }
                Action::ReportMirrorFailure { used_mirror, uri, code } => {
                    let failure = MirrorFailure {
                        used_mirror,
                        describe_uri: uri,
                        fail_code: code,
                    };
                    mirror::report_failure(self.config.mirror_report_script.as_deref(), &failure);
                }
                Action::RunAuthFailureHooks => self.run_auth_failure_hooks(),
                Action::Fetched { bytes, resume_point } => {
                    self.summary.fetched_bytes += bytes.saturating_sub(resume_point);
                    self.status.fetched(bytes, resume_point);
                }
            }
        }
    }

    fn run_auth_failure_hooks(&self) {
        for hook in &self.config.auth_failure_hooks {
            debug!(hook = %hook, "running auth failure hook");
            match Command::new("sh").arg("-c").arg(hook).status() {
                Ok(status) if status.success() => {}
                Ok(status) => warn!(hook = %hook, status = %status, "auth failure hook failed"),
                Err(e) => warn!(hook = %hook, error = %e, "auth failure hook could not run"),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Queues
    // -------------------------------------------------------------------------

    fn method_config(&self, access: &str) -> MethodConfig {
        self.method_configs
            .get(access)
            .cloned()
            .or_else(|| self.transports.capabilities(access, &self.config))
            .unwrap_or_else(|| MethodConfig::new(access))
    }

    /// Queue a URI belongs to.
    ///
    /// Single-instance transports and access mode share one queue per
    /// scheme. Otherwise each host gets its own queue, and host-less local
    /// pivots are spread over up to `max_queues_per_scheme` queues.
    fn queue_name(&self, uri: &str, access: &str) -> String {
        if self.method_config(access).single_instance || self.config.queue_mode == QueueMode::Access {
            return access.to_string();
        }

        let host = Uri::parse(uri).map(|u| u.host).unwrap_or_default();
        if !host.is_empty() {
            return format!("{}:{}", access, host);
        }

        let prefix = format!("{}:", access);
        let existing: Vec<&Queue> = self
            .queues
            .values()
            .filter(|q| q.name.starts_with(&prefix))
            .collect();
        if let Some(idle) = existing.iter().find(|q| q.is_empty()) {
            return idle.name.clone();
        }
        let limit = self.config.max_queues_per_scheme;
        if limit == 0 || existing.len() < limit {
            return format!("{}{}", prefix, existing.len());
        }
        existing
            .iter()
            .min_by_key(|q| q.len())
            .map(|q| q.name.clone())
            .unwrap_or_else(|| format!("{}0", prefix))
    }

    fn enqueue(&mut self, id: ItemId, desc: ItemDesc) {
        let access = Uri::access_of(&desc.uri).to_string();
        let name = self.queue_name(&desc.uri, &access);
        debug!(item = %id, uri = %desc.uri, queue = %name, "enqueue");

        let queue = self
            .queues
            .entry(name.clone())
            .or_insert_with(|| Queue::new(name, access));
        if queue.enqueue(id, desc) {
            if let Some(item) = self.arena.get_mut(id) {
                item.core.queue_counter += 1;
            }
        }
    }

    fn dequeue(&mut self, id: ItemId) {
        let removed: usize = self.queues.values_mut().map(|q| q.remove_owner(id)).sum();
        if let Some(item) = self.arena.get_mut(id) {
            item.core.queue_counter = item.core.queue_counter.saturating_sub(removed);
        }
    }

    fn is_idle(&self) -> bool {
        self.queues.values().all(Queue::is_empty)
    }

    // -------------------------------------------------------------------------
    // Workers
    // -------------------------------------------------------------------------

    /// Start workers and hand out requests until nothing changes.
    fn cycle(&mut self) {
        while self.cycle_once() {}
    }

    /// One pass over every queue. Returns true when a queue failed and its
    /// handlers may have queued more work.
    fn cycle_once(&mut self) -> bool {
        let names: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(name, _)| name.clone())
            .collect();

        let mut changed = false;
        for name in names {
            changed |= self.service_queue(&name);
        }
        changed
    }

    fn service_queue(&mut self, name: &str) -> bool {
        let Some(queue) = self.queues.get(name) else {
            return false;
        };
        let access = queue.access.clone();
        let current = queue.worker;

        let wid = match current {
            Some(wid) => wid,
            None => match self.start_worker(name, &access) {
                Ok(wid) => wid,
                Err(e) => {
                    error!(queue = %name, error = %e, "failed to start worker");
                    self.fail_queue(name, &access, &e.to_string());
                    return true;
                }
            },
        };

        let Some(worker) = self.workers.get(&wid) else {
            return false;
        };
        let Some(cnf) = worker.config.clone() else {
            // waiting for capabilities
            return false;
        };
        let depth = if cnf.pipeline { self.config.pipeline_depth.max(1) } else { 1 };

        loop {
            let Some(queue) = self.queues.get_mut(name) else {
                return false;
            };
            if queue.in_flight() >= depth {
                return false;
            }
            let Some(entry) = queue.next_unsent() else {
                return false;
            };
            entry.in_flight = true;
            let desc = entry.desc.clone();
            let owner = entry.owners[0];

            let request = self.acquire_message(owner, &desc.uri);
            debug!(worker = %wid, uri = %desc.uri, "sending request");
            let sent = match self.workers.get_mut(&wid) {
                Some(worker) => worker.transport.send(request),
                None => return false,
            };
            if let Err(e) = sent {
                warn!(worker = %wid, error = %e, "worker rejected request");
                self.worker_died(wid, &e.to_string());
                return true;
            }
        }
    }

    fn start_worker(&mut self, queue: &str, access: &str) -> AcquireResult<WorkerId> {
        let wid = WorkerId(self.next_worker);
        self.next_worker += 1;

        let sink = EventSink::new(wid, self.events_tx.clone());
        let transport = self.transports.spawn(access, &self.config, sink)?;
        info!(worker = %wid, access, queue, "worker started");

        self.workers.insert(
            wid,
            Worker {
                queue: queue.to_string(),
                access: access.to_string(),
                transport,
                config: None,
                last_activity: Instant::now(),
            },
        );
        if let Some(q) = self.queues.get_mut(queue) {
            q.worker = Some(wid);
        }
        Ok(wid)
    }

    fn stop_worker(&mut self, wid: WorkerId) -> Option<Worker> {
        let mut worker = self.workers.remove(&wid)?;
        worker.transport.shutdown();
        if let Some(queue) = self.queues.get_mut(&worker.queue) {
            if queue.worker == Some(wid) {
                queue.worker = None;
            }
        }
        Some(worker)
    }

    /// `600 URI Acquire` for `owner`.
    fn acquire_message(&self, owner: ItemId, uri: &str) -> Message {
        let mut msg = Message::new(message::URI_ACQUIRE, "URI Acquire").with("URI", uri);
        if let Some(item) = self.arena.get(owner) {
            msg.set("Filename", item.dest_file().display().to_string());
            for (key, value) in item.custom_headers(&self.config) {
                msg.set(key, value);
            }
        }
        msg
    }

    /// `601 Configuration` with the settings transports care about.
    fn configuration_message(&self) -> Message {
        let config = &self.config;
        Message::new(message::CONFIGURATION, "Configuration")
            .with("Config-Item", format!("Acquire::Retries={}", config.retries))
            .with(
                "Config-Item",
                format!("Acquire::http::Timeout={}", config.http_timeout.as_secs()),
            )
            .with(
                "Config-Item",
                format!("Acquire::http::Pipeline-Depth={}", config.pipeline_depth),
            )
            .with(
                "Config-Item",
                format!("Acquire::GzipIndexes={}", config.gzip_indexes),
            )
            .with(
                "Config-Item",
                format!("Dir::Bin::gpg={}", config.gpgv.binary.display()),
            )
    }

    /// Fail every entry of a queue whose worker cannot run.
    fn fail_queue(&mut self, name: &str, access: &str, reason: &str) {
        let entries = match self.queues.get_mut(name) {
            Some(queue) => queue.drain(),
            None => return,
        };
        let cnf = MethodConfig::new(access);
        for entry in entries {
            let msg = Message::new(message::URI_FAILURE, "URI Failure")
                .with("URI", &entry.desc.uri)
                .with("Message", reason);
            self.dispatch(entry, &msg, &cnf, Dispatch::Failed);
        }
    }

    /// A worker is gone: fail what it had in flight, keep the rest queued.
    fn worker_died(&mut self, wid: WorkerId, reason: &str) {
        let Some(worker) = self.stop_worker(wid) else {
            return;
        };
        error!(worker = %wid, access = %worker.access, reason, "worker stopped");

        let entries = match self.queues.get_mut(&worker.queue) {
            Some(queue) => queue.take_in_flight(),
            None => Vec::new(),
        };
        let cnf = worker.config.unwrap_or_else(|| MethodConfig::new(&worker.access));
        for entry in entries {
            let msg = Message::new(message::URI_FAILURE, "URI Failure")
                .with("URI", &entry.desc.uri)
                .with("Message", reason);
            self.dispatch(entry, &msg, &cnf, Dispatch::Failed);
        }
    }

    /// Restart stalled workers once per entry, then fail the entries.
    fn check_timeouts(&mut self) {
        let timeout = self.config.worker_timeout;
        let stalled: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, w)| w.last_activity.elapsed() >= timeout)
            .filter(|(_, w)| {
                w.config.is_none()
                    || self
                        .queues
                        .get(&w.queue)
                        .is_some_and(|q| q.in_flight() > 0)
            })
            .map(|(id, _)| *id)
            .collect();

        for wid in stalled {
            let Some(worker) = self.stop_worker(wid) else {
                continue;
            };
            warn!(worker = %wid, access = %worker.access, timeout = ?timeout, "worker timed out");

            let entries = match self.queues.get_mut(&worker.queue) {
                Some(queue) => queue.take_in_flight(),
                None => Vec::new(),
            };
            let (retry, give_up): (Vec<QueueEntry>, Vec<QueueEntry>) =
                entries.into_iter().partition(|e| e.timeouts == 0);

            if let Some(queue) = self.queues.get_mut(&worker.queue) {
                let retry = retry
                    .into_iter()
                    .map(|mut e| {
                        e.timeouts += 1;
                        e
                    })
                    .collect();
                queue.requeue_front(retry);
            }

            let cnf = worker.config.unwrap_or_else(|| MethodConfig::new(&worker.access));
            for entry in give_up {
                let msg = Message::new(message::URI_FAILURE, "URI Failure")
                    .with("URI", &entry.desc.uri)
                    .with("Message", "Connection timed out")
                    .with("FailReason", "Timeout")
                    .with("Transient-Failure", "true");
                self.dispatch(entry, &msg, &cnf, Dispatch::Failed);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Events
    // -------------------------------------------------------------------------

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Message { worker, message } => self.handle_message(worker, message),
            WorkerEvent::Closed { worker, reason } => self.worker_died(worker, &reason),
        }
    }

    fn handle_message(&mut self, wid: WorkerId, msg: Message) {
        let Some(worker) = self.workers.get_mut(&wid) else {
            debug!(worker = %wid, code = msg.code, "message from a stopped worker");
            return;
        };
        worker.last_activity = Instant::now();
        let queue = worker.queue.clone();
        let access = worker.access.clone();
        let uri = msg.get("URI").to_string();

        match msg.code {
            message::CAPABILITIES => {
                let cnf = MethodConfig::from_capabilities(&access, &msg);
                debug!(worker = %wid, config = ?cnf, "capabilities");
                if cnf.send_config {
                    let config_msg = self.configuration_message();
                    if let Some(worker) = self.workers.get_mut(&wid) {
                        if let Err(e) = worker.transport.send(config_msg) {
                            self.worker_died(wid, &e.to_string());
                            return;
                        }
                    }
                }
                if let Some(worker) = self.workers.get_mut(&wid) {
                    worker.config = Some(cnf.clone());
                }
                self.method_configs.insert(access, cnf);
            }
            message::LOG => debug!(worker = %wid, "{}", msg.get("Message")),
            message::STATUS => debug!(worker = %wid, uri = %uri, status = msg.get("Message"), "method status"),
            message::REDIRECT => self.redirect(&queue, &uri, msg.get("New-URI")),
            message::URI_START => {
                let Some(entry) = self.queues.get(&queue).and_then(|q| q.in_flight_entry(&uri)) else {
                    return;
                };
                let size = msg.lookup_u64("Size");
                for owner in entry.owners.clone() {
                    if let Some(item) = self.arena.get_mut(owner) {
                        item.start(size);
                        self.status.fetch(item);
                    }
                }
            }
            message::URI_DONE | message::URI_FAILURE => {
                let cnf = self
                    .workers
                    .get(&wid)
                    .and_then(|w| w.config.clone())
                    .unwrap_or_else(|| MethodConfig::new(&access));
                let Some(entry) = self.queues.get_mut(&queue).and_then(|q| q.finish(&uri)) else {
                    debug!(worker = %wid, uri = %uri, "reply for a URI no longer queued");
                    return;
                };
                let kind = if msg.code == message::URI_DONE {
                    Dispatch::Done
                } else {
                    Dispatch::Failed
                };
                self.dispatch(entry, &msg, &cnf, kind);
            }
            message::GENERAL_FAILURE => {
                let reason = format!("Method {} General failure: {}", access, msg.get("Message"));
                self.worker_died(wid, &reason);
            }
            other => warn!(worker = %wid, code = other, "unexpected message from method"),
        }
    }

    fn redirect(&mut self, queue: &str, uri: &str, new_uri: &str) {
        if new_uri.is_empty() {
            warn!(uri, "redirect without a target");
            return;
        }
        let Some(entry) = self.queues.get_mut(queue).and_then(|q| q.finish(uri)) else {
            return;
        };
        info!(from = uri, to = new_uri, "redirected");
        for owner in entry.owners {
            let Some(item) = self.arena.get_mut(owner) else {
                continue;
            };
            item.core.queue_counter = item.core.queue_counter.saturating_sub(1);
            item.core.desc.uri = new_uri.to_string();
            let desc = item.core.desc.clone();
            self.enqueue(owner, desc);
        }
    }

    /// Run the done or failed handler of every owner of a finished entry.
    fn dispatch(&mut self, entry: QueueEntry, msg: &Message, cnf: &MethodConfig, kind: Dispatch) {
        let mut outcomes = Vec::with_capacity(entry.owners.len());
        for owner in entry.owners {
            let Some(mut item) = self.arena.take(owner) else {
                continue;
            };
            let out = {
                let ctx = HandlerContext {
                    config: &self.config,
                    arena: &self.arena,
                };
                match kind {
                    Dispatch::Done => {
                        let info = done_info(&item, msg);
                        item.done(msg, &info, cnf, &ctx)
                    }
                    Dispatch::Failed => {
                        debug!(item = %owner, uri = %entry.desc.uri, reason = msg.get("Message"), "transfer failed");
                        item.failed(msg, cnf, &ctx)
                    }
                }
            };
            item.core.queue_counter = item.core.queue_counter.saturating_sub(1);
            self.arena.put(item);
            outcomes.push((owner, out));
        }

        let owners: Vec<ItemId> = outcomes.iter().map(|(id, _)| *id).collect();
        for (owner, out) in outcomes {
            self.apply(owner, out);
        }

        // reported once follow-up passes are queued
        for owner in owners {
            let Some(item) = self.arena.get(owner) else {
                continue;
            };
            match kind {
                Dispatch::Done => self.status.done(item),
                Dispatch::Failed => self.status.fail(item),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Run loop
    // -------------------------------------------------------------------------

    /// Fetch everything queued and everything it leads to.
    pub async fn run(&mut self) -> AcquireResult<RunResult> {
        info!(items = self.arena.len(), "acquire run starting");
        self.started = Instant::now();

        let shutdown = self.shutdown.clone();
        let tick_every = self
            .config
            .pulse_interval
            .min(self.config.worker_timeout / 2)
            .max(MIN_TICK);
        let mut tick = tokio::time::interval(tick_every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_pulse = Instant::now();

        let outcome = loop {
            self.cycle();
            if self.is_idle() {
                break Ok(false);
            }

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("acquire run cancelled");
                    break Ok(true);
                }

                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break Err(AcquireError::EventChannelClosed),
                },

                _ = tick.tick() => {
                    self.check_timeouts();
                    if last_pulse.elapsed() >= self.config.pulse_interval {
                        let snapshot = self.snapshot();
                        self.status.pulse(&snapshot);
                        last_pulse = Instant::now();
                    }
                }
            }
        };

        self.finish();
        let cancelled = outcome?;
        let result = if cancelled {
            RunResult::Cancelled
        } else if self.summary.has_failures() {
            RunResult::Failed
        } else {
            RunResult::Continue
        };
        info!(
            result = ?result,
            done = self.summary.items_done,
            failed = self.summary.items_failed,
            bytes = self.summary.fetched_bytes,
            "acquire run finished"
        );
        Ok(result)
    }

    /// Stop workers, retire items and total up the run.
    fn finish(&mut self) {
        let workers: Vec<WorkerId> = self.workers.keys().copied().collect();
        for wid in workers {
            self.stop_worker(wid);
        }
        let leftovers: Vec<QueueEntry> = self.queues.values_mut().flat_map(|q| q.drain()).collect();
        for entry in leftovers {
            for owner in entry.owners {
                if let Some(item) = self.arena.get_mut(owner) {
                    item.core.queue_counter = item.core.queue_counter.saturating_sub(1);
                }
            }
        }

        for item in self.arena.iter_mut() {
            item.retire(&self.config);
        }

        self.summary.failures = self
            .arena
            .iter()
            .filter(|i| i.status().is_failure())
            .map(|i| FailedItem {
                uri: i.desc().uri.clone(),
                description: i.desc().description.clone(),
                status: format!("{:?}", i.status()),
                error: i.error_text().to_string(),
            })
            .collect();
        self.summary.items_failed = self.summary.failures.len();
        self.summary.items_done = self.arena.count(ItemStatus::Done);
        self.summary.items_transient = self.arena.count(ItemStatus::TransientNetworkError);

        let snapshot = self.snapshot();
        self.status.stop(&snapshot);
    }

    fn snapshot(&self) -> ProgressSnapshot {
        let mut snapshot = ProgressSnapshot {
            total_items: self.arena.len(),
            fetched_bytes: self.summary.fetched_bytes,
            elapsed: self.started.elapsed(),
            ..ProgressSnapshot::default()
        };
        for item in self.arena.iter() {
            snapshot.total_bytes += item.core.file_size;
            match item.status() {
                ItemStatus::Done => {
                    snapshot.done_items += 1;
                    snapshot.current_bytes += item.core.file_size;
                }
                ItemStatus::Fetching => snapshot.current_bytes += item.core.partial_size,
                status if status.is_failure() => snapshot.failed_items += 1,
                _ => {}
            }
        }
        snapshot
    }

    // -------------------------------------------------------------------------
    // Cleaning
    // -------------------------------------------------------------------------

    /// Delete files in `dir` that no item of this engine writes.
    ///
    /// Files are matched by name, so an item working in `partial/` keeps
    /// its final file alive. Directories and the `lock` file are kept.
    pub fn clean(&self, dir: &Path) -> AcquireResult<usize> {
        let entries = fs::read_dir(dir).map_err(|e| AcquireError::read(dir, e))?;
        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| AcquireError::read(dir, e))?;
            let path = entry.path();
            if entry.file_name() == "lock" || path.is_dir() {
                continue;
            }
            let name = entry.file_name();
            if self
                .arena
                .iter()
                .any(|i| i.dest_file().file_name() == Some(name.as_os_str()))
            {
                continue;
            }
            debug!(path = %path.display(), "cleaning");
            fs::remove_file(&path).map_err(|e| AcquireError::write(&path, e))?;
            removed += 1;
        }
        Ok(removed)
    }
}

/// Size and the digest matching the item's expectation.
///
/// Transports normally report every digest; when the one needed is missing
/// it is computed from the reported file.
fn done_info(item: &Item, msg: &Message) -> DoneInfo {
    let size = msg.lookup_u64("Size");
    let Some(kind) = item.expected_hash().and_then(|h| h.hash_type()) else {
        return DoneInfo {
            size,
            hash: String::new(),
        };
    };

    let reported = msg.get(kind.message_field());
    let value = if reported.is_empty() {
        let filename = msg.get("Filename");
        if filename.is_empty() {
            String::new()
        } else {
            Hashes::from_file(Path::new(filename))
                .map(|h| h.get(kind).to_string())
                .unwrap_or_default()
        }
    } else {
        reported.to_string()
    };

    DoneInfo {
        size,
        hash: if value.is_empty() {
            String::new()
        } else {
            format!("{}:{}", kind.name(), value)
        },
    }
}
