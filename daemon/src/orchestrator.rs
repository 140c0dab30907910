//! Per-project orchestrator.
//!
//! One instance per active project, running as a single task: commands,
//! run execution, persistence, and fan-out all happen on this task, so
//! nothing within a project ever races. Submitted requests queue FIFO
//! with at most one subprocess in flight; every emitted event gets the
//! next project seq, is persisted first, and only then broadcast.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use overture_events::{
    project_sessions, AgentKind, CanonicalEvent, ErrorKind, MessageStore, RunMetrics,
    SessionState, StoredMessage, SubmitError, SubmitRequest,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::{EventStream, RunSpec};
use crate::config::Config;
use crate::error::DaemonError;
use crate::project::ProjectInfo;
use crate::prompt::PromptLoader;
use crate::registry::AdapterRegistry;

/// Shared collaborators handed to every orchestrator.
pub struct OrchestratorDeps {
    pub config: Config,
    pub registry: Arc<AdapterRegistry>,
    pub store: Arc<dyn MessageStore>,
    pub prompts: Arc<PromptLoader>,
}

/// Reply to a subscribe: the transcript snapshot to replay, then the
/// live channel. The snapshot and the channel registration happen in
/// one command on the orchestrator task, so together they cover every
/// event exactly once. `slow` fires if the subscriber's queue
/// overflows and it is dropped.
pub struct SubscribeReply {
    pub subscriber_id: u64,
    pub replay: Vec<StoredMessage>,
    pub rx: mpsc::Receiver<StoredMessage>,
    pub slow: CancellationToken,
}

enum Command {
    Submit {
        request: SubmitRequest,
        reply: oneshot::Sender<Result<String, SubmitError>>,
    },
    Cancel {
        request_id: String,
        reply: oneshot::Sender<bool>,
    },
    Subscribe {
        from_seq: Option<u64>,
        reply: oneshot::Sender<SubscribeReply>,
    },
    Unsubscribe {
        subscriber_id: u64,
    },
    Sessions {
        reply: oneshot::Sender<HashMap<AgentKind, SessionState>>,
    },
    Shutdown,
}

#[derive(Clone)]
pub struct OrchestratorHandle {
    project_id: String,
    tx: mpsc::UnboundedSender<Command>,
}

impl OrchestratorHandle {
    pub async fn submit(&self, request: SubmitRequest) -> Result<String, DaemonError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Submit { request, reply: tx })?;
        let result = rx.await.map_err(|_| self.gone())?;
        result.map_err(DaemonError::Submit)
    }

    pub async fn cancel(&self, request_id: &str) -> Result<bool, DaemonError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Cancel {
            request_id: request_id.to_string(),
            reply: tx,
        })?;
        rx.await.map_err(|_| self.gone())
    }

    pub async fn subscribe(&self, from_seq: Option<u64>) -> Result<SubscribeReply, DaemonError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Subscribe { from_seq, reply: tx })?;
        rx.await.map_err(|_| self.gone())
    }

    pub fn unsubscribe(&self, subscriber_id: u64) {
        let _ = self.tx.send(Command::Unsubscribe { subscriber_id });
    }

    /// Copy-on-read session snapshot.
    pub async fn sessions(&self) -> Result<HashMap<AgentKind, SessionState>, DaemonError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Sessions { reply: tx })?;
        rx.await.map_err(|_| self.gone())
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, command: Command) -> Result<(), DaemonError> {
        self.tx.send(command).map_err(|_| self.gone())
    }

    fn gone(&self) -> DaemonError {
        DaemonError::OrchestratorGone(self.project_id.clone())
    }
}

// ============================================================================
// Internals
// ============================================================================

struct QueuedRequest {
    id: String,
    request: SubmitRequest,
}

struct Subscriber {
    tx: mpsc::Sender<StoredMessage>,
    slow: CancellationToken,
}

/// Control block for the run currently on the loop. Fallback retries
/// register their synthetic request id alongside the originating one so
/// a cancel against either lands.
struct ActiveRun {
    request_ids: Vec<String>,
    cancel: CancellationToken,
    user_cancelled: Arc<AtomicBool>,
}

impl ActiveRun {
    fn new(request_ids: Vec<String>) -> Self {
        Self {
            request_ids,
            cancel: CancellationToken::new(),
            user_cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    fn user_cancelled(&self) -> bool {
        self.user_cancelled.load(Ordering::SeqCst)
    }
}

enum RunEnd {
    Complete,
    Cancelled,
    Failed(ErrorKind),
}

struct RunReport {
    end: RunEnd,
    session_id: Option<String>,
    saw_text: bool,
    model: Option<String>,
    metrics: Option<RunMetrics>,
}

impl RunReport {
    fn failed(kind: ErrorKind, model: Option<String>) -> Self {
        Self {
            end: RunEnd::Failed(kind),
            session_id: None,
            saw_text: false,
            model,
            metrics: None,
        }
    }
}

pub struct Orchestrator {
    project: ProjectInfo,
    deps: OrchestratorDeps,
    queue: VecDeque<QueuedRequest>,
    subscribers: HashMap<u64, Subscriber>,
    next_subscriber_id: u64,
    sessions: HashMap<AgentKind, SessionState>,
    seq: u64,
    request_counter: u64,
    initialized: HashSet<AgentKind>,
    shutting_down: bool,
}

impl Orchestrator {
    pub fn spawn(
        project: ProjectInfo,
        deps: OrchestratorDeps,
    ) -> (OrchestratorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = OrchestratorHandle {
            project_id: project.id.clone(),
            tx,
        };
        let orchestrator = Self {
            project,
            deps,
            queue: VecDeque::new(),
            subscribers: HashMap::new(),
            next_subscriber_id: 1,
            sessions: HashMap::new(),
            seq: 0,
            request_counter: 0,
            initialized: HashSet::new(),
            shutting_down: false,
        };
        let task = tokio::spawn(orchestrator.run(rx));
        (handle, task)
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        if let Err(e) = self.load_sessions().await {
            warn!(project = %self.project.id, error = %e, "failed to load session state from transcript");
        }

        loop {
            if self.shutting_down {
                break;
            }
            if let Some(queued) = self.queue.pop_front() {
                self.execute(queued, &mut cmd_rx).await;
                continue;
            }

            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd, None).await,
                    None => break,
                },
                _ = tokio::time::sleep(self.deps.config.idle_linger), if self.subscribers.is_empty() => {
                    // Retire after the linger, unless a command raced in.
                    match cmd_rx.try_recv() {
                        Ok(cmd) => self.handle_command(cmd, None).await,
                        Err(_) => break,
                    }
                }
            }
        }

        let pending: Vec<QueuedRequest> = self.queue.drain(..).collect();
        for queued in pending {
            let _ = self.emit(&queued.id, CanonicalEvent::status_cancelled()).await;
        }
        self.subscribers.clear();
        info!(project = %self.project.id, "orchestrator stopped");
    }

    async fn load_sessions(&mut self) -> Result<(), DaemonError> {
        let rows = self.deps.store.list_since(&self.project.id, 0).await?;
        let projected = project_sessions(&rows);
        self.sessions = projected.sessions;
        self.seq = projected.last_seq;
        debug!(
            project = %self.project.id,
            seq = self.seq,
            sessions = self.sessions.len(),
            "session state loaded from transcript"
        );
        Ok(())
    }

    async fn handle_command(&mut self, command: Command, active: Option<&ActiveRun>) {
        match command {
            Command::Submit { request, reply } => {
                if let Err(e) = request.validate() {
                    let _ = reply.send(Err(e));
                    return;
                }
                let id = self.next_request_id();
                debug!(project = %self.project.id, request = %id, agent = %request.agent, "request queued");
                self.queue.push_back(QueuedRequest {
                    id: id.clone(),
                    request,
                });
                let _ = reply.send(Ok(id));
            }
            Command::Cancel { request_id, reply } => {
                let mut found = false;
                if let Some(active) = active {
                    if active.request_ids.contains(&request_id) {
                        active.user_cancelled.store(true, Ordering::SeqCst);
                        active.cancel.cancel();
                        found = true;
                    }
                }
                if !found {
                    if let Some(pos) = self.queue.iter().position(|q| q.id == request_id) {
                        if let Some(queued) = self.queue.remove(pos) {
                            let _ = self
                                .emit(&queued.id, CanonicalEvent::status_cancelled())
                                .await;
                            found = true;
                        }
                    }
                }
                let _ = reply.send(found);
            }
            Command::Subscribe { from_seq, reply } => {
                let (tx, rx) = mpsc::channel(self.deps.config.subscriber_queue_capacity);
                let slow = CancellationToken::new();
                let subscriber_id = self.next_subscriber_id;
                self.next_subscriber_id += 1;
                self.subscribers.insert(
                    subscriber_id,
                    Subscriber {
                        tx,
                        slow: slow.clone(),
                    },
                );

                // Registered before the snapshot, and emission only
                // happens on this task: replay + live covers every event
                // exactly once.
                let replay = match from_seq {
                    Some(after) => self
                        .deps
                        .store
                        .list_since(&self.project.id, after)
                        .await
                        .unwrap_or_default(),
                    None => self
                        .deps
                        .store
                        .tail(&self.project.id, self.deps.config.history_replay)
                        .await
                        .unwrap_or_default(),
                };
                let _ = reply.send(SubscribeReply {
                    subscriber_id,
                    replay,
                    rx,
                    slow,
                });
            }
            Command::Unsubscribe { subscriber_id } => {
                self.subscribers.remove(&subscriber_id);
            }
            Command::Sessions { reply } => {
                let _ = reply.send(self.sessions.clone());
            }
            Command::Shutdown => {
                self.shutting_down = true;
                if let Some(active) = active {
                    active.cancel.cancel();
                }
            }
        }
    }

    async fn execute(
        &mut self,
        queued: QueuedRequest,
        cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    ) {
        let agent = queued.request.agent;
        let deadline = queued
            .request
            .deadline_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.deps.config.default_run_deadline);

        let ctl = ActiveRun::new(vec![queued.id.clone()]);
        let report = self.attempt(&queued, agent, &ctl, deadline, cmd_rx).await;

        match report.end {
            RunEnd::Complete => self.finish_complete(&queued.id, agent, report).await,
            RunEnd::Cancelled => {
                let _ = self
                    .emit(&queued.id, CanonicalEvent::status_cancelled())
                    .await;
                self.note_terminal(agent);
            }
            RunEnd::Failed(kind) => {
                let _ = self
                    .emit(&queued.id, CanonicalEvent::status_failed(kind))
                    .await;
                self.note_terminal(agent);

                let fallback = self.deps.config.fallback_agent;
                let eligible = kind.fallback_eligible()
                    && agent != fallback
                    && !ctl.user_cancelled()
                    && !self.shutting_down;
                if !eligible {
                    return;
                }

                let _ = self
                    .emit(&queued.id, CanonicalEvent::status_fellback(agent, fallback))
                    .await;
                let retry_id = self.next_request_id();
                info!(
                    project = %self.project.id,
                    from = %agent,
                    to = %fallback,
                    request = %queued.id,
                    retry = %retry_id,
                    "agent unavailable, retrying on fallback"
                );

                let retry = QueuedRequest {
                    id: retry_id,
                    request: queued.request.clone(),
                };
                let retry_ctl = ActiveRun::new(vec![retry.id.clone(), queued.id.clone()]);
                let retry_report = self
                    .attempt(&retry, fallback, &retry_ctl, deadline, cmd_rx)
                    .await;
                match retry_report.end {
                    RunEnd::Complete => {
                        self.finish_complete(&retry.id, fallback, retry_report).await
                    }
                    RunEnd::Cancelled => {
                        let _ = self
                            .emit(&retry.id, CanonicalEvent::status_cancelled())
                            .await;
                        self.note_terminal(fallback);
                    }
                    RunEnd::Failed(retry_kind) => {
                        let _ = self
                            .emit(&retry.id, CanonicalEvent::status_failed(retry_kind))
                            .await;
                        self.note_terminal(fallback);
                    }
                }
            }
        }
    }

    /// One agent attempt: start event, availability gate, one-time
    /// initialization, then the run with a single no-resume retry if the
    /// prior session id is rejected.
    async fn attempt(
        &mut self,
        queued: &QueuedRequest,
        agent: AgentKind,
        ctl: &ActiveRun,
        deadline: Duration,
        cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    ) -> RunReport {
        let canonical = queued
            .request
            .model
            .clone()
            .or_else(|| self.project.preferred_model.clone());
        let (model, model_fell_back) = match canonical {
            Some(name) => {
                let resolution = self.deps.registry.resolve_model(agent, Some(&name));
                (resolution.native, resolution.fell_back)
            }
            None => match self.sessions.get(&agent).and_then(|s| s.last_model.clone()) {
                Some(last) => (Some(last), false),
                None => (self.deps.registry.resolve_model(agent, None).native, false),
            },
        };

        if self
            .emit(
                &queued.id,
                CanonicalEvent::status_start(agent, model.clone()),
            )
            .await
            .is_err()
        {
            return RunReport::failed(ErrorKind::Internal, model);
        }
        if model_fell_back {
            let _ = self
                .emit(
                    &queued.id,
                    CanonicalEvent::error(
                        ErrorKind::ModelFallback,
                        format!(
                            "unknown model for {agent}; using {}",
                            model.as_deref().unwrap_or("the adapter default")
                        ),
                    ),
                )
                .await;
        }

        let availability = self.deps.registry.availability(agent).await;
        if !availability.installed {
            let message = availability
                .error
                .unwrap_or_else(|| format!("{agent} CLI is not installed"));
            let _ = self
                .emit(
                    &queued.id,
                    CanonicalEvent::error(ErrorKind::CliNotInstalled, message),
                )
                .await;
            return RunReport::failed(ErrorKind::CliNotInstalled, model);
        }

        if !self.initialized.contains(&agent) {
            let role = PromptLoader::role_for(queued.request.is_initial);
            let prompt = self.deps.prompts.load(role).await;
            match self
                .deps
                .registry
                .get(agent)
                .initialize(&self.project.workspace, &prompt)
                .await
            {
                Ok(()) => {
                    self.initialized.insert(agent);
                }
                Err(e) => {
                    warn!(project = %self.project.id, agent = %agent, error = %e, "adapter initialization failed");
                }
            }
        }

        let mut prior = self
            .sessions
            .get(&agent)
            .and_then(|s| s.native_session_id.clone());
        let mut stale_retried = false;
        loop {
            let report = self
                .run_once(queued, agent, model.clone(), prior.clone(), ctl, deadline, cmd_rx)
                .await;
            let stale = matches!(report.end, RunEnd::Failed(ErrorKind::SessionStale));
            if stale && prior.is_some() && !stale_retried && !ctl.user_cancelled() {
                stale_retried = true;
                prior = None;
                info!(
                    project = %self.project.id,
                    agent = %agent,
                    request = %queued.id,
                    "prior session rejected, retrying without resume"
                );
                continue;
            }
            return report;
        }
    }

    async fn run_once(
        &mut self,
        queued: &QueuedRequest,
        agent: AgentKind,
        model: Option<String>,
        prior_session_id: Option<String>,
        ctl: &ActiveRun,
        deadline: Duration,
        cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    ) -> RunReport {
        let mut instruction = queued.request.instruction.clone();
        if !queued.request.images.is_empty() {
            instruction.push_str("\n\nAttached images (already in the workspace):\n");
            for image in &queued.request.images {
                instruction.push_str(&format!("- {} ({})\n", image.path, image.name));
            }
        }

        let adapter = self.deps.registry.get(agent);
        let mut stream = adapter.run(RunSpec {
            workspace: self.project.workspace.clone(),
            instruction,
            model: model.clone(),
            prior_session_id,
            cancel: ctl.cancel.clone(),
            cancel_grace: self.deps.config.cancel_grace,
        });

        let deadline_at = Instant::now() + deadline;
        let stall = self.deps.config.default_stall;
        let mut stall_at = Instant::now() + stall;

        let mut report = RunReport::failed(ErrorKind::Internal, model);
        let mut pending_tools: Vec<String> = Vec::new();
        let mut timed_out = false;
        let mut ended = false;
        let mut commands_closed = false;

        while !ended {
            tokio::select! {
                cmd = cmd_rx.recv(), if !commands_closed => match cmd {
                    Some(cmd) => self.handle_command(cmd, Some(ctl)).await,
                    None => {
                        // Daemon is dropping us; stop the subprocess.
                        commands_closed = true;
                        self.shutting_down = true;
                        ctl.cancel.cancel();
                    }
                },
                event = stream.next() => match event {
                    Some(event) => {
                        stall_at = Instant::now() + stall;
                        match &event {
                            CanonicalEvent::SessionInfo { native_session_id } => {
                                report.session_id = Some(native_session_id.clone());
                            }
                            CanonicalEvent::AssistantText { .. } => {
                                report.saw_text = true;
                            }
                            CanonicalEvent::ToolCall { call_id, .. } => {
                                pending_tools.push(call_id.clone());
                            }
                            CanonicalEvent::ToolResult { call_id, .. } => {
                                pending_tools.retain(|id| id != call_id);
                            }
                            _ => {}
                        }

                        if event.is_terminal_status() {
                            if let CanonicalEvent::Status { meta, .. } = &event {
                                report.metrics = meta.clone();
                            }
                            report.end = terminal_end(&event);
                            ended = true;
                        } else if let Err(e) = self.emit(&queued.id, event).await {
                            warn!(project = %self.project.id, error = %e, "persistence failed, aborting run");
                            ctl.cancel.cancel();
                            self.drain(&mut stream).await;
                            report.end = RunEnd::Failed(ErrorKind::Internal);
                            ended = true;
                        }
                    }
                    None => {
                        report.end = RunEnd::Failed(ErrorKind::Internal);
                        ended = true;
                    }
                },
                _ = tokio::time::sleep_until(stall_at) => { timed_out = true; }
                _ = tokio::time::sleep_until(deadline_at) => { timed_out = true; }
            }

            if timed_out && !ended {
                let _ = self
                    .emit(
                        &queued.id,
                        CanonicalEvent::error(
                            ErrorKind::Timeout,
                            "run exceeded its stall window or deadline",
                        ),
                    )
                    .await;
                ctl.cancel.cancel();
                self.drain(&mut stream).await;
                report.end = RunEnd::Failed(ErrorKind::Timeout);
                ended = true;
            }
        }

        for call_id in pending_tools {
            let _ = self
                .emit(
                    &queued.id,
                    CanonicalEvent::ToolResult {
                        call_id,
                        ok: false,
                        output: None,
                        error: Some("interrupted".to_string()),
                    },
                )
                .await;
        }

        if timed_out {
            report.end = RunEnd::Failed(ErrorKind::Timeout);
        }
        if ctl.user_cancelled() {
            report.end = RunEnd::Cancelled;
        }
        report
    }

    /// Consume leftover stream events after cancellation, bounded in case
    /// the adapter task misbehaves.
    async fn drain(&self, stream: &mut EventStream) {
        let bound = self.deps.config.cancel_grace + Duration::from_secs(5);
        let _ = tokio::time::timeout(bound, async {
            while let Some(event) = stream.next().await {
                if event.is_terminal_status() {
                    break;
                }
            }
        })
        .await;
    }

    async fn finish_complete(&mut self, request_id: &str, agent: AgentKind, report: RunReport) {
        let _ = self
            .emit(
                request_id,
                CanonicalEvent::status_complete(report.metrics.clone()),
            )
            .await;
        let entry = self.sessions.entry(agent).or_default();
        entry.seq = self.seq;
        if report.saw_text {
            if let Some(session_id) = report.session_id {
                entry.native_session_id = Some(session_id);
            }
            if report.model.is_some() {
                entry.last_model = report.model;
            }
        }
    }

    fn note_terminal(&mut self, agent: AgentKind) {
        self.sessions.entry(agent).or_default().seq = self.seq;
    }

    /// Assign the next seq, persist, then broadcast. Subscribers whose
    /// queue is full are cut loose with their `slow` token fired.
    async fn emit(&mut self, request_id: &str, event: CanonicalEvent) -> Result<(), DaemonError> {
        self.seq += 1;
        let row = StoredMessage::from_event(&self.project.id, self.seq, request_id, event);
        self.deps.store.append(&row).await?;

        let mut dropped = Vec::new();
        for (id, subscriber) in &self.subscribers {
            match subscriber.tx.try_send(row.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(project = %self.project.id, subscriber = id, "subscriber queue overflow, disconnecting");
                    subscriber.slow.cancel();
                    dropped.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dropped.push(*id);
                }
            }
        }
        for id in dropped {
            self.subscribers.remove(&id);
        }
        Ok(())
    }

    fn next_request_id(&mut self) -> String {
        self.request_counter += 1;
        format!("{}-{}", self.request_counter, process_suffix())
    }
}

fn terminal_end(event: &CanonicalEvent) -> RunEnd {
    use overture_events::StatusPhase;
    if let CanonicalEvent::Status { phase, kind, .. } = event {
        match phase {
            StatusPhase::Complete => RunEnd::Complete,
            StatusPhase::Cancelled => RunEnd::Cancelled,
            StatusPhase::Failed => RunEnd::Failed((*kind).unwrap_or(ErrorKind::Internal)),
            StatusPhase::Start | StatusPhase::Fellback => RunEnd::Failed(ErrorKind::Internal),
        }
    } else {
        RunEnd::Failed(ErrorKind::Internal)
    }
}

/// Process-wide random suffix for request ids.
fn process_suffix() -> &'static str {
    static SUFFIX: OnceLock<String> = OnceLock::new();
    SUFFIX.get_or_init(|| {
        let mut id = uuid::Uuid::new_v4().simple().to_string();
        id.truncate(8);
        id
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_suffix_is_stable_and_short() {
        let first = process_suffix();
        let second = process_suffix();
        assert_eq!(first, second);
        assert_eq!(first.len(), 8);
    }

    #[test]
    fn terminal_end_maps_failed_kind() {
        let end = terminal_end(&CanonicalEvent::status_failed(ErrorKind::Timeout));
        assert!(matches!(end, RunEnd::Failed(ErrorKind::Timeout)));
        let end = terminal_end(&CanonicalEvent::status_cancelled());
        assert!(matches!(end, RunEnd::Cancelled));
    }
}
