/// Collaboration session for one project and one local user
///
/// Turns local intents into operations and presence messages, feeds inbound
/// transport traffic into the processor, and owns the connection lifecycle.
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use timeline::{Asset, AssetLibrary, Clip, ClipId, Time, TimelineState, Track, TrackId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{
    CollabConfig, CollabEvent, CollaborationError, Comment, CommentBoard, CommentEvent, CommentId,
    CommentReply, Conflict, ConflictId, ConflictResolver, ConnectionMachine, ConnectionState,
    CursorPosition, EventBus, Operation, OperationId, OperationProcessor, Outbox, PresenceManager,
    PresenceThrottle, PresenceUpdate, ProjectExport, ProjectId, ProjectRecord, ProjectSnapshot,
    ProjectStore, ProjectVersion, ProposalId, Result, Selection, StrategyKind, SyncMessage,
    Transport, User, UserId, VersionControl, VersionHistory, Vote,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStats {
    pub project_id: ProjectId,
    pub connected_users: usize,
    pub track_count: usize,
    pub clip_count: usize,
    pub operation_count: usize,
    pub applied_operations: usize,
    pub queued_operations: usize,
    pub open_conflicts: usize,
    pub total_conflicts: usize,
    pub comment_count: usize,
    pub unresolved_comments: usize,
    pub version_count: usize,
    pub branch_count: usize,
    pub current_branch: String,
    pub connection_state: ConnectionState,
}

#[derive(Default)]
struct SessionTasks {
    heartbeat: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl SessionTasks {
    fn abort_link(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
        if let Some(handle) = self.pump.take() {
            handle.abort();
        }
    }

    fn abort_all(&mut self) {
        self.abort_link();
        if let Some(handle) = self.reconnect.take() {
            handle.abort();
        }
    }

    fn reconnecting(&self) -> bool {
        self.reconnect
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

pub struct CollaborationSession {
    project_id: ProjectId,
    local_user: User,
    config: CollabConfig,
    transport: Arc<dyn Transport>,

    processor: OperationProcessor,
    resolver: Arc<ConflictResolver>,
    events: Arc<EventBus>,

    presence: Mutex<PresenceManager>,
    comments: Mutex<CommentBoard>,
    versions: Mutex<VersionControl>,
    assets: Mutex<Arc<AssetLibrary>>,

    connection: Mutex<ConnectionMachine>,
    outbox: Mutex<Outbox>,
    cursor_throttle: Mutex<PresenceThrottle>,
    playhead_throttle: Mutex<PresenceThrottle>,
    tasks: Mutex<SessionTasks>,
    last_heard: Mutex<Instant>,

    /// Set by `disconnect`; stops automatic reconnects
    closed: AtomicBool,
}

impl CollaborationSession {
    pub fn new(
        project_id: ProjectId,
        local_user: User,
        config: CollabConfig,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Self::with_record(
            ProjectRecord::empty(project_id),
            VersionControl::new(),
            local_user,
            config,
            transport,
        )
    }

    /// Opens a session on a stored project; unknown projects start empty.
    pub async fn open(
        project_id: ProjectId,
        local_user: User,
        config: CollabConfig,
        transport: Arc<dyn Transport>,
        store: &dyn ProjectStore,
    ) -> Result<Arc<Self>> {
        let Some(snapshot) = store.load_project(&project_id).await? else {
            debug!(project = %project_id, "no stored snapshot, starting empty");
            return Ok(Self::new(project_id, local_user, config, transport));
        };

        let versions = VersionControl::from_history(snapshot.versions)?;
        Ok(Self::with_record(
            snapshot.project,
            versions,
            local_user,
            config,
            transport,
        ))
    }

    fn with_record(
        record: ProjectRecord,
        versions: VersionControl,
        local_user: User,
        config: CollabConfig,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let resolver = Arc::new(ConflictResolver::new());
        let events = Arc::new(EventBus::new());
        let processor = OperationProcessor::new(
            record.timeline,
            config.detector,
            resolver.clone(),
            events.clone(),
        );

        let mut presence = PresenceManager::new();
        presence.upsert(local_user.clone());

        Arc::new(Self {
            project_id: record.id,
            processor,
            resolver,
            events,
            presence: Mutex::new(presence),
            comments: Mutex::new(CommentBoard::from_comments(record.comments)),
            versions: Mutex::new(versions),
            assets: Mutex::new(Arc::new(record.assets)),
            connection: Mutex::new(ConnectionMachine::new(config.reconnect)),
            outbox: Mutex::new(Outbox::new()),
            cursor_throttle: Mutex::new(PresenceThrottle::new(config.presence_throttle())),
            playhead_throttle: Mutex::new(PresenceThrottle::new(config.presence_throttle())),
            tasks: Mutex::new(SessionTasks::default()),
            last_heard: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            local_user,
            config,
            transport,
        })
    }

    // --- timeline intents ---

    pub async fn add_clip(self: &Arc<Self>, track_id: TrackId, mut clip: Clip) -> Result<Operation> {
        self.require(self.local_user.permissions.can_edit, "edit the timeline")?;
        clip.edited_by = Some(self.local_user.id.to_string());
        clip.edited_at = Some(Utc::now());

        let deps = self.dependencies_for(&[clip.id.as_str(), track_id.as_str()]);
        let op = Operation::insert_clip(self.local_user.id.clone(), track_id, clip).with_dependencies(deps);
        self.submit(op).await
    }

    /// Shallow-merges `changes` into the clip; stamps `editedBy`/`editedAt`.
    pub async fn modify_clip(
        self: &Arc<Self>,
        clip_id: &ClipId,
        mut changes: Map<String, Value>,
    ) -> Result<Operation> {
        self.require(self.local_user.permissions.can_edit, "edit the timeline")?;
        changes
            .entry("editedBy")
            .or_insert_with(|| Value::String(self.local_user.id.to_string()));
        changes
            .entry("editedAt")
            .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));

        let deps = self.dependencies_for(&[clip_id.as_str()]);
        let op = Operation::modify_clip(self.local_user.id.clone(), clip_id, changes).with_dependencies(deps);
        self.submit(op).await
    }

    pub async fn delete_clip(self: &Arc<Self>, clip_id: &ClipId) -> Result<Operation> {
        self.require(self.local_user.permissions.can_edit, "edit the timeline")?;
        let deps = self.dependencies_for(&[clip_id.as_str()]);
        let op = Operation::delete_clip(self.local_user.id.clone(), clip_id).with_dependencies(deps);
        self.submit(op).await
    }

    pub async fn move_clip(
        self: &Arc<Self>,
        clip_id: &ClipId,
        track_id: TrackId,
        start_time: Time,
        end_time: Time,
    ) -> Result<Operation> {
        self.require(self.local_user.permissions.can_edit, "edit the timeline")?;
        let deps = self.dependencies_for(&[clip_id.as_str(), track_id.as_str()]);
        let op = Operation::move_clip(
            self.local_user.id.clone(),
            clip_id,
            track_id,
            start_time,
            end_time,
        )
        .with_dependencies(deps);
        self.submit(op).await
    }

    pub async fn add_track(self: &Arc<Self>, track: Track) -> Result<Operation> {
        self.require(self.local_user.permissions.can_edit, "edit the timeline")?;
        let deps = self.dependencies_for(&[track.id.as_str()]);
        let op = Operation::insert_track(self.local_user.id.clone(), track).with_dependencies(deps);
        self.submit(op).await
    }

    pub async fn delete_track(self: &Arc<Self>, track_id: &TrackId) -> Result<Operation> {
        self.require(self.local_user.permissions.can_edit, "edit the timeline")?;
        let deps = self.dependencies_for(&[track_id.as_str()]);
        let op = Operation::delete_track(self.local_user.id.clone(), track_id).with_dependencies(deps);
        self.submit(op).await
    }

    /// Latest applied operation on each target, so peers apply in causal order.
    fn dependencies_for(&self, targets: &[&str]) -> Vec<OperationId> {
        let mut deps: Vec<OperationId> = Vec::new();
        for target in targets {
            if let Some(id) = self.processor.last_touching(target) {
                if !deps.contains(&id) {
                    deps.push(id);
                }
            }
        }
        deps
    }

    async fn submit(self: &Arc<Self>, op: Operation) -> Result<Operation> {
        self.processor.enqueue(op.clone());
        self.send(SyncMessage::Operation {
            operation: op.clone(),
        })
        .await;
        self.processor.drain();
        Ok(op)
    }

    // --- presence intents ---

    /// Returns whether the update went out; throttled sends are dropped.
    pub async fn update_playhead(self: &Arc<Self>, time: Time) -> bool {
        let update = PresenceUpdate::PlayheadMoved { time };
        self.presence.lock().apply(&self.local_user.id, &update);
        if !self.playhead_throttle.lock().allow() {
            return false;
        }
        self.send_presence(update).await;
        true
    }

    pub async fn update_cursor(self: &Arc<Self>, time: Time, track_id: Option<TrackId>) -> bool {
        let update = PresenceUpdate::CursorMoved {
            cursor: CursorPosition { time, track_id },
        };
        self.presence.lock().apply(&self.local_user.id, &update);
        if !self.cursor_throttle.lock().allow() {
            return false;
        }
        self.send_presence(update).await;
        true
    }

    pub async fn update_selection(self: &Arc<Self>, clip_ids: Vec<ClipId>) {
        let update = PresenceUpdate::SelectionChanged {
            selection: Selection {
                clip_ids,
                range: None,
            },
        };
        self.presence.lock().apply(&self.local_user.id, &update);
        self.send_presence(update).await;
    }

    async fn send_presence(self: &Arc<Self>, update: PresenceUpdate) {
        self.send(SyncMessage::Presence {
            user_id: self.local_user.id.clone(),
            update,
        })
        .await;
    }

    /// Flips online users that went quiet to away.
    pub fn mark_idle_users(&self) -> Vec<UserId> {
        let threshold = chrono::Duration::seconds(self.config.idle_after_secs);
        self.presence.lock().mark_idle_users(threshold)
    }

    // --- comments ---

    pub async fn add_comment(
        self: &Arc<Self>,
        clip_id: Option<ClipId>,
        time: Option<Time>,
        text: impl Into<String>,
    ) -> Result<Comment> {
        self.require(self.local_user.permissions.can_comment, "comment")?;
        let comment = Comment::new(self.local_user.id.clone(), clip_id, time, text);
        self.publish_comment(CommentEvent::Added {
            comment: comment.clone(),
        })
        .await?;
        Ok(comment)
    }

    pub async fn reply_to_comment(
        self: &Arc<Self>,
        comment_id: &CommentId,
        text: impl Into<String>,
    ) -> Result<CommentReply> {
        self.require(self.local_user.permissions.can_comment, "comment")?;
        let reply = CommentReply::new(self.local_user.id.clone(), text);
        self.publish_comment(CommentEvent::Replied {
            comment_id: comment_id.clone(),
            reply: reply.clone(),
        })
        .await?;
        Ok(reply)
    }

    /// Returns false if the comment was already resolved.
    pub async fn resolve_comment(self: &Arc<Self>, comment_id: &CommentId) -> Result<bool> {
        self.require(self.local_user.permissions.can_comment, "comment")?;
        self.publish_comment(CommentEvent::Resolved {
            comment_id: comment_id.clone(),
            user_id: self.local_user.id.clone(),
        })
        .await
    }

    async fn publish_comment(self: &Arc<Self>, event: CommentEvent) -> Result<bool> {
        if !self.apply_comment(&event)? {
            return Ok(false);
        }
        self.send(SyncMessage::Comment { event }).await;
        Ok(true)
    }

    fn apply_comment(&self, event: &CommentEvent) -> Result<bool> {
        if !self.comments.lock().apply(event)? {
            return Ok(false);
        }
        self.emit_comment(event.clone());
        Ok(true)
    }

    fn emit_comment(&self, event: CommentEvent) {
        self.events.emit(match event {
            CommentEvent::Added { comment } => CollabEvent::CommentAdded { comment },
            CommentEvent::Replied { comment_id, reply } => {
                CollabEvent::CommentReplied { comment_id, reply }
            }
            CommentEvent::Resolved {
                comment_id,
                user_id,
            } => CollabEvent::CommentResolved {
                comment_id,
                user_id,
            },
        });
    }

    // --- conflicts ---

    pub fn resolve_conflict(&self, conflict_id: &ConflictId, strategy: StrategyKind) -> Result<bool> {
        self.require(
            self.local_user.permissions.can_resolve_conflicts,
            "resolve conflicts",
        )?;
        let resolved = self
            .resolver
            .resolve_conflict(conflict_id, strategy, &self.local_user.id)?;
        if resolved {
            if let Some(conflict) = self.resolver.get(conflict_id) {
                self.events.emit(CollabEvent::ConflictResolved { conflict });
            }
        }
        Ok(resolved)
    }

    pub fn propose_resolution(
        &self,
        conflict_id: &ConflictId,
        strategy: StrategyKind,
        changes: Value,
    ) -> Result<ProposalId> {
        self.require(self.local_user.permissions.can_comment, "propose resolutions")?;
        self.resolver
            .propose_resolution(conflict_id, self.local_user.id.clone(), strategy, changes)
    }

    pub fn vote_on_proposal(
        &self,
        conflict_id: &ConflictId,
        proposal_id: &ProposalId,
        vote: Vote,
    ) -> Result<()> {
        self.require(self.local_user.permissions.can_comment, "vote on proposals")?;
        self.resolver
            .vote_on_proposal(conflict_id, proposal_id, self.local_user.id.clone(), vote)
    }

    pub fn open_conflicts(&self) -> Vec<Conflict> {
        self.resolver.open_conflicts()
    }

    pub fn conflicts(&self) -> Vec<Conflict> {
        self.resolver.all()
    }

    fn raise_conflict(&self, conflict: Conflict) {
        self.resolver.register(conflict.clone());
        self.events.emit(CollabEvent::ConflictDetected { conflict });
    }

    // --- versions ---

    /// Snapshots the live timeline onto the current branch.
    pub async fn create_version(
        self: &Arc<Self>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<ProjectVersion> {
        self.require(
            self.local_user.permissions.can_manage_versions,
            "manage versions",
        )?;
        let timeline = self.processor.timeline();
        let assets = self.assets.lock().clone();

        let (branch, version) = {
            let mut versions = self.versions.lock();
            let version =
                versions.commit(name, description, self.local_user.id.clone(), timeline, assets)?;
            (versions.current_branch().to_string(), version)
        };

        self.announce_version(branch, version.clone()).await;
        Ok(version)
    }

    pub fn create_branch(&self, name: &str, from: Option<&crate::VersionId>) -> Result<bool> {
        self.require(
            self.local_user.permissions.can_manage_versions,
            "manage versions",
        )?;
        self.versions.lock().create_branch(name, from)
    }

    pub fn switch_branch(&self, name: &str) -> Result<()> {
        self.versions.lock().switch_branch(name)
    }

    pub async fn merge_branch(
        self: &Arc<Self>,
        source: &str,
        target: &str,
    ) -> Result<Option<ProjectVersion>> {
        self.require(
            self.local_user.permissions.can_manage_versions,
            "manage versions",
        )?;
        let merged = self
            .versions
            .lock()
            .merge_branch(source, target, self.local_user.id.clone());

        if let Some(version) = &merged {
            self.announce_version(target.to_string(), version.clone()).await;
        }
        Ok(merged)
    }

    async fn announce_version(self: &Arc<Self>, branch: String, version: ProjectVersion) {
        self.events.emit(CollabEvent::VersionCreated {
            branch: branch.clone(),
            version: version.clone(),
        });
        self.send(SyncMessage::Version { branch, version }).await;
    }

    pub fn version_history(&self) -> VersionHistory {
        self.versions.lock().to_history()
    }

    pub fn history(&self, branch: &str) -> Vec<ProjectVersion> {
        self.versions
            .lock()
            .history(branch)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn current_branch(&self) -> String {
        self.versions.lock().current_branch().to_string()
    }

    // --- inbound ---

    /// Applies one message received from the transport.
    pub async fn handle_message(self: &Arc<Self>, message: SyncMessage) {
        *self.last_heard.lock() = Instant::now();

        match message {
            SyncMessage::Welcome {
                users, operations, ..
            } => {
                for user in users {
                    self.user_joined(user);
                }
                for op in operations {
                    self.accept_remote(op);
                }
                self.processor.drain();
            }
            SyncMessage::Join { user, .. } => self.user_joined(user),
            SyncMessage::Leave { user_id, .. } => {
                if user_id != self.local_user.id && self.presence.lock().remove(&user_id).is_some() {
                    self.events.emit(CollabEvent::UserLeft { user_id });
                }
            }
            SyncMessage::Operation { operation } => {
                if self.accept_remote(operation) {
                    self.processor.drain();
                }
            }
            SyncMessage::Presence { user_id, update } => self.presence_received(user_id, update),
            SyncMessage::Comment { event } => {
                let applied = self.comments.lock().receive(event);
                for event in applied {
                    self.emit_comment(event);
                }
            }
            SyncMessage::Version { branch, version } => self.version_received(branch, version),
            SyncMessage::Ping => self.send(SyncMessage::Pong).await,
            SyncMessage::Pong => {}
            SyncMessage::Error { message } => {
                warn!(project = %self.project_id, "transport reported error: {}", message)
            }
        }
    }

    fn user_joined(&self, user: User) {
        if user.id == self.local_user.id {
            return;
        }
        if self.presence.lock().upsert(user.clone()) {
            info!(project = %self.project_id, user = %user.id, "{} joined", user.name);
            self.events.emit(CollabEvent::UserJoined { user });
        }
    }

    /// Queues a remote operation unless its author is known to lack edit rights.
    fn accept_remote(&self, op: Operation) -> bool {
        let denied = self
            .presence
            .lock()
            .get(&op.user_id)
            .map(|u| !u.permissions.can_edit)
            .unwrap_or(false);

        if denied {
            warn!(operation = %op.id, user = %op.user_id, "operation from user without edit rights");
            self.raise_conflict(Conflict::permission_denied(&op));
            return false;
        }
        self.processor.enqueue(op);
        true
    }

    fn presence_received(&self, user_id: UserId, update: PresenceUpdate) {
        if user_id == self.local_user.id || !self.presence.lock().apply(&user_id, &update) {
            return;
        }
        let event = match update {
            PresenceUpdate::CursorMoved { cursor } => CollabEvent::CursorMoved { user_id, cursor },
            PresenceUpdate::SelectionChanged { selection } => {
                CollabEvent::SelectionChanged { user_id, selection }
            }
            PresenceUpdate::PlayheadMoved { time } => CollabEvent::PlayheadMoved { user_id, time },
            PresenceUpdate::StatusChanged { .. } => return,
        };
        self.events.emit(event);
    }

    fn version_received(&self, branch: String, version: ProjectVersion) {
        let user_id = version.created_by.clone();
        let result = self.versions.lock().record_remote(&branch, version.clone());

        match result {
            Ok(true) => self.events.emit(CollabEvent::VersionCreated { branch, version }),
            Ok(false) => {}
            Err(CollaborationError::VersionMismatch(reason)) => {
                warn!(project = %self.project_id, "{}", reason);
                let parent = version
                    .parent_version
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                self.raise_conflict(Conflict::version_mismatch(
                    user_id,
                    version.id.to_string(),
                    parent,
                ));
            }
            Err(e) => warn!(project = %self.project_id, "dropping remote version: {}", e),
        }
    }

    /// Forwards inbound messages until the stream ends; a stream that ends
    /// while connected counts as a lost connection.
    pub fn pump(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<SyncMessage>) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Some(session) = weak.upgrade() else {
                    return;
                };
                session.handle_message(message).await;
            }
            if let Some(session) = weak.upgrade() {
                session.connection_lost("transport closed");
            }
        });
        if let Some(previous) = self.tasks.lock().pump.replace(handle) {
            previous.abort();
        }
    }

    // --- connection ---

    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        self.closed.store(false, Ordering::Release);
        {
            let mut connection = self.connection.lock();
            connection.reset();
            connection.begin_connect();
        }

        match self.transport.connect(&self.project_id, &self.local_user).await {
            Ok(rx) => {
                self.connection.lock().connected();
                info!(project = %self.project_id, user = %self.local_user.id, "connected");
                self.link_up(rx).await;
                Ok(())
            }
            Err(e) => {
                warn!(project = %self.project_id, "connect failed: {}", e);
                self.connection_lost("connect failed");
                Err(e)
            }
        }
    }

    /// Retries with exponential backoff until connected or the attempt
    /// budget is spent. Exhaustion is terminal and emits `reconnect_failed`.
    pub async fn reconnect(self: &Arc<Self>) -> Result<()> {
        self.tasks.lock().abort_link();

        loop {
            let next = self.connection.lock().next_attempt();
            let Some(delay) = next else {
                let attempts = self.connection.lock().attempts();
                error!(project = %self.project_id, attempts, "giving up on reconnect");
                self.events.emit(CollabEvent::ReconnectFailed { attempts });
                return Err(CollaborationError::ReconnectFailed(attempts));
            };

            tokio::time::sleep(delay).await;
            if self.closed.load(Ordering::Acquire) {
                return Ok(());
            }

            match self.transport.connect(&self.project_id, &self.local_user).await {
                Ok(rx) => {
                    let attempts = self.connection.lock().connected();
                    info!(project = %self.project_id, attempts, "reconnected");
                    self.events.emit(CollabEvent::Reconnected { attempts });
                    self.link_up(rx).await;
                    return Ok(());
                }
                Err(e) => {
                    let attempt = self.connection.lock().attempts();
                    warn!(project = %self.project_id, attempt, "reconnect attempt failed: {}", e);
                }
            }
        }
    }

    async fn link_up(self: &Arc<Self>, rx: mpsc::UnboundedReceiver<SyncMessage>) {
        *self.last_heard.lock() = Instant::now();
        self.pump(rx);
        self.start_heartbeat();
        self.flush_outbox().await;
    }

    fn start_heartbeat(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.heartbeat_interval();
        let timeout = self.config.heartbeat_timeout();

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(session) = weak.upgrade() else {
                    return;
                };

                let silent_for = session.last_heard.lock().elapsed();
                if silent_for > timeout {
                    warn!(project = %session.project_id, ?silent_for, "heartbeat timed out");
                    session.connection_lost("heartbeat timeout");
                    return;
                }
                if let Err(e) = session.transport.send(SyncMessage::Ping).await {
                    warn!(project = %session.project_id, "heartbeat failed: {}", e);
                    session.connection_lost("heartbeat failed");
                    return;
                }
            }
        });

        if let Some(previous) = self.tasks.lock().heartbeat.replace(handle) {
            previous.abort();
        }
    }

    /// Starts a background reconnect unless one is running or the user closed
    /// the session.
    fn connection_lost(self: &Arc<Self>, reason: &str) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let mut tasks = self.tasks.lock();
        if tasks.reconnecting() {
            return;
        }
        tasks.abort_link();
        self.connection.lock().disconnected();
        self.events.emit(CollabEvent::Disconnected {
            reason: reason.to_string(),
        });

        let session = self.clone();
        tasks.reconnect = Some(tokio::spawn(async move {
            let _ = session.reconnect().await;
        }));
    }

    async fn send(self: &Arc<Self>, message: SyncMessage) {
        if self.connection_state() != ConnectionState::Connected {
            self.outbox.lock().push(message);
            return;
        }

        if let Err(e) = self.transport.send(message.clone()).await {
            warn!(project = %self.project_id, "send failed, buffering: {}", e);
            self.outbox.lock().push(message);
            self.connection_lost("send failed");
        }
    }

    async fn flush_outbox(self: &Arc<Self>) {
        let pending = self.outbox.lock().drain();
        if pending.is_empty() {
            return;
        }
        debug!(project = %self.project_id, count = pending.len(), "flushing outbox");

        let mut pending = pending.into_iter();
        while let Some(message) = pending.next() {
            if let Err(e) = self.transport.send(message.clone()).await {
                warn!(project = %self.project_id, "outbox flush failed: {}", e);
                let mut unsent = vec![message];
                unsent.extend(pending);
                self.outbox.lock().restore(unsent);
                self.connection_lost("send failed");
                return;
            }
        }
    }

    /// Leaves the project and stops all background work.
    ///
    /// Operations already queued are still drained; remote presence and event
    /// listeners are cleared.
    pub async fn disconnect(self: &Arc<Self>) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.tasks.lock().abort_all();

        if self.connection_state() == ConnectionState::Connected {
            let leave = SyncMessage::Leave {
                project_id: self.project_id.clone(),
                user_id: self.local_user.id.clone(),
            };
            if let Err(e) = self.transport.send(leave).await {
                debug!(project = %self.project_id, "leave not delivered: {}", e);
            }
        }
        if let Err(e) = self.transport.disconnect().await {
            warn!(project = %self.project_id, "transport disconnect failed: {}", e);
        }

        self.connection.lock().reset();
        info!(project = %self.project_id, user = %self.local_user.id, "disconnected");
        self.events.emit(CollabEvent::Disconnected {
            reason: "closed".to_string(),
        });

        self.presence.lock().retain_only(&self.local_user.id);
        self.events.clear();
        self.processor.drain();
        Ok(())
    }

    // --- queries ---

    pub fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    pub fn local_user(&self) -> &User {
        &self.local_user
    }

    pub fn timeline(&self) -> Arc<TimelineState> {
        self.processor.timeline()
    }

    pub fn comments(&self) -> Vec<Comment> {
        self.comments.lock().comments().to_vec()
    }

    pub fn assets(&self) -> Arc<AssetLibrary> {
        self.assets.lock().clone()
    }

    /// Registers media in the local library; it travels with saves and versions.
    pub fn add_asset(&self, asset: Asset) {
        let mut assets = self.assets.lock();
        Arc::make_mut(&mut *assets).insert(asset.id.clone(), asset);
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.lock().state()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CollabEvent> {
        self.events.subscribe()
    }

    pub fn get_connected_users(&self) -> Vec<User> {
        self.presence.lock().users()
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.lock().len()
    }

    /// Drains queued operations now; inbound traffic does this automatically.
    pub fn process_pending(&self) -> crate::DrainReport {
        self.processor.drain()
    }

    pub fn get_project_stats(&self) -> ProjectStats {
        let timeline = self.processor.timeline();
        let (comment_count, unresolved_comments) = {
            let board = self.comments.lock();
            (board.len(), board.unresolved_count())
        };
        let (version_count, branch_count, current_branch) = {
            let versions = self.versions.lock();
            (
                versions.len(),
                versions.branches().len(),
                versions.current_branch().to_string(),
            )
        };

        ProjectStats {
            project_id: self.project_id.clone(),
            connected_users: self.presence.lock().len(),
            track_count: timeline.tracks.len(),
            clip_count: timeline.clip_count(),
            operation_count: self.processor.operation_count(),
            applied_operations: self.processor.applied_count(),
            queued_operations: self.processor.queued_len(),
            open_conflicts: self.resolver.open_count(),
            total_conflicts: self.resolver.len(),
            comment_count,
            unresolved_comments,
            version_count,
            branch_count,
            current_branch,
            connection_state: self.connection_state(),
        }
    }

    // --- persistence ---

    fn record(&self) -> ProjectRecord {
        ProjectRecord {
            id: self.project_id.clone(),
            timeline: (*self.processor.timeline()).clone(),
            assets: self.assets.lock().as_ref().clone(),
            comments: self.comments(),
        }
    }

    pub fn snapshot(&self) -> ProjectSnapshot {
        ProjectSnapshot {
            project: self.record(),
            versions: self.version_history(),
        }
    }

    pub async fn save(&self, store: &dyn ProjectStore) -> Result<()> {
        store.save_project(&self.snapshot()).await
    }

    pub fn export_project(&self) -> Result<String> {
        ProjectExport::new(self.record(), self.version_history(), self.processor.entries()).to_json()
    }

    /// Replaces local state with an export of the same project.
    pub fn import_project(&self, json: &str) -> Result<()> {
        let export = ProjectExport::from_json(json)?;
        if export.project.id != self.project_id {
            return Err(CollaborationError::InvalidOp(format!(
                "export belongs to project {}, not {}",
                export.project.id, self.project_id
            )));
        }

        let versions = VersionControl::from_history(export.version_history)?;
        *self.versions.lock() = versions;
        *self.comments.lock() = CommentBoard::from_comments(export.project.comments);
        *self.assets.lock() = Arc::new(export.project.assets);
        self.processor
            .restore(export.project.timeline, export.operation_history);
        self.processor.drain();

        info!(project = %self.project_id, "imported project");
        Ok(())
    }

    fn require(&self, allowed: bool, action: &str) -> Result<()> {
        if allowed {
            Ok(())
        } else {
            Err(CollaborationError::PermissionDenied(format!(
                "{} ({:?}) may not {}",
                self.local_user.id, self.local_user.role, action
            )))
        }
    }
}

impl Drop for CollaborationSession {
    fn drop(&mut self) {
        self.tasks.lock().abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConflictType, LocalHub, MemoryStore, Role};
    use serde_json::json;
    use timeline::TrackKind;

    fn session(hub: &Arc<LocalHub>, id: &str, role: Role) -> Arc<CollaborationSession> {
        CollaborationSession::new(
            "p1".into(),
            User::new(id.into(), id, role),
            CollabConfig::default(),
            Arc::new(hub.transport()),
        )
    }

    #[tokio::test]
    async fn offline_edits_apply_locally_and_flush_on_connect() {
        let hub = LocalHub::new();
        let alice = session(&hub, "alice", Role::Owner);

        alice.add_track(Track::new("t1", TrackKind::Video, 0)).await.unwrap();
        alice
            .add_clip("t1".into(), Clip::new("c1", "a1", 0.0, 5.0))
            .await
            .unwrap();
        assert_eq!(alice.timeline().clip_count(), 1);
        assert_eq!(alice.outbox_len(), 2);

        alice.connect().await.unwrap();
        assert_eq!(alice.outbox_len(), 0);
        assert_eq!(alice.connection_state(), ConnectionState::Connected);

        alice.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn local_edits_chain_dependencies() {
        let hub = LocalHub::new();
        let alice = session(&hub, "alice", Role::Editor);

        let track = alice.add_track(Track::new("t1", TrackKind::Video, 0)).await.unwrap();
        let insert = alice
            .add_clip("t1".into(), Clip::new("c1", "a1", 0.0, 5.0))
            .await
            .unwrap();
        assert_eq!(insert.dependencies, vec![track.id]);

        let modify = alice
            .modify_clip(&"c1".into(), json!({ "locked": true }).as_object().cloned().unwrap())
            .await
            .unwrap();
        assert_eq!(modify.dependencies, vec![insert.id]);

        let clip = timeline::find_clip(&alice.timeline(), &"c1".into())
            .cloned()
            .unwrap();
        assert!(clip.locked);
        assert_eq!(clip.edited_by.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn viewers_cannot_edit() {
        let hub = LocalHub::new();
        let viewer = session(&hub, "vic", Role::Viewer);
        let err = viewer
            .add_track(Track::new("t1", TrackKind::Video, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, CollaborationError::PermissionDenied(_)));
        assert!(viewer.add_comment(None, Some(1.0), "hi").await.is_err());
    }

    #[tokio::test]
    async fn remote_edit_from_reviewer_raises_permission_conflict() {
        let hub = LocalHub::new();
        let alice = session(&hub, "alice", Role::Owner);
        alice.add_track(Track::new("t1", TrackKind::Video, 0)).await.unwrap();

        alice
            .handle_message(SyncMessage::Join {
                project_id: "p1".into(),
                user: User::new("rita".into(), "Rita", Role::Reviewer),
            })
            .await;
        let op = Operation::delete_track("rita".into(), &"t1".into());
        alice
            .handle_message(SyncMessage::Operation { operation: op })
            .await;

        let conflicts = alice.open_conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::PermissionDenied);
        assert_eq!(alice.timeline().tracks.len(), 1);
    }

    #[tokio::test]
    async fn remote_version_with_unknown_parent_is_a_mismatch() {
        let hub = LocalHub::new();
        let alice = session(&hub, "alice", Role::Owner);
        let bob = session(&hub, "bob", Role::Owner);

        bob.create_version("v1", "").await.unwrap();
        let v2 = bob.create_version("v2", "").await.unwrap();

        alice
            .handle_message(SyncMessage::Version {
                branch: "main".to_string(),
                version: v2,
            })
            .await;
        assert_eq!(alice.open_conflicts()[0].conflict_type, ConflictType::VersionMismatch);
        assert!(alice.history("main").is_empty());
    }

    #[tokio::test]
    async fn comments_round_trip_through_events() {
        let hub = LocalHub::new();
        let alice = session(&hub, "alice", Role::Reviewer);
        let mut events = alice.subscribe();

        let comment = alice
            .add_comment(Some("c1".into()), None, "flash frame here")
            .await
            .unwrap();
        alice.reply_to_comment(&comment.id, "fixed").await.unwrap();
        assert!(alice.resolve_comment(&comment.id).await.unwrap());
        assert!(!alice.resolve_comment(&comment.id).await.unwrap());

        assert!(matches!(events.recv().await, Some(CollabEvent::CommentAdded { .. })));
        assert!(matches!(events.recv().await, Some(CollabEvent::CommentReplied { .. })));
        assert!(matches!(events.recv().await, Some(CollabEvent::CommentResolved { .. })));
        assert_eq!(alice.get_project_stats().unresolved_comments, 0);
    }

    #[tokio::test]
    async fn reply_arriving_before_its_comment_is_kept() {
        let hub = LocalHub::new();
        let alice = session(&hub, "alice", Role::Reviewer);
        let mut events = alice.subscribe();

        let comment = Comment::new("bob".into(), None, Some(1.0), "dropout");
        let reply = CommentReply::new("carol".into(), "same here");
        alice
            .handle_message(SyncMessage::Comment {
                event: CommentEvent::Replied {
                    comment_id: comment.id.clone(),
                    reply: reply.clone(),
                },
            })
            .await;
        assert!(alice.comments().is_empty());

        alice
            .handle_message(SyncMessage::Comment {
                event: CommentEvent::Added {
                    comment: comment.clone(),
                },
            })
            .await;
        assert_eq!(alice.comments()[0].replies, vec![reply]);
        assert!(matches!(events.recv().await, Some(CollabEvent::CommentAdded { .. })));
        assert!(matches!(events.recv().await, Some(CollabEvent::CommentReplied { .. })));
    }

    #[tokio::test]
    async fn save_and_open_restore_state() {
        let hub = LocalHub::new();
        let store = MemoryStore::new();
        let alice = session(&hub, "alice", Role::Owner);
        alice.add_track(Track::new("t1", TrackKind::Video, 0)).await.unwrap();
        alice.create_version("first", "").await.unwrap();
        alice.save(&store).await.unwrap();

        let reopened = CollaborationSession::open(
            "p1".into(),
            User::new("alice".into(), "Alice", Role::Owner),
            CollabConfig::default(),
            Arc::new(hub.transport()),
            &store,
        )
        .await
        .unwrap();
        assert_eq!(reopened.timeline().tracks.len(), 1);
        assert_eq!(reopened.history("main").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn presence_sends_are_throttled() {
        let hub = LocalHub::new();
        let alice = session(&hub, "alice", Role::Editor);
        alice.connect().await.unwrap();

        assert!(alice.update_playhead(1.0).await);
        assert!(!alice.update_playhead(1.1).await);
        tokio::time::advance(std::time::Duration::from_millis(60)).await;
        assert!(alice.update_playhead(1.2).await);

        let me = alice
            .get_connected_users()
            .into_iter()
            .find(|u| u.id == alice.local_user().id)
            .unwrap();
        assert_eq!(me.playhead, Some(1.2));
        alice.disconnect().await.unwrap();
    }
}
