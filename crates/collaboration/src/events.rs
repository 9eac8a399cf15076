/// Events surfaced to the embedding application
use parking_lot::Mutex;
use serde::Serialize;
use timeline::Time;
use tokio::sync::mpsc;

use crate::{
    Comment, CommentId, CommentReply, Conflict, CursorPosition, Operation, OperationId,
    ProjectVersion, Selection, User, UserId,
};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CollabEvent {
    UserJoined {
        user: User,
    },
    UserLeft {
        user_id: UserId,
    },
    CursorMoved {
        user_id: UserId,
        cursor: CursorPosition,
    },
    SelectionChanged {
        user_id: UserId,
        selection: Selection,
    },
    PlayheadMoved {
        user_id: UserId,
        time: Time,
    },
    TimelineUpdated {
        operation: Operation,
    },

    /// Still waiting on the listed dependencies
    OperationDeferred {
        operation_id: OperationId,
        missing: Vec<OperationId>,
    },
    OperationFailed {
        operation_id: OperationId,
        error: String,
    },
    CommentAdded {
        comment: Comment,
    },
    CommentReplied {
        comment_id: CommentId,
        reply: CommentReply,
    },
    CommentResolved {
        comment_id: CommentId,
        user_id: UserId,
    },
    ConflictDetected {
        conflict: Conflict,
    },
    ConflictResolved {
        conflict: Conflict,
    },
    VersionCreated {
        branch: String,
        version: ProjectVersion,
    },
    Disconnected {
        reason: String,
    },
    Reconnected {
        attempts: u32,
    },

    /// Terminal: no further reconnect attempts are made
    ReconnectFailed {
        attempts: u32,
    },
}

impl CollabEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::UserJoined { .. } => "user_joined",
            Self::UserLeft { .. } => "user_left",
            Self::CursorMoved { .. } => "cursor_moved",
            Self::SelectionChanged { .. } => "selection_changed",
            Self::PlayheadMoved { .. } => "playhead_moved",
            Self::TimelineUpdated { .. } => "timeline_updated",
            Self::OperationDeferred { .. } => "operation_deferred",
            Self::OperationFailed { .. } => "operation_failed",
            Self::CommentAdded { .. } => "comment_added",
            Self::CommentReplied { .. } => "comment_replied",
            Self::CommentResolved { .. } => "comment_resolved",
            Self::ConflictDetected { .. } => "conflict_detected",
            Self::ConflictResolved { .. } => "conflict_resolved",
            Self::VersionCreated { .. } => "version_created",
            Self::Disconnected { .. } => "disconnected",
            Self::Reconnected { .. } => "reconnected",
            Self::ReconnectFailed { .. } => "reconnect_failed",
        }
    }
}

/// Fan-out of [`CollabEvent`]s, one channel per subscriber.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<CollabEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CollabEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Delivers to every live subscriber; closed receivers are dropped.
    pub fn emit(&self, event: CollabEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Drops all listeners. Their receivers see the channel close.
    pub fn clear(&self) {
        self.subscribers.lock().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
