/// Review comments pinned to clips or timeline positions
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use timeline::{ClipId, Time};
use tracing::debug;

use crate::{CollaborationError, CommentId, Result, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentReply {
    pub id: CommentId,
    pub user_id: UserId,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: CommentId,
    pub user_id: UserId,
    pub clip_id: Option<ClipId>,
    pub time: Option<Time>,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub resolved_by: Option<UserId>,
    #[serde(default)]
    pub replies: Vec<CommentReply>,
}

impl Comment {
    pub fn new(
        user_id: UserId,
        clip_id: Option<ClipId>,
        time: Option<Time>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: CommentId::new(),
            user_id,
            clip_id,
            time,
            text: text.into(),
            created_at: Utc::now(),
            resolved: false,
            resolved_by: None,
            replies: Vec::new(),
        }
    }
}

impl CommentReply {
    pub fn new(user_id: UserId, text: impl Into<String>) -> Self {
        Self {
            id: CommentId::new(),
            user_id,
            text: text.into(),
            created_at: Utc::now(),
        }
    }
}

/// Comment change as replicated between peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommentEvent {
    Added {
        comment: Comment,
    },
    Replied {
        comment_id: CommentId,
        reply: CommentReply,
    },
    Resolved {
        comment_id: CommentId,
        user_id: UserId,
    },
}

impl CommentEvent {
    pub fn comment_id(&self) -> &CommentId {
        match self {
            CommentEvent::Added { comment } => &comment.id,
            CommentEvent::Replied { comment_id, .. } | CommentEvent::Resolved { comment_id, .. } => {
                comment_id
            }
        }
    }
}

/// All comments of a project, in creation order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommentBoard {
    comments: Vec<Comment>,

    /// Remote replies and resolutions whose comment has not arrived yet
    orphans: Vec<CommentEvent>,
}

impl CommentBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_comments(comments: Vec<Comment>) -> Self {
        Self {
            comments,
            orphans: Vec::new(),
        }
    }

    /// Applies an event. Returns `Ok(false)` if it was already applied.
    pub fn apply(&mut self, event: &CommentEvent) -> Result<bool> {
        match event {
            CommentEvent::Added { comment } => {
                if self.get(&comment.id).is_some() {
                    return Ok(false);
                }
                self.comments.push(comment.clone());
                Ok(true)
            }
            CommentEvent::Replied { comment_id, reply } => {
                let comment = self.get_mut(comment_id)?;
                if comment.replies.iter().any(|r| r.id == reply.id) {
                    return Ok(false);
                }
                comment.replies.push(reply.clone());
                Ok(true)
            }
            CommentEvent::Resolved {
                comment_id,
                user_id,
            } => {
                let comment = self.get_mut(comment_id)?;
                if comment.resolved {
                    return Ok(false);
                }
                comment.resolved = true;
                comment.resolved_by = Some(user_id.clone());
                Ok(true)
            }
        }
    }

    /// Applies an event received from a peer. Replies and resolutions for a
    /// comment not seen yet are held until the comment arrives. Returns the
    /// events that took effect, in order.
    pub fn receive(&mut self, event: CommentEvent) -> Vec<CommentEvent> {
        let parent = event.comment_id().clone();
        let is_added = matches!(event, CommentEvent::Added { .. });
        if !is_added && self.get(&parent).is_none() {
            debug!(comment = %parent, "holding comment event until the comment arrives");
            self.orphans.push(event);
            return Vec::new();
        }

        let mut applied = Vec::new();
        if matches!(self.apply(&event), Ok(true)) {
            applied.push(event);
        }
        if is_added {
            let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.orphans)
                .into_iter()
                .partition(|e| e.comment_id() == &parent);
            self.orphans = waiting;
            for held in ready {
                if matches!(self.apply(&held), Ok(true)) {
                    applied.push(held);
                }
            }
        }
        applied
    }

    pub fn held_count(&self) -> usize {
        self.orphans.len()
    }

    pub fn get(&self, id: &CommentId) -> Option<&Comment> {
        self.comments.iter().find(|c| &c.id == id)
    }

    fn get_mut(&mut self, id: &CommentId) -> Result<&mut Comment> {
        self.comments
            .iter_mut()
            .find(|c| &c.id == id)
            .ok_or_else(|| CollaborationError::CommentNotFound(id.clone()))
    }

    pub fn comments(&self) -> &[Comment] {
        &self.comments
    }

    pub fn for_clip(&self, clip_id: &ClipId) -> Vec<&Comment> {
        self.comments
            .iter()
            .filter(|c| c.clip_id.as_ref() == Some(clip_id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.comments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comments.is_empty()
    }

    pub fn unresolved_count(&self) -> usize {
        self.comments.iter().filter(|c| !c.resolved).count()
    }
}
