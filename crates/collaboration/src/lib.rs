/// Collaboration engine for multi-user timeline editing
/// Operation ordering, conflict detection/resolution and branching version history
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod config;
pub use config::*;

mod operations;
pub use operations::*;

mod reducer;
pub use reducer::*;

mod processor;
pub use processor::*;

mod conflict;
pub use conflict::*;

mod resolver;
pub use resolver::*;

mod version;
pub use version::*;

mod presence;
pub use presence::*;

mod comments;
pub use comments::*;

mod events;
pub use events::*;

mod sync;
pub use sync::*;

mod persistence;
pub use persistence::*;

mod session;
pub use session::*;

#[derive(Debug, Error)]
pub enum CollaborationError {
    #[error("network error: {0}")]
    NetworkError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid operation: {0}")]
    InvalidOp(String),

    #[error("conflict not found: {0}")]
    ConflictNotFound(ConflictId),

    #[error("proposal {proposal} not found on conflict {conflict}")]
    ProposalNotFound {
        conflict: ConflictId,
        proposal: ProposalId,
    },

    #[error("comment not found: {0}")]
    CommentNotFound(CommentId),

    #[error("version not found: {0}")]
    VersionNotFound(VersionId),

    #[error("branch not found: {0}")]
    BranchNotFound(String),

    #[error("version mismatch: {0}")]
    VersionMismatch(String),

    #[error("reconnect failed after {0} attempts")]
    ReconnectFailed(u32),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Timeline(#[from] timeline::TimelineError),
}

impl From<serde_json::Error> for CollaborationError {
    fn from(e: serde_json::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CollaborationError>;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

uuid_id!(
    /// User identifier in a collaborative project
    UserId
);
uuid_id!(
    /// Project identifier; the transport keys its channels by it
    ProjectId
);
uuid_id!(OperationId);
uuid_id!(ConflictId);
uuid_id!(ProposalId);
uuid_id!(VersionId);
uuid_id!(CommentId);
