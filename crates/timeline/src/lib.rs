use thiserror::Error;

#[derive(Debug, Error)]
pub enum TimelineError {
    #[error("clip not found: {0}")]
    ClipNotFound(ClipId),
    #[error("clip already exists: {0}")]
    ClipExists(ClipId),
    #[error("track not found: {0}")]
    TrackNotFound(TrackId),
    #[error("track already exists: {0}")]
    TrackExists(TrackId),
    #[error("invalid change for clip {clip}: {reason}")]
    InvalidChange { clip: ClipId, reason: String },
    #[error("invalid time range: start {start} is after end {end}")]
    InvalidRange { start: Time, end: Time },
}

pub type Result<T> = std::result::Result<T, TimelineError>;

/// Seconds on the timeline.
pub type Time = f64;

/// Declares a string-backed identifier that serializes transparently.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Clone,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            serde::Serialize,
            serde::Deserialize,
        )]
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

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

mod state;
pub use state::*;
mod markers;
pub use markers::*;
mod commands;
pub use commands::*;

string_id!(
    /// Identifier of a clip, unique across the whole timeline.
    ClipId
);
string_id!(TrackId);
string_id!(EffectId);
string_id!(AssetId);
