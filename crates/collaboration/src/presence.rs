/// User presence tracking for collaborative editing
/// Shows where users are working and their current selection
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use timeline::{ClipId, Time, TrackId};

use crate::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Editor,
    Viewer,
    Reviewer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
    pub can_edit: bool,
    pub can_comment: bool,
    pub can_manage_versions: bool,
    pub can_resolve_conflicts: bool,
}

impl Permissions {
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Owner | Role::Editor => Self {
                can_edit: true,
                can_comment: true,
                can_manage_versions: true,
                can_resolve_conflicts: true,
            },
            Role::Reviewer => Self {
                can_edit: false,
                can_comment: true,
                can_manage_versions: false,
                can_resolve_conflicts: false,
            },
            Role::Viewer => Self {
                can_edit: false,
                can_comment: false,
                can_manage_versions: false,
                can_resolve_conflicts: false,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Online,
    Away,
    Offline,
}

/// Color assigned to a user for cursor/selection highlighting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl UserColor {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Generate a color based on user ID (deterministic)
    pub fn from_user_id(user_id: &UserId) -> Self {
        // FNV-1a; ids are arbitrary strings, not always uuids
        let hash = user_id
            .as_str()
            .bytes()
            .fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
                (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
            });
        let [r, g, b, ..] = hash.to_le_bytes();
        Self { r, g, b }
    }

    /// Convert to hex color string
    pub fn to_hex(&self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

/// Cursor position in the timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    pub time: Time,

    /// Track under the cursor, if any
    pub track_id: Option<TrackId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub clip_ids: Vec<ClipId>,

    /// Time range (for range selection)
    #[serde(default)]
    pub range: Option<(Time, Time)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub role: Role,
    pub permissions: Permissions,
    pub cursor: Option<CursorPosition>,
    pub selection: Option<Selection>,
    pub playhead: Option<Time>,
    pub status: UserStatus,
    pub last_seen: DateTime<Utc>,
    pub color: UserColor,
}

impl User {
    pub fn new(id: UserId, name: impl Into<String>, role: Role) -> Self {
        Self {
            color: UserColor::from_user_id(&id),
            id,
            name: name.into(),
            role,
            permissions: Permissions::for_role(role),
            cursor: None,
            selection: None,
            playhead: None,
            status: UserStatus::Online,
            last_seen: Utc::now(),
        }
    }

    /// Update last activity timestamp
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
        if self.status == UserStatus::Away {
            self.status = UserStatus::Online;
        }
    }

    pub fn is_idle(&self, threshold: Duration) -> bool {
        Utc::now() - self.last_seen > threshold
    }
}

/// Ephemeral presence change, sent fire-and-forget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PresenceUpdate {
    CursorMoved { cursor: CursorPosition },
    SelectionChanged { selection: Selection },
    PlayheadMoved { time: Time },
    StatusChanged { status: UserStatus },
}

/// Presence manager tracks all users in a project
#[derive(Debug, Clone, Default)]
pub struct PresenceManager {
    users: HashMap<UserId, User>,
}

impl PresenceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a user. Returns true if the user was not present.
    pub fn upsert(&mut self, user: User) -> bool {
        self.users.insert(user.id.clone(), user).is_none()
    }

    pub fn remove(&mut self, user_id: &UserId) -> Option<User> {
        self.users.remove(user_id)
    }

    pub fn get(&self, user_id: &UserId) -> Option<&User> {
        self.users.get(user_id)
    }

    pub fn contains(&self, user_id: &UserId) -> bool {
        self.users.contains_key(user_id)
    }

    /// All users, ordered by name then id
    pub fn users(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.values().cloned().collect();
        users.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        users
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Applies an update to a known user. Unknown users are ignored.
    pub fn apply(&mut self, user_id: &UserId, update: &PresenceUpdate) -> bool {
        let Some(user) = self.users.get_mut(user_id) else {
            return false;
        };

        match update {
            PresenceUpdate::CursorMoved { cursor } => user.cursor = Some(cursor.clone()),
            PresenceUpdate::SelectionChanged { selection } => {
                user.selection = Some(selection.clone())
            }
            PresenceUpdate::PlayheadMoved { time } => user.playhead = Some(*time),
            PresenceUpdate::StatusChanged { status } => {
                user.status = *status;
                user.last_seen = Utc::now();
                return true;
            }
        }
        user.touch();
        true
    }

    /// Marks online users silent for longer than `threshold` as away.
    pub fn mark_idle_users(&mut self, threshold: Duration) -> Vec<UserId> {
        let mut idle = Vec::new();
        for user in self.users.values_mut() {
            if user.status == UserStatus::Online && user.is_idle(threshold) {
                user.status = UserStatus::Away;
                idle.push(user.id.clone());
            }
        }
        idle
    }

    /// Users that currently have the clip selected
    pub fn users_selecting(&self, clip_id: &ClipId) -> Vec<&User> {
        self.users
            .values()
            .filter(|u| {
                u.selection
                    .as_ref()
                    .map(|s| s.clip_ids.contains(clip_id))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Drops everyone except `keep`.
    pub fn retain_only(&mut self, keep: &UserId) {
        self.users.retain(|id, _| id == keep);
    }
}

/// Client-side rate limit for cursor and playhead sends
#[derive(Debug)]
pub struct PresenceThrottle {
    interval: std::time::Duration,
    last_sent: Option<tokio::time::Instant>,
}

impl PresenceThrottle {
    pub fn new(interval: std::time::Duration) -> Self {
        Self {
            interval,
            last_sent: None,
        }
    }

    /// Returns true (and arms the throttle) if a send is allowed now.
    pub fn allow(&mut self) -> bool {
        let now = tokio::time::Instant::now();
        match self.last_sent {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_sent = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> User {
        User::new("alice".into(), "Alice", Role::Editor)
    }

    #[test]
    fn test_user_color_from_id() {
        let color = UserColor::from_user_id(&"alice".into());
        assert_eq!(color, UserColor::from_user_id(&"alice".into()));

        let hex = color.to_hex();
        assert!(hex.starts_with('#'));
        assert_eq!(hex.len(), 7);
    }

    #[test]
    fn role_permissions() {
        assert!(Permissions::for_role(Role::Owner).can_edit);
        assert!(!Permissions::for_role(Role::Reviewer).can_edit);
        assert!(Permissions::for_role(Role::Reviewer).can_comment);
        assert!(!Permissions::for_role(Role::Viewer).can_comment);
    }

    #[test]
    fn test_presence_manager() {
        let mut manager = PresenceManager::new();
        assert!(manager.upsert(alice()));
        assert!(!manager.upsert(alice()));

        let applied = manager.apply(
            &"alice".into(),
            &PresenceUpdate::CursorMoved {
                cursor: CursorPosition {
                    time: 4.5,
                    track_id: Some("t1".into()),
                },
            },
        );
        assert!(applied);
        assert_eq!(manager.get(&"alice".into()).unwrap().cursor.as_ref().unwrap().time, 4.5);

        assert!(!manager.apply(&"bob".into(), &PresenceUpdate::PlayheadMoved { time: 1.0 }));
    }

    #[test]
    fn test_idle_detection() {
        let mut manager = PresenceManager::new();
        let mut user = alice();
        user.last_seen = Utc::now() - Duration::seconds(120);
        manager.upsert(user);

        let idle = manager.mark_idle_users(Duration::seconds(60));
        assert_eq!(idle, vec![UserId::from("alice")]);
        assert_eq!(manager.get(&"alice".into()).unwrap().status, UserStatus::Away);

        // activity brings the user back
        manager.apply(&"alice".into(), &PresenceUpdate::PlayheadMoved { time: 2.0 });
        assert_eq!(manager.get(&"alice".into()).unwrap().status, UserStatus::Online);
    }

    #[test]
    fn selection_lookup() {
        let mut manager = PresenceManager::new();
        manager.upsert(alice());
        manager.apply(
            &"alice".into(),
            &PresenceUpdate::SelectionChanged {
                selection: Selection {
                    clip_ids: vec!["c1".into()],
                    range: None,
                },
            },
        );
        assert_eq!(manager.users_selecting(&"c1".into()).len(), 1);
        assert!(manager.users_selecting(&"c2".into()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_spaces_sends() {
        let mut throttle = PresenceThrottle::new(std::time::Duration::from_millis(50));
        assert!(throttle.allow());
        assert!(!throttle.allow());

        tokio::time::advance(std::time::Duration::from_millis(60)).await;
        assert!(throttle.allow());
    }
}
