/// Synchronization protocol and transport abstraction for real-time collaboration
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    CollaborationError, CommentEvent, Operation, OperationId, PresenceManager, PresenceUpdate,
    ProjectId, ProjectVersion, ReconnectPolicy, Result, User, UserId,
};

/// Message types exchanged between peers and the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    Join {
        project_id: ProjectId,
        user: User,
    },

    /// Sent to a peer that just joined: who is here and what has happened
    Welcome {
        project_id: ProjectId,
        users: Vec<User>,
        operations: Vec<Operation>,
    },

    Leave {
        project_id: ProjectId,
        user_id: UserId,
    },

    Operation {
        operation: Operation,
    },

    Presence {
        user_id: UserId,
        update: PresenceUpdate,
    },

    Comment {
        event: CommentEvent,
    },

    Version {
        branch: String,
        version: ProjectVersion,
    },

    Ping,
    Pong,

    Error {
        message: String,
    },
}

/// Bidirectional channel keyed by project id.
///
/// Delivery is at-least-once and unordered. `connect` performs the join
/// handshake and hands back the inbound message stream.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        project_id: &ProjectId,
        user: &User,
    ) -> Result<mpsc::UnboundedReceiver<SyncMessage>>;

    async fn send(&self, message: SyncMessage) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}

/// Routing state for one project on a relay.
///
/// Shared by the in-process [`LocalHub`] and the WebSocket server.
#[derive(Debug)]
pub struct RelayRoom {
    project_id: ProjectId,
    peers: HashMap<UserId, mpsc::UnboundedSender<SyncMessage>>,
    presence: PresenceManager,
    backlog: Vec<Operation>,
    seen: HashSet<OperationId>,
}

impl RelayRoom {
    pub fn new(project_id: ProjectId) -> Self {
        Self {
            project_id,
            peers: HashMap::new(),
            presence: PresenceManager::new(),
            backlog: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Registers a peer, sends it the welcome and announces it to the others.
    /// A peer joining again replaces its previous channel.
    pub fn join(&mut self, user: User, tx: mpsc::UnboundedSender<SyncMessage>) -> Result<()> {
        let users: Vec<User> = self
            .presence
            .users()
            .into_iter()
            .filter(|u| u.id != user.id)
            .collect();

        tx.send(SyncMessage::Welcome {
            project_id: self.project_id.clone(),
            users,
            operations: self.backlog.clone(),
        })
        .map_err(|e| CollaborationError::NetworkError(e.to_string()))?;

        let user_id = user.id.clone();
        self.presence.upsert(user.clone());
        self.peers.insert(user_id.clone(), tx);
        self.broadcast(
            Some(&user_id),
            SyncMessage::Join {
                project_id: self.project_id.clone(),
                user,
            },
        );
        Ok(())
    }

    /// Removes a peer and tells the rest. Returns false if it was not here.
    pub fn leave(&mut self, user_id: &UserId) -> bool {
        self.presence.remove(user_id);
        if self.peers.remove(user_id).is_none() {
            return false;
        }
        self.broadcast(
            Some(user_id),
            SyncMessage::Leave {
                project_id: self.project_id.clone(),
                user_id: user_id.clone(),
            },
        );
        true
    }

    /// Handles a message sent by `from`.
    pub fn route(&mut self, from: &UserId, message: SyncMessage) {
        match message {
            SyncMessage::Operation { operation } => {
                if self.seen.insert(operation.id.clone()) {
                    self.backlog.push(operation.clone());
                }
                self.broadcast(Some(from), SyncMessage::Operation { operation });
            }
            SyncMessage::Presence { user_id, update } => {
                self.presence.apply(&user_id, &update);
                self.broadcast(Some(from), SyncMessage::Presence { user_id, update });
            }
            SyncMessage::Ping => {
                if let Some(tx) = self.peers.get(from) {
                    let _ = tx.send(SyncMessage::Pong);
                }
            }
            SyncMessage::Leave { .. } => {
                self.leave(from);
            }
            message @ (SyncMessage::Comment { .. } | SyncMessage::Version { .. }) => {
                self.broadcast(Some(from), message);
            }
            other => {
                debug!(user = %from, "relay ignoring {:?}", other);
            }
        }
    }

    fn broadcast(&mut self, exclude: Option<&UserId>, message: SyncMessage) {
        let mut gone = Vec::new();
        for (user_id, tx) in &self.peers {
            if exclude == Some(user_id) {
                continue;
            }
            if tx.send(message.clone()).is_err() {
                gone.push(user_id.clone());
            }
        }
        for user_id in gone {
            self.peers.remove(&user_id);
            self.presence.remove(&user_id);
        }
    }

    pub fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }
}

/// In-process relay; every [`LocalTransport`] created from it shares the rooms.
#[derive(Debug, Default)]
pub struct LocalHub {
    rooms: Mutex<HashMap<ProjectId, RelayRoom>>,
}

impl LocalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn transport(self: &Arc<Self>) -> LocalTransport {
        LocalTransport {
            hub: self.clone(),
            membership: Mutex::new(None),
        }
    }

    pub fn peer_count(&self, project_id: &ProjectId) -> usize {
        self.rooms
            .lock()
            .get(project_id)
            .map(RelayRoom::peer_count)
            .unwrap_or(0)
    }
}

pub struct LocalTransport {
    hub: Arc<LocalHub>,
    membership: Mutex<Option<(ProjectId, UserId)>>,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(
        &self,
        project_id: &ProjectId,
        user: &User,
    ) -> Result<mpsc::UnboundedReceiver<SyncMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub
            .rooms
            .lock()
            .entry(project_id.clone())
            .or_insert_with(|| RelayRoom::new(project_id.clone()))
            .join(user.clone(), tx)?;
        *self.membership.lock() = Some((project_id.clone(), user.id.clone()));
        Ok(rx)
    }

    async fn send(&self, message: SyncMessage) -> Result<()> {
        let (project_id, user_id) = self
            .membership
            .lock()
            .clone()
            .ok_or_else(|| CollaborationError::NetworkError("not connected".to_string()))?;

        let mut rooms = self.hub.rooms.lock();
        let room = rooms
            .get_mut(&project_id)
            .ok_or_else(|| CollaborationError::NetworkError("room closed".to_string()))?;
        room.route(&user_id, message);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let Some((project_id, user_id)) = self.membership.lock().take() else {
            return Ok(());
        };
        let mut rooms = self.hub.rooms.lock();
        if let Some(room) = rooms.get_mut(&project_id) {
            room.leave(&user_id);
            if room.is_empty() {
                rooms.remove(&project_id);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Connection lifecycle with bounded reconnect attempts
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    attempts: u32,
    policy: ReconnectPolicy,
}

impl ConnectionMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn begin_connect(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    /// Marks the connection up; returns how many reconnect attempts it took.
    pub fn connected(&mut self) -> u32 {
        self.state = ConnectionState::Connected;
        std::mem::take(&mut self.attempts)
    }

    /// Schedules the next reconnect attempt, or `None` once the budget is spent.
    pub fn next_attempt(&mut self) -> Option<Duration> {
        if self.attempts >= self.policy.max_attempts {
            self.state = ConnectionState::Disconnected;
            return None;
        }
        self.attempts += 1;
        self.state = ConnectionState::Connecting;
        Some(self.policy.delay_for(self.attempts))
    }

    pub fn disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    pub fn reset(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.attempts = 0;
    }
}

/// Messages that could not be sent, replayed after the next (re)connect
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Outbox {
    messages: VecDeque<SyncMessage>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: SyncMessage) {
        // presence is ephemeral and not worth replaying
        if matches!(
            message,
            SyncMessage::Presence { .. } | SyncMessage::Ping | SyncMessage::Pong
        ) {
            return;
        }
        self.messages.push_back(message);
    }

    pub fn drain(&mut self) -> Vec<SyncMessage> {
        self.messages.drain(..).collect()
    }

    /// Puts unsent messages back in front, keeping their order.
    pub fn restore(&mut self, unsent: Vec<SyncMessage>) {
        for message in unsent.into_iter().rev() {
            self.messages.push_front(message);
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Role;
    use timeline::Clip;

    fn user(id: &str) -> User {
        User::new(id.into(), id, Role::Editor)
    }

    #[tokio::test]
    async fn late_joiner_gets_backlog() {
        let hub = LocalHub::new();
        let project = ProjectId::from("p1");

        let alice = hub.transport();
        let mut alice_rx = alice.connect(&project, &user("alice")).await.unwrap();
        assert!(matches!(alice_rx.recv().await, Some(SyncMessage::Welcome { .. })));

        let op = Operation::insert_clip("alice".into(), "t1".into(), Clip::new("c1", "a1", 0.0, 5.0));
        alice
            .send(SyncMessage::Operation { operation: op.clone() })
            .await
            .unwrap();
        alice
            .send(SyncMessage::Operation { operation: op.clone() })
            .await
            .unwrap();

        let bob = hub.transport();
        let mut bob_rx = bob.connect(&project, &user("bob")).await.unwrap();
        match bob_rx.recv().await {
            Some(SyncMessage::Welcome { users, operations, .. }) => {
                assert_eq!(users.len(), 1);
                assert_eq!(operations, vec![op]);
            }
            other => panic!("expected welcome, got {:?}", other),
        }

        assert!(matches!(alice_rx.recv().await, Some(SyncMessage::Join { .. })));
        assert_eq!(hub.peer_count(&project), 2);

        bob.disconnect().await.unwrap();
        assert!(matches!(alice_rx.recv().await, Some(SyncMessage::Leave { .. })));
        assert_eq!(hub.peer_count(&project), 1);
    }

    #[tokio::test]
    async fn ping_is_answered_to_sender_only() {
        let hub = LocalHub::new();
        let project = ProjectId::from("p1");
        let alice = hub.transport();
        let mut rx = alice.connect(&project, &user("alice")).await.unwrap();
        rx.recv().await;

        alice.send(SyncMessage::Ping).await.unwrap();
        assert_eq!(rx.recv().await, Some(SyncMessage::Pong));
    }

    #[tokio::test]
    async fn send_before_connect_fails() {
        let hub = LocalHub::new();
        let err = hub.transport().send(SyncMessage::Ping).await.unwrap_err();
        assert!(matches!(err, CollaborationError::NetworkError(_)));
    }

    #[test]
    fn machine_gives_up_after_budget() {
        let mut machine = ConnectionMachine::new(ReconnectPolicy::default());
        let delays: Vec<Duration> = std::iter::from_fn(|| machine.next_attempt()).collect();

        assert_eq!(delays.len(), 5);
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[4], Duration::from_secs(16));
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert_eq!(machine.attempts(), 5);
    }

    #[test]
    fn connected_resets_attempts() {
        let mut machine = ConnectionMachine::new(ReconnectPolicy::default());
        machine.next_attempt();
        machine.next_attempt();
        assert_eq!(machine.connected(), 2);
        assert_eq!(machine.attempts(), 0);
        assert_eq!(machine.state(), ConnectionState::Connected);
    }

    #[test]
    fn outbox_skips_presence() {
        let mut outbox = Outbox::new();
        outbox.push(SyncMessage::Presence {
            user_id: "u1".into(),
            update: PresenceUpdate::PlayheadMoved { time: 1.0 },
        });
        outbox.push(SyncMessage::Error {
            message: "x".to_string(),
        });
        assert_eq!(outbox.len(), 1);

        let drained = outbox.drain();
        outbox.restore(drained);
        assert_eq!(outbox.len(), 1);
    }

    #[test]
    fn messages_use_type_tag() {
        let json = serde_json::to_value(SyncMessage::Ping).unwrap();
        assert_eq!(json["type"], "ping");
    }
}
