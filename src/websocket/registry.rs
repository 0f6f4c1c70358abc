//! Connection Registry
//!
//! The authoritative set of live sessions, bucketed by role.
//!
//! Every mutation (register, unregister, role reassignment, handshake
//! expiry) is sent as a command to a single owner task, which is the only
//! writer of the bucket map. Reads (stats, broadcast snapshots) take the
//! shared side of the same lock, so they never observe a half-applied
//! mutation.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};

use super::messages::Frame;
use super::role::Role;
use super::session::{SendError, Session, SessionId};

/// Per-role session counts taken from one consistent snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub web: usize,
    pub video: usize,
    pub control: usize,
    pub telemetry: usize,
    pub pending: usize,
}

impl RegistryStats {
    pub fn count(&self, role: Role) -> usize {
        match role {
            Role::Web => self.web,
            Role::Video => self.video,
            Role::Control => self.control,
            Role::Telemetry => self.telemetry,
            Role::Pending => self.pending,
        }
    }
}

/// Errors returned by registry mutations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Session already assigned role {current}")]
    NotPending { current: Role },

    #[error("Session is not registered")]
    NotRegistered,

    #[error("Role {0} cannot be assigned")]
    InvalidRole(Role),

    #[error("Registry owner task has stopped")]
    Closed,
}

struct Member {
    role: Role,
    handshake_complete: bool,
    session: Arc<Session>,
}

#[derive(Default)]
struct Buckets {
    by_role: HashMap<Role, HashMap<SessionId, Arc<Session>>>,
    members: HashMap<SessionId, Member>,
}

impl Buckets {
    fn stats(&self) -> RegistryStats {
        let count = |role: Role| self.by_role.get(&role).map(|b| b.len()).unwrap_or(0);
        let stats = RegistryStats {
            total: self.members.len(),
            web: count(Role::Web),
            video: count(Role::Video),
            control: count(Role::Control),
            telemetry: count(Role::Telemetry),
            pending: count(Role::Pending),
        };
        debug_assert_eq!(
            stats.total,
            stats.web + stats.video + stats.control + stats.telemetry + stats.pending
        );
        stats
    }

    fn remove(&mut self, id: SessionId) -> Option<Member> {
        let member = self.members.remove(&id)?;
        if let Some(bucket) = self.by_role.get_mut(&member.role) {
            bucket.remove(&id);
        }
        Some(member)
    }
}

enum Command {
    Register {
        session: Arc<Session>,
        ack: oneshot::Sender<()>,
    },
    Unregister {
        session: Arc<Session>,
        ack: Option<oneshot::Sender<bool>>,
    },
    Reassign {
        id: SessionId,
        role: Role,
        ack: oneshot::Sender<Result<(), RegistryError>>,
    },
    ExpireHandshake {
        id: SessionId,
        ack: oneshot::Sender<bool>,
    },
    Sync {
        ack: oneshot::Sender<()>,
    },
}

/// Handle to the registry; cheap to clone
#[derive(Clone)]
pub struct ConnectionRegistry {
    buckets: Arc<RwLock<Buckets>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl ConnectionRegistry {
    /// Create a registry and spawn its owner task
    ///
    /// Must be called inside a tokio runtime. The owner task stops once
    /// every handle has been dropped.
    pub fn new() -> Self {
        let buckets = Arc::new(RwLock::new(Buckets::default()));
        let (commands, rx) = mpsc::unbounded_channel();

        tokio::spawn(run_owner(Arc::clone(&buckets), rx));

        Self { buckets, commands }
    }

    /// Add a new session to the pending bucket
    ///
    /// Each session must be registered at most once.
    pub async fn register(&self, session: Arc<Session>) -> Result<(), RegistryError> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::Register { session, ack })
            .map_err(|_| RegistryError::Closed)?;
        done.await.map_err(|_| RegistryError::Closed)
    }

    /// Remove a session from whichever bucket holds it and close its queue
    ///
    /// Returns true if the session was present. Calling this again for the
    /// same session is a no-op.
    pub async fn unregister(&self, session: &Arc<Session>) -> bool {
        let (ack, done) = oneshot::channel();
        let command = Command::Unregister {
            session: Arc::clone(session),
            ack: Some(ack),
        };
        if self.commands.send(command).is_err() {
            session.close();
            return false;
        }
        done.await.unwrap_or(false)
    }

    /// Queue an unregistration without waiting for it
    ///
    /// Used on the broadcast path, which must never suspend.
    pub fn schedule_unregister(&self, session: Arc<Session>) {
        let command = Command::Unregister {
            session: Arc::clone(&session),
            ack: None,
        };
        if self.commands.send(command).is_err() {
            session.close();
        }
    }

    /// Move a pending session to `role` and mark its handshake complete
    pub async fn reassign_role(&self, id: SessionId, role: Role) -> Result<(), RegistryError> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::Reassign { id, role, ack })
            .map_err(|_| RegistryError::Closed)?;
        done.await.map_err(|_| RegistryError::Closed)?
    }

    /// Unregister the session if its handshake has not completed yet
    ///
    /// Returns true if the session was torn down.
    pub async fn expire_handshake(&self, id: SessionId) -> bool {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::ExpireHandshake { id, ack }).is_err() {
            return false;
        }
        done.await.unwrap_or(false)
    }

    /// Wait until every mutation queued so far has been applied
    pub async fn sync(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Sync { ack }).is_ok() {
            let _ = done.await;
        }
    }

    /// Deliver `frame` to every session in `role` at the time of the call
    ///
    /// Returns the number of sessions the frame was queued for. Sessions
    /// whose queue is full are scheduled for unregistration.
    pub async fn broadcast(&self, role: Role, frame: Frame) -> usize {
        let recipients: Vec<Arc<Session>> = {
            let buckets = self.buckets.read().await;
            buckets
                .by_role
                .get(&role)
                .map(|bucket| bucket.values().cloned().collect())
                .unwrap_or_default()
        };

        self.deliver(recipients, frame)
    }

    /// Deliver `frame` to every session except `excluding`
    pub async fn broadcast_all(&self, frame: Frame, excluding: Option<SessionId>) -> usize {
        let recipients: Vec<Arc<Session>> = {
            let buckets = self.buckets.read().await;
            buckets
                .members
                .values()
                .filter(|m| Some(m.session.id()) != excluding)
                .map(|m| Arc::clone(&m.session))
                .collect()
        };

        self.deliver(recipients, frame)
    }

    fn deliver(&self, recipients: Vec<Arc<Session>>, frame: Frame) -> usize {
        let mut delivered = 0;
        for session in recipients {
            match session.send(Frame::clone(&frame)) {
                Ok(()) => delivered += 1,
                Err(SendError::QueueFull) => {
                    tracing::warn!(
                        session_id = session.id(),
                        user = %session.subject().name,
                        "Outbound queue full, disconnecting slow consumer"
                    );
                    self.schedule_unregister(session);
                }
                Err(e) => {
                    tracing::trace!(session_id = session.id(), error = %e, "Skipping recipient");
                }
            }
        }
        delivered
    }

    /// Per-role counts from one snapshot
    pub async fn stats(&self) -> RegistryStats {
        self.buckets.read().await.stats()
    }

    /// Number of sessions currently in `role`
    pub async fn count(&self, role: Role) -> usize {
        self.buckets
            .read()
            .await
            .by_role
            .get(&role)
            .map(|b| b.len())
            .unwrap_or(0)
    }

    /// Current role of a registered session
    pub async fn role_of(&self, id: SessionId) -> Option<Role> {
        self.buckets.read().await.members.get(&id).map(|m| m.role)
    }

    pub async fn is_handshake_complete(&self, id: SessionId) -> bool {
        self.buckets
            .read()
            .await
            .members
            .get(&id)
            .map(|m| m.handshake_complete)
            .unwrap_or(false)
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The single writer of the bucket map
async fn run_owner(buckets: Arc<RwLock<Buckets>>, mut commands: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = commands.recv().await {
        let mut state = buckets.write().await;

        match command {
            Command::Register { session, ack } => {
                let id = session.id();
                if state.members.contains_key(&id) {
                    tracing::warn!(session_id = id, "Session registered twice, ignoring");
                } else {
                    state
                        .by_role
                        .entry(Role::Pending)
                        .or_default()
                        .insert(id, Arc::clone(&session));
                    state.members.insert(
                        id,
                        Member {
                            role: Role::Pending,
                            handshake_complete: false,
                            session: Arc::clone(&session),
                        },
                    );
                    tracing::info!(
                        session_id = id,
                        user = %session.subject().name,
                        total = state.members.len(),
                        "Session registered"
                    );
                }
                let _ = ack.send(());
            }

            Command::Unregister { session, ack } => {
                let removed = state.remove(session.id());
                session.close();
                if let Some(member) = &removed {
                    tracing::info!(
                        session_id = session.id(),
                        user = %session.subject().name,
                        role = %member.role,
                        total = state.members.len(),
                        "Session unregistered"
                    );
                }
                if let Some(ack) = ack {
                    let _ = ack.send(removed.is_some());
                }
            }

            Command::Reassign { id, role, ack } => {
                let result = reassign(&mut state, id, role);
                if result.is_ok() {
                    tracing::info!(session_id = id, role = %role, "Session promoted");
                }
                let _ = ack.send(result);
            }

            Command::ExpireHandshake { id, ack } => {
                let expired = match state.members.get(&id) {
                    Some(member) if !member.handshake_complete => true,
                    _ => false,
                };
                if expired {
                    if let Some(member) = state.remove(id) {
                        member.session.close();
                        tracing::warn!(
                            session_id = id,
                            user = %member.session.subject().name,
                            "Handshake timed out, session closed"
                        );
                    }
                }
                let _ = ack.send(expired);
            }

            Command::Sync { ack } => {
                let _ = ack.send(());
            }
        }
    }

    tracing::debug!("Registry owner stopped");
}

fn reassign(state: &mut Buckets, id: SessionId, role: Role) -> Result<(), RegistryError> {
    if role == Role::Pending {
        return Err(RegistryError::InvalidRole(role));
    }

    let member = state.members.get_mut(&id).ok_or(RegistryError::NotRegistered)?;
    if member.role != Role::Pending {
        return Err(RegistryError::NotPending {
            current: member.role,
        });
    }

    let previous = member.role;
    member.role = role;
    member.handshake_complete = true;
    let session = Arc::clone(&member.session);

    if let Some(bucket) = state.by_role.get_mut(&previous) {
        bucket.remove(&id);
    }
    state.by_role.entry(role).or_default().insert(id, session);
    Ok(())
}
