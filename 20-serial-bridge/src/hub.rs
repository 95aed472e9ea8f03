//! Connection hub.
//!
//! The hub task is the only owner of the live session set. Listener,
//! session loops and device threads talk to it exclusively through a
//! [`HubHandle`], so every admission, removal and fan-out is applied in a
//! single serialized loop without locks.

use std::{collections::HashMap, net::SocketAddr};

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    oneshot,
};
use tracing::{debug, info, warn};

pub type SessionId = u64;

/// Pending commands the hub accepts before senders start waiting.
const COMMAND_BUFFER: usize = 64;

/// Granted to a connection the hub agreed to serve.
///
/// `outbound` yields device chunks for this session and closes once the
/// hub unregisters it.
#[derive(Debug)]
pub struct Admission {
    pub id: SessionId,
    pub outbound: mpsc::Receiver<Bytes>,
}

/// Why the hub loop returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubExit {
    Shutdown,
    DeviceLost { reason: String },
    /// Every handle was dropped.
    Detached,
}

enum HubCommand {
    Admit {
        peer: SocketAddr,
        respond_to: oneshot::Sender<Option<Admission>>,
    },
    Unregister(SessionId),
    Broadcast(Bytes),
    #[cfg(test)]
    SessionCount {
        respond_to: oneshot::Sender<usize>,
    },
    DeviceLost {
        reason: String,
    },
    Shutdown,
}

struct SessionEntry {
    peer: SocketAddr,
    // Sole sender for the session queue: dropping the entry closes it.
    outbound: mpsc::Sender<Bytes>,
}

pub struct Hub {
    commands: mpsc::Receiver<HubCommand>,
    sessions: HashMap<SessionId, SessionEntry>,
    queue_capacity: usize,
    next_id: SessionId,
}

impl Hub {
    pub fn new(queue_capacity: usize) -> (Self, HubHandle) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let hub = Self {
            commands: commands_rx,
            sessions: HashMap::new(),
            queue_capacity,
            next_id: 1,
        };
        (
            hub,
            HubHandle {
                commands: commands_tx,
            },
        )
    }

    pub async fn run(mut self) -> HubExit {
        while let Some(command) = self.commands.recv().await {
            match command {
                HubCommand::Admit { peer, respond_to } => {
                    let admission = self.admit(peer);
                    if let Err(Some(orphaned)) = respond_to.send(admission) {
                        // The listener gave up waiting; nobody will drive this session.
                        self.unregister(orphaned.id);
                    }
                }
                HubCommand::Unregister(id) => self.unregister(id),
                HubCommand::Broadcast(chunk) => self.broadcast(&chunk),
                #[cfg(test)]
                HubCommand::SessionCount { respond_to } => {
                    let _ = respond_to.send(self.sessions.len());
                }
                HubCommand::DeviceLost { reason } => {
                    warn!(%reason, "serial device lost, closing all sessions");
                    self.close_all();
                    return HubExit::DeviceLost { reason };
                }
                HubCommand::Shutdown => {
                    info!("connection hub shutting down");
                    self.close_all();
                    return HubExit::Shutdown;
                }
            }
        }

        self.close_all();
        HubExit::Detached
    }

    fn admit(&mut self, peer: SocketAddr) -> Option<Admission> {
        if !self.sessions.is_empty() {
            info!(%peer, "rejecting connection, a session is already active");
            return None;
        }
        Some(self.register(peer))
    }

    fn register(&mut self, peer: SocketAddr) -> Admission {
        let id = self.next_id;
        self.next_id += 1;

        let (outbound_tx, outbound_rx) = mpsc::channel(self.queue_capacity);
        self.sessions.insert(
            id,
            SessionEntry {
                peer,
                outbound: outbound_tx,
            },
        );
        info!(session = id, %peer, "session registered");

        Admission {
            id,
            outbound: outbound_rx,
        }
    }

    fn unregister(&mut self, id: SessionId) {
        match self.sessions.remove(&id) {
            Some(entry) => info!(session = id, peer = %entry.peer, "session unregistered"),
            None => debug!(session = id, "session already unregistered"),
        }
    }

    fn broadcast(&mut self, chunk: &Bytes) {
        if self.sessions.is_empty() {
            debug!(bytes = chunk.len(), "no session to receive device data");
            return;
        }

        self.sessions
            .retain(|id, entry| match entry.outbound.try_send(chunk.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(session = *id, peer = %entry.peer, "outbound queue full, dropping session");
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(session = *id, "outbound queue already closed");
                    false
                }
            });
    }

    fn close_all(&mut self) {
        for (id, entry) in self.sessions.drain() {
            info!(session = id, peer = %entry.peer, "closing session");
        }
    }
}

/// Cloneable entry point into a running [`Hub`].
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    /// Asks the hub to admit `peer`. `None` means the connection must be closed.
    pub async fn admit(&self, peer: SocketAddr) -> Result<Option<Admission>> {
        let (respond_to, response) = oneshot::channel();
        self.send(HubCommand::Admit { peer, respond_to }).await?;
        response
            .await
            .context("connection hub dropped the admission request")
    }

    pub async fn unregister(&self, id: SessionId) -> Result<()> {
        self.send(HubCommand::Unregister(id)).await
    }

    pub async fn broadcast(&self, chunk: Bytes) -> Result<()> {
        self.send(HubCommand::Broadcast(chunk)).await
    }

    /// Variant of [`HubHandle::broadcast`] for the device reader thread.
    pub fn blocking_broadcast(&self, chunk: Bytes) -> Result<()> {
        self.commands
            .blocking_send(HubCommand::Broadcast(chunk))
            .map_err(|_| hub_stopped())
    }

    pub fn blocking_device_lost(&self, reason: String) -> Result<()> {
        self.commands
            .blocking_send(HubCommand::DeviceLost { reason })
            .map_err(|_| hub_stopped())
    }

    #[cfg(test)]
    pub async fn device_lost(&self, reason: String) -> Result<()> {
        self.send(HubCommand::DeviceLost { reason }).await
    }

    #[cfg(test)]
    pub async fn session_count(&self) -> Result<usize> {
        let (respond_to, response) = oneshot::channel();
        self.send(HubCommand::SessionCount { respond_to }).await?;
        response
            .await
            .context("connection hub dropped the session count request")
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(HubCommand::Shutdown).await
    }

    async fn send(&self, command: HubCommand) -> Result<()> {
        self.commands.send(command).await.map_err(|_| hub_stopped())
    }
}

fn hub_stopped() -> anyhow::Error {
    anyhow!("connection hub has stopped")
}
