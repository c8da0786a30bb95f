//! The broadcast coordinator: sole owner of the client registry.
//!
//! Connection tasks never touch the registry. They talk to the coordinator
//! through three bounded channels (join, leave, chat) and the coordinator
//! processes exactly one event at a time, so every fan-out observes the
//! registry as left by the previous event.
//!
//! The join channel is polled first, then chat, then leave. A connection emits
//! its own events in program order, so this guarantees its join is handled
//! before its messages and its leave after them.

use std::{
    collections::{hash_map::Entry, HashMap},
    net::SocketAddr,
};

use anyhow::{anyhow, Result};
use tokio::{
    select,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// Process-unique identifier of one accepted connection.
pub type ClientId = u64;

/// Sender name used for notices the server generates itself.
pub const SYSTEM_USERID: &str = "server";

/// One message to be fanned out: chat text or a system notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEvent {
    pub from: String,
    pub text: String,
    /// Connection that produced the event; `None` for server notices.
    pub source: Option<ClientId>,
}

impl ChatEvent {
    pub fn new(from: impl Into<String>, text: impl Into<String>, source: ClientId) -> Self {
        Self {
            from: from.into(),
            text: text.into(),
            source: Some(source),
        }
    }

    pub fn notice(text: impl Into<String>) -> Self {
        Self {
            from: SYSTEM_USERID.to_string(),
            text: text.into(),
            source: None,
        }
    }

    fn about(handle: &ClientHandle, text: impl Into<String>) -> Self {
        Self::new(handle.userid.clone(), text, handle.id)
    }
}

/// Registration record for a logged-in connection.
///
/// Dropping the handle closes its outbound queue, which ends the client's
/// output task once the queue is drained.
#[derive(Debug)]
pub struct ClientHandle {
    pub id: ClientId,
    pub userid: String,
    pub peer: SocketAddr,
    outbound: mpsc::Sender<ChatEvent>,
}

impl ClientHandle {
    /// Creates a handle and the receiving end of its bounded outbound queue.
    pub fn new(
        id: ClientId,
        userid: impl Into<String>,
        peer: SocketAddr,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<ChatEvent>) {
        let (outbound, inbox) = mpsc::channel(capacity);
        let handle = Self {
            id,
            userid: userid.into(),
            peer,
            outbound,
        };
        (handle, inbox)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Accepted,
    Rejected,
}

#[derive(Debug)]
pub struct JoinRequest {
    pub handle: ClientHandle,
    pub reply: oneshot::Sender<JoinOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveRequest {
    pub userid: String,
    pub id: ClientId,
}

/// Cloneable sending side of the coordinator's three event channels.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    join_tx: mpsc::Sender<JoinRequest>,
    leave_tx: mpsc::Sender<LeaveRequest>,
    chat_tx: mpsc::Sender<ChatEvent>,
}

impl CoordinatorHandle {
    /// Submits a join request and returns where its outcome will be delivered.
    ///
    /// Callers are not expected to wait on the outcome before continuing.
    pub async fn join(&self, handle: ClientHandle) -> Result<oneshot::Receiver<JoinOutcome>> {
        let (reply, outcome) = oneshot::channel();
        self.join_tx
            .send(JoinRequest { handle, reply })
            .await
            .map_err(|_| stopped())?;
        Ok(outcome)
    }

    pub async fn leave(&self, userid: impl Into<String>, id: ClientId) -> Result<()> {
        self.leave_tx
            .send(LeaveRequest {
                userid: userid.into(),
                id,
            })
            .await
            .map_err(|_| stopped())
    }

    pub async fn chat(&self, event: ChatEvent) -> Result<()> {
        self.chat_tx.send(event).await.map_err(|_| stopped())
    }
}

fn stopped() -> anyhow::Error {
    anyhow!("broadcast coordinator has stopped")
}

pub struct Coordinator {
    registry: HashMap<String, ClientHandle>,
    join_rx: mpsc::Receiver<JoinRequest>,
    leave_rx: mpsc::Receiver<LeaveRequest>,
    chat_rx: mpsc::Receiver<ChatEvent>,
}

/// Creates a coordinator and its handle; each event channel holds `capacity` events.
pub fn channel(capacity: usize) -> (CoordinatorHandle, Coordinator) {
    let (join_tx, join_rx) = mpsc::channel(capacity);
    let (leave_tx, leave_rx) = mpsc::channel(capacity);
    let (chat_tx, chat_rx) = mpsc::channel(capacity);

    let handle = CoordinatorHandle {
        join_tx,
        leave_tx,
        chat_tx,
    };
    let coordinator = Coordinator {
        registry: HashMap::new(),
        join_rx,
        leave_rx,
        chat_rx,
    };
    (handle, coordinator)
}

/// Spawns the coordinator loop on the current runtime.
pub fn spawn(capacity: usize) -> (CoordinatorHandle, JoinHandle<()>) {
    let (handle, coordinator) = channel(capacity);
    let task = tokio::spawn(coordinator.run());
    (handle, task)
}

impl Coordinator {
    /// Processes events until every [`CoordinatorHandle`] has been dropped.
    pub async fn run(mut self) {
        info!("broadcast coordinator running");

        loop {
            select! {
                biased;
                Some(request) = self.join_rx.recv() => self.on_join(request).await,
                Some(event) = self.chat_rx.recv() => self.on_chat(event).await,
                Some(request) = self.leave_rx.recv() => self.on_leave(request).await,
                else => break,
            }
        }

        info!(
            remaining = self.registry.len(),
            "broadcast coordinator stopped"
        );
    }

    async fn on_join(&mut self, request: JoinRequest) {
        let JoinRequest { handle, reply } = request;

        if self.registry.contains_key(&handle.userid) {
            let userid = handle.userid.clone();
            warn!(
                %userid,
                client_id = handle.id,
                peer = %handle.peer,
                "rejecting duplicate login"
            );
            // Release the rejected handle before anyone hears about it.
            drop(handle);
            let _ = reply.send(JoinOutcome::Rejected);
            self.fan_out(ChatEvent::notice(format!(
                "userid {userid} is already logged in"
            )))
            .await;
            return;
        }

        info!(
            userid = %handle.userid,
            client_id = handle.id,
            peer = %handle.peer,
            "client joined"
        );
        let notice = ChatEvent::about(&handle, format!("Entered chat ({})", handle.peer));
        self.registry.insert(handle.userid.clone(), handle);
        if reply.send(JoinOutcome::Accepted).is_err() {
            debug!(userid = %notice.from, "connection ended before join was acknowledged");
        }
        self.fan_out(notice).await;
    }

    async fn on_leave(&mut self, request: LeaveRequest) {
        let handle = match self.registry.entry(request.userid) {
            Entry::Occupied(entry) if entry.get().id == request.id => entry.remove(),
            Entry::Occupied(entry) => {
                debug!(
                    userid = %entry.key(),
                    client_id = request.id,
                    "ignoring leave from unregistered connection"
                );
                return;
            }
            Entry::Vacant(entry) => {
                debug!(
                    userid = %entry.key(),
                    client_id = request.id,
                    "ignoring leave for absent userid"
                );
                return;
            }
        };

        info!(userid = %handle.userid, client_id = handle.id, "client left");
        self.fan_out(ChatEvent::about(&handle, "Left chat")).await;
        // Dropping the last sender closes the queue and releases the output task.
        drop(handle);
    }

    async fn on_chat(&mut self, event: ChatEvent) {
        // Client chat only speaks for the connection that currently owns `from`.
        if let Some(source) = event.source {
            let owner = self.registry.get(&event.from).map(|handle| handle.id);
            if owner != Some(source) {
                debug!(
                    from = %event.from,
                    client_id = source,
                    "dropping chat from unregistered connection"
                );
                return;
            }
        }

        debug!(from = %event.from, recipients = self.registry.len(), "fanning out chat event");
        self.fan_out(event).await;
    }

    /// Enqueues `event` for every registered client, waiting on full queues.
    async fn fan_out(&self, event: ChatEvent) {
        for handle in self.registry.values() {
            if handle.outbound.send(event.clone()).await.is_err() {
                warn!(
                    userid = %handle.userid,
                    client_id = handle.id,
                    "output task is gone; dropping event"
                );
            }
        }
    }
}
