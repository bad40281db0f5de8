//! Partition actor: holds client sessions and fans out publishes.
//!
//! A partition owns a subset of the relay's connections. For each one it
//! keeps a session recording the rooms joined; for each room it keeps the
//! local subscriber set and the last payload published. The room set of every
//! session is also written to the connection's attachment, so a partition
//! re-activated over the same connections can rebuild its state.
//!
//! Delivery is self-healing: a subscriber that cannot be sent to is
//! unsubscribed and the publish carries on with everyone else.

use bytes::Bytes;
use roomcast_protocol::{codec, LoadReport, PartitionId, PublishRequest, RoomName};
use roomcast_transport::{close_code, Connection, ConnectionId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::coordinator::CoordinatorHandle;
use crate::error::{RelayError, StorageError};
use crate::room::{self, Room};

/// Partition configuration.
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    /// Drop rooms with no subscribers and no publish for this long.
    /// `None` keeps rooms forever.
    pub room_idle_ttl: Option<Duration>,
    /// How often idle rooms are swept when a TTL is set.
    pub sweep_interval: Duration,
    /// Commands buffered before senders wait.
    pub mailbox_capacity: usize,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            room_idle_ttl: None,
            sweep_interval: Duration::from_secs(60),
            mailbox_capacity: 1024,
        }
    }
}

/// The persisted part of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAttachment {
    /// Rooms the session has joined.
    pub rooms: BTreeSet<RoomName>,
}

struct Session {
    connection: Arc<dyn Connection>,
    rooms: BTreeSet<RoomName>,
}

/// Partition statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionStats {
    /// Open sessions.
    pub sessions: usize,
    /// Rooms known to the partition, including empty ones.
    pub rooms: usize,
    /// Subscriptions answered from the room cache.
    pub cache_hits: u64,
    /// Subscriptions to rooms with nothing cached.
    pub cache_misses: u64,
}

/// Partition state. Owned exclusively by its actor task once spawned.
pub struct Partition {
    id: PartitionId,
    sessions: HashMap<ConnectionId, Session>,
    rooms: HashMap<RoomName, Room>,
    coordinator: CoordinatorHandle,
    config: PartitionConfig,
    cache_hits: u64,
    cache_misses: u64,
}

impl Partition {
    /// Create an empty partition.
    #[must_use]
    pub fn new(id: PartitionId, coordinator: CoordinatorHandle, config: PartitionConfig) -> Self {
        Self {
            id,
            sessions: HashMap::new(),
            rooms: HashMap::new(),
            coordinator,
            config,
            cache_hits: 0,
            cache_misses: 0,
        }
    }

    /// Re-activate a partition over connections it was already serving.
    ///
    /// Each session's room set is read back from its connection's attachment.
    /// Closed connections are skipped; unreadable attachments start empty.
    #[must_use]
    pub fn restore(
        id: PartitionId,
        connections: impl IntoIterator<Item = Arc<dyn Connection>>,
        coordinator: CoordinatorHandle,
        config: PartitionConfig,
    ) -> Self {
        let mut partition = Self::new(id, coordinator, config);

        for connection in connections {
            if !connection.is_open() {
                continue;
            }

            let attachment = match connection.attachment() {
                Some(data) => codec::decode::<SessionAttachment>(&data).unwrap_or_else(|e| {
                    warn!(
                        partition = %partition.id,
                        connection = %connection.id(),
                        error = %e,
                        "Unreadable session attachment, starting empty"
                    );
                    SessionAttachment::default()
                }),
                None => SessionAttachment::default(),
            };

            let connection_id = connection.id().clone();
            for room in &attachment.rooms {
                partition
                    .rooms
                    .entry(room.clone())
                    .or_insert_with(|| Room::new(room.clone()))
                    .subscribe(connection_id.clone());
            }
            partition.sessions.insert(
                connection_id,
                Session {
                    connection,
                    rooms: attachment.rooms,
                },
            );
        }

        info!(
            partition = %partition.id,
            sessions = partition.sessions.len(),
            rooms = partition.rooms.len(),
            "Partition restored"
        );
        partition
    }

    /// Partition identifier.
    #[must_use]
    pub fn id(&self) -> &PartitionId {
        &self.id
    }

    /// Register a newly connected client.
    ///
    /// # Errors
    ///
    /// Returns an error if the session attachment cannot be written.
    pub async fn accept(&mut self, connection: Arc<dyn Connection>) -> Result<(), RelayError> {
        let rooms = BTreeSet::new();
        persist_attachment(connection.as_ref(), &rooms).await?;

        let connection_id = connection.id().clone();
        debug!(partition = %self.id, connection = %connection_id, "Session accepted");
        self.sessions
            .insert(connection_id, Session { connection, rooms });
        self.report();
        Ok(())
    }

    /// Handle a text message sent by a client.
    ///
    /// # Errors
    ///
    /// Returns `UntrackedSession` for unknown connections, which the caller
    /// must close. Returns `MalformedRequest` for undecodable events after
    /// closing the connection with 1003.
    pub async fn on_message(
        &mut self,
        connection_id: &ConnectionId,
        text: &str,
    ) -> Result<(), RelayError> {
        let Some(session) = self.sessions.get(connection_id) else {
            return Err(RelayError::UntrackedSession(connection_id.clone()));
        };

        let room = match codec::decode_event(text).and_then(|event| event.room()) {
            Ok(room) => room,
            Err(e) => {
                warn!(partition = %self.id, connection = %connection_id, error = %e, "Rejected client event");
                let connection = Arc::clone(&session.connection);
                if let Err(close_err) = connection
                    .close(close_code::UNSUPPORTED, "Unsupported event")
                    .await
                {
                    debug!(connection = %connection_id, error = %close_err, "Close failed");
                }
                self.unsubscribe(connection_id);
                return Err(e.into());
            }
        };

        self.subscribe(connection_id, room).await
    }

    /// Join a connection to a room, delivering the room's cached message.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection has no session or its attachment
    /// cannot be written. A failed cache delivery is not an error; the
    /// connection is unsubscribed instead.
    pub async fn subscribe(
        &mut self,
        connection_id: &ConnectionId,
        room: RoomName,
    ) -> Result<(), RelayError> {
        let session = self
            .sessions
            .get_mut(connection_id)
            .ok_or_else(|| RelayError::UntrackedSession(connection_id.clone()))?;

        if !session.rooms.contains(&room) {
            let mut rooms = session.rooms.clone();
            rooms.insert(room.clone());
            persist_attachment(session.connection.as_ref(), &rooms).await?;
            session.rooms = rooms;
        }
        let connection = Arc::clone(&session.connection);

        let entry = self
            .rooms
            .entry(room.clone())
            .or_insert_with(|| Room::new(room.clone()));
        entry.subscribe(connection_id.clone());

        match entry.last_message().cloned() {
            Some(cached) => {
                self.cache_hits += 1;
                trace!(partition = %self.id, room = %room, "Delivering cached message");
                if let Err(source) = connection.send(cached).await {
                    let e = RelayError::Delivery {
                        connection: connection_id.clone(),
                        source,
                    };
                    warn!(partition = %self.id, error = %e, "Cached delivery failed");
                    self.drop_subscriber(connection.as_ref()).await;
                }
            }
            None => {
                // Nothing to replay; no out-of-band fetch is attempted.
                self.cache_misses += 1;
                debug!(partition = %self.id, room = %room, "Cache miss on subscribe");
            }
        }
        Ok(())
    }

    /// Cache a payload for a room and deliver it to every local subscriber.
    ///
    /// Returns the number of successful deliveries.
    pub async fn publish(&mut self, room: RoomName, payload: Bytes) -> usize {
        let entry = self
            .rooms
            .entry(room.clone())
            .or_insert_with(|| Room::new(room.clone()));
        entry.cache(payload.clone(), room::now());

        let targets: Vec<Arc<dyn Connection>> = entry
            .subscribers()
            .filter_map(|id| self.sessions.get(id))
            .map(|session| Arc::clone(&session.connection))
            .collect();

        let mut delivered = 0;
        let mut failed = Vec::new();
        for connection in targets {
            match connection.send(payload.clone()).await {
                Ok(()) => delivered += 1,
                Err(source) => {
                    let e = RelayError::Delivery {
                        connection: connection.id().clone(),
                        source,
                    };
                    debug!(partition = %self.id, error = %e, "Publish delivery failed");
                    failed.push(connection);
                }
            }
        }

        for connection in &failed {
            self.drop_subscriber(connection.as_ref()).await;
        }

        trace!(
            partition = %self.id,
            room = %room,
            delivered,
            failed = failed.len(),
            "Published"
        );
        delivered
    }

    async fn drop_subscriber(&mut self, connection: &dyn Connection) {
        if let Err(e) = connection
            .close(close_code::INTERNAL, "Delivery failed")
            .await
        {
            debug!(connection = %connection.id(), error = %e, "Close failed");
        }
        self.unsubscribe(connection.id());
    }

    /// Remove a connection from every room and forget its session.
    ///
    /// Returns `true` if the connection had a session.
    pub fn unsubscribe(&mut self, connection_id: &ConnectionId) -> bool {
        let Some(session) = self.sessions.remove(connection_id) else {
            return false;
        };

        for room in &session.rooms {
            if let Some(entry) = self.rooms.get_mut(room) {
                entry.unsubscribe(connection_id);
            }
        }

        debug!(
            partition = %self.id,
            connection = %connection_id,
            rooms = session.rooms.len(),
            "Session closed"
        );
        self.report();
        true
    }

    /// Report the current session count to the coordinator.
    ///
    /// Does not wait for the coordinator to apply it.
    pub fn report(&self) {
        let report = LoadReport::new(self.id.clone(), self.sessions.len());
        if let Err(e) = self.coordinator.report_nowait(report) {
            warn!(partition = %self.id, error = %e, "Load report not sent");
        }
    }

    /// Drop idle rooms when a TTL is configured.
    ///
    /// Returns the number of rooms removed.
    pub fn sweep_idle_rooms(&mut self, now: Instant) -> usize {
        let Some(ttl) = self.config.room_idle_ttl else {
            return 0;
        };

        let before = self.rooms.len();
        self.rooms.retain(|_, room| !room.is_idle(now, ttl));
        let removed = before - self.rooms.len();
        if removed > 0 {
            debug!(partition = %self.id, removed, "Swept idle rooms");
        }
        removed
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> PartitionStats {
        PartitionStats {
            sessions: self.sessions.len(),
            rooms: self.rooms.len(),
            cache_hits: self.cache_hits,
            cache_misses: self.cache_misses,
        }
    }

    /// Rooms a connection has joined, if it has a session.
    #[must_use]
    pub fn session_rooms(&self, connection_id: &ConnectionId) -> Option<Vec<RoomName>> {
        self.sessions
            .get(connection_id)
            .map(|s| s.rooms.iter().cloned().collect())
    }

    /// Borrow a room.
    #[must_use]
    pub fn room(&self, name: &RoomName) -> Option<&Room> {
        self.rooms.get(name)
    }

    /// Run the partition as an actor.
    #[must_use]
    pub fn spawn(self) -> (PartitionHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.config.mailbox_capacity.max(1));
        let handle = PartitionHandle {
            id: self.id.clone(),
            tx,
        };
        (handle, tokio::spawn(self.run(rx)))
    }

    async fn run(mut self, mut rx: mpsc::Receiver<PartitionCommand>) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        let sweeping = self.config.room_idle_ttl.is_some();

        loop {
            tokio::select! {
                // A due sweep runs before queued commands.
                biased;

                _ = sweep.tick(), if sweeping => {
                    self.sweep_idle_rooms(room::now());
                }
                command = rx.recv() => {
                    let Some(command) = command else { break };
                    if !self.handle(command).await {
                        break;
                    }
                }
            }
        }

        info!(partition = %self.id, sessions = self.sessions.len(), "Partition stopped");
    }

    /// Process one command; `false` stops the actor.
    async fn handle(&mut self, command: PartitionCommand) -> bool {
        match command {
            PartitionCommand::Accept { connection, reply } => {
                let _ = reply.send(self.accept(connection).await);
            }
            PartitionCommand::Message {
                connection,
                text,
                reply,
            } => {
                let _ = reply.send(self.on_message(&connection, &text).await);
            }
            PartitionCommand::Close { connection } => {
                self.unsubscribe(&connection);
            }
            PartitionCommand::Publish { request, reply } => {
                let _ = reply.send(self.publish(request.room, request.payload).await);
            }
            PartitionCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            PartitionCommand::Shutdown => return false,
        }
        true
    }
}

async fn persist_attachment(
    connection: &dyn Connection,
    rooms: &BTreeSet<RoomName>,
) -> Result<(), RelayError> {
    let attachment = SessionAttachment {
        rooms: rooms.clone(),
    };
    let data = codec::encode(&attachment).map_err(StorageError::from)?;
    connection
        .set_attachment(data)
        .await
        .map_err(|source| StorageError::Attachment {
            connection: connection.id().clone(),
            source,
        })?;
    Ok(())
}

enum PartitionCommand {
    Accept {
        connection: Arc<dyn Connection>,
        reply: oneshot::Sender<Result<(), RelayError>>,
    },
    Message {
        connection: ConnectionId,
        text: String,
        reply: oneshot::Sender<Result<(), RelayError>>,
    },
    Close {
        connection: ConnectionId,
    },
    Publish {
        request: PublishRequest,
        reply: oneshot::Sender<usize>,
    },
    Stats {
        reply: oneshot::Sender<PartitionStats>,
    },
    Shutdown,
}

/// Cloneable handle to a partition actor.
#[derive(Clone)]
pub struct PartitionHandle {
    id: PartitionId,
    tx: mpsc::Sender<PartitionCommand>,
}

impl PartitionHandle {
    /// Partition identifier.
    #[must_use]
    pub fn id(&self) -> &PartitionId {
        &self.id
    }

    /// Check if the actor has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn unavailable(&self) -> RelayError {
        RelayError::ActorUnavailable(format!("partition {}", self.id))
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> PartitionCommand,
    ) -> Result<T, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| self.unavailable())?;
        rx.await.map_err(|_| self.unavailable())
    }

    /// Hand a new connection to the partition.
    ///
    /// # Errors
    ///
    /// Returns an error if the partition is down or the attachment write fails.
    pub async fn accept(&self, connection: Arc<dyn Connection>) -> Result<(), RelayError> {
        self.request(|reply| PartitionCommand::Accept { connection, reply })
            .await?
    }

    /// Forward a client message.
    ///
    /// # Errors
    ///
    /// Returns an error if the partition is down or rejects the message.
    pub async fn message(
        &self,
        connection: &ConnectionId,
        text: impl Into<String>,
    ) -> Result<(), RelayError> {
        self.request(|reply| PartitionCommand::Message {
            connection: connection.clone(),
            text: text.into(),
            reply,
        })
        .await?
    }

    /// Signal that a connection closed or errored.
    ///
    /// # Errors
    ///
    /// Returns an error if the partition is down.
    pub async fn close(&self, connection: &ConnectionId) -> Result<(), RelayError> {
        self.tx
            .send(PartitionCommand::Close {
                connection: connection.clone(),
            })
            .await
            .map_err(|_| self.unavailable())
    }

    /// Publish to the partition's local subscribers.
    ///
    /// # Errors
    ///
    /// Returns an error if the partition is down.
    pub async fn publish(&self, request: PublishRequest) -> Result<usize, RelayError> {
        self.request(|reply| PartitionCommand::Publish { request, reply })
            .await
    }

    /// Current statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the partition is down.
    pub async fn stats(&self) -> Result<PartitionStats, RelayError> {
        self.request(|reply| PartitionCommand::Stats { reply }).await
    }

    /// Stop the actor. Connections stay open and can be handed to a
    /// re-activated partition.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(PartitionCommand::Shutdown).await;
    }

    /// Wait until the actor has exited.
    pub async fn stopped(&self) {
        self.tx.closed().await;
    }
}
