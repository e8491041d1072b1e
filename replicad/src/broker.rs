//! The per-appliance rendezvous point.
//!
//! The broker owns both socket fabrics and every session table. All state is
//! mutated from [`Broker::run`]'s single loop; connection readers and writers
//! are tasks that only shuttle frames between sockets and that loop.
//!
//! Network side:
//!
//! - `sender-ready` from an address without a live receiver launches one,
//!   otherwise the sender gets `receiver-init-error`;
//! - anything else is relayed, untouched, to the receiver of that address.
//!
//! Local side:
//!
//! - `new-send` runs send admission and is answered with `SUCCESS`/`ERROR`;
//! - frames from a tracked receiver are acknowledged with `ACK` when the
//!   command calls for it, then relayed to the network connection of that address.

use remote::protocol::{Command, Message, RawFrame};
use tracing::instrument;

use crate::launcher::{Launcher, SessionHandle};
use crate::{ReceiveJob, SendJob, retention};

type ConnId = u64;

/// Connection events waiting for the loop; readers stall once it is full.
const EVENT_QUEUE_DEPTH: usize = 1024;
/// Frames a writer may lag behind beyond the credit window before its connection is dropped.
const WRITE_QUEUE_SLACK: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
enum Fabric {
    Network,
    Local,
}

#[derive(Debug)]
enum Event {
    Frame {
        fabric: Fabric,
        conn: ConnId,
        frame: RawFrame,
    },
    Closed {
        fabric: Fabric,
        conn: ConnId,
    },
}

/// Traffic relayed for one session address.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionCounters {
    /// frames from the remote sender
    pub frames_in: u64,
    pub bytes_in: u64,
    /// frames from the local receiver
    pub frames_out: u64,
    pub bytes_out: u64,
}

/// Why a `new-send` was refused.
#[derive(Debug, thiserror::Error)]
pub enum SendRefused {
    #[error("replica {0} is disabled")]
    Disabled(trail::ReplicaId),
    #[error("a sender for replica {0} is already running")]
    AlreadyRunning(trail::ReplicaId),
    #[error("replica {id} disabled after {failures} consecutive failed attempts")]
    RetriesExhausted {
        id: trail::ReplicaId,
        failures: usize,
    },
    #[error(transparent)]
    Store(#[from] trail::StoreError),
    #[error("failed to launch sender: {0}")]
    Launch(String),
}

#[derive(Debug)]
struct Connection {
    writer: tokio::sync::mpsc::Sender<RawFrame>,
    reader: Option<tokio::task::AbortHandle>,
    addresses: std::collections::HashSet<String>,
}

async fn read_frames<R>(
    fabric: Fabric,
    conn: ConnId,
    mut recv: remote::streams::RecvStream<R>,
    events: tokio::sync::mpsc::Sender<Event>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    loop {
        match recv.recv_raw().await {
            Ok(Some(frame)) => {
                if events.send(Event::Frame { fabric, conn, frame }).await.is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("{} connection {}: {:#}", fabric, conn, e);
                break;
            }
        }
    }
    let _ = events.send(Event::Closed { fabric, conn }).await;
}

async fn write_frames<W>(
    mut send: remote::streams::SendStream<W>,
    mut frames: tokio::sync::mpsc::Receiver<RawFrame>,
) where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        if let Err(e) = send.send_raw(&frame).await {
            tracing::debug!("write to {} failed: {:#}", frame.address(), e);
            return;
        }
    }
    let _ = send.close().await;
}

/// Session tables and the logic acting on them.
#[derive(Debug)]
struct State {
    settings: std::sync::Arc<common::EngineSettings>,
    store: std::sync::Arc<dyn trail::TrailStore>,
    launcher: std::sync::Arc<dyn Launcher>,
    parent: Option<common::ParentWatch>,
    receivers: std::collections::HashMap<String, Box<dyn SessionHandle>>,
    senders: std::collections::HashMap<trail::ReplicaId, Box<dyn SessionHandle>>,
    counters: std::collections::HashMap<String, SessionCounters>,
    network_conns: std::collections::HashMap<ConnId, Connection>,
    local_conns: std::collections::HashMap<ConnId, Connection>,
    network_routes: std::collections::HashMap<String, ConnId>,
    local_routes: std::collections::HashMap<String, ConnId>,
    next_conn: ConnId,
    idle_left: u32,
    last_prune: Option<std::time::Instant>,
}

impl State {
    fn new(
        settings: std::sync::Arc<common::EngineSettings>,
        store: std::sync::Arc<dyn trail::TrailStore>,
        launcher: std::sync::Arc<dyn Launcher>,
    ) -> Self {
        let idle_left = settings.event_loop.idle_iterations;
        Self {
            settings,
            store,
            launcher,
            parent: None,
            receivers: Default::default(),
            senders: Default::default(),
            counters: Default::default(),
            network_conns: Default::default(),
            local_conns: Default::default(),
            network_routes: Default::default(),
            local_routes: Default::default(),
            next_conn: 0,
            idle_left,
            last_prune: None,
        }
    }

    fn conns(&mut self, fabric: Fabric) -> &mut std::collections::HashMap<ConnId, Connection> {
        match fabric {
            Fabric::Network => &mut self.network_conns,
            Fabric::Local => &mut self.local_conns,
        }
    }

    fn routes(&mut self, fabric: Fabric) -> &mut std::collections::HashMap<String, ConnId> {
        match fabric {
            Fabric::Network => &mut self.network_routes,
            Fabric::Local => &mut self.local_routes,
        }
    }

    fn write_queue_depth(&self) -> usize {
        self.settings.credit_window + WRITE_QUEUE_SLACK
    }

    fn add_connection(&mut self, fabric: Fabric) -> (ConnId, tokio::sync::mpsc::Receiver<RawFrame>) {
        self.next_conn += 1;
        let conn = self.next_conn;
        let (writer, frames) = tokio::sync::mpsc::channel(self.write_queue_depth());
        self.conns(fabric).insert(
            conn,
            Connection {
                writer,
                reader: None,
                addresses: Default::default(),
            },
        );
        (conn, frames)
    }

    fn set_reader(&mut self, fabric: Fabric, conn: ConnId, reader: tokio::task::AbortHandle) {
        if let Some(connection) = self.conns(fabric).get_mut(&conn) {
            connection.reader = Some(reader);
        }
    }

    /// Queues `frame` for `conn`. Returns `false` when the writer fell too far
    /// behind, in which case the connection has been dropped.
    fn queue(&mut self, fabric: Fabric, conn: ConnId, frame: RawFrame) -> bool {
        let Some(connection) = self.conns(fabric).get(&conn) else {
            tracing::debug!("{} connection {} already gone", fabric, conn);
            return true;
        };
        match connection.writer.try_send(frame) {
            Ok(()) => true,
            Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("{} connection {} already gone", fabric, conn);
                true
            }
            Err(tokio::sync::mpsc::error::TrySendError::Full(frame)) => {
                tracing::warn!(
                    "{} connection {} is {} frames behind, dropping it ({} for {})",
                    fabric,
                    conn,
                    self.write_queue_depth(),
                    frame.command(),
                    frame.address()
                );
                self.on_closed(fabric, conn);
                false
            }
        }
    }

    /// Routes `address` on `fabric` through `conn` from now on.
    fn bind(&mut self, fabric: Fabric, conn: ConnId, address: &str) {
        if self.routes(fabric).get(address) == Some(&conn) || !self.conns(fabric).contains_key(&conn) {
            return;
        }
        tracing::debug!("{} connection {} bound to {}", fabric, conn, address);
        self.routes(fabric).insert(address.to_string(), conn);
        if let Some(connection) = self.conns(fabric).get_mut(&conn) {
            connection.addresses.insert(address.to_string());
        }
    }

    fn send_to(&mut self, fabric: Fabric, conn: ConnId, address: &str, message: &Message) {
        let frame = match RawFrame::new(address, message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("cannot reply to {}: {}", address, e);
                return;
            }
        };
        self.queue(fabric, conn, frame);
    }

    /// Forwards `frame` as is to whoever holds `address` on `fabric`.
    ///
    /// Returns `false` if the destination connection overflowed and was dropped.
    fn relay(&mut self, fabric: Fabric, frame: RawFrame) -> bool {
        let Some(&conn) = self.routes(fabric).get(frame.address()) else {
            tracing::debug!(
                "no {} route for {}, dropping {}",
                fabric,
                frame.address(),
                frame.command()
            );
            return true;
        };
        self.queue(fabric, conn, frame)
    }

    fn on_closed(&mut self, fabric: Fabric, conn: ConnId) {
        let Some(connection) = self.conns(fabric).remove(&conn) else {
            return;
        };
        tracing::debug!("{} connection {} closed", fabric, conn);
        if let Some(reader) = connection.reader {
            reader.abort();
        }
        for address in connection.addresses {
            if self.routes(fabric).get(&address) != Some(&conn) {
                // rebound to a newer connection
                continue;
            }
            self.routes(fabric).remove(&address);
            if fabric == Fabric::Network {
                // the sender is gone, hang up on its receiver so it fails its trail
                if let Some(local) = self.local_routes.remove(&address) {
                    tracing::info!("sender of {} disconnected, closing its receiver session", address);
                    if let Some(reader) = self.local_conns.remove(&local).and_then(|c| c.reader) {
                        reader.abort();
                    }
                }
            }
        }
    }

    async fn on_event(&mut self, event: Event) {
        match event {
            Event::Frame {
                fabric: Fabric::Network,
                conn,
                frame,
            } => self.on_network_frame(conn, frame),
            Event::Frame {
                fabric: Fabric::Local,
                conn,
                frame,
            } => self.on_local_frame(conn, frame).await,
            Event::Closed { fabric, conn } => self.on_closed(fabric, conn),
        }
    }

    fn on_network_frame(&mut self, conn: ConnId, frame: RawFrame) {
        let address = frame.address().to_string();
        let counters = self.counters.entry(address.clone()).or_default();
        counters.frames_in += 1;
        counters.bytes_in += frame.payload_len() as u64;
        if frame.command() == Command::SenderReady {
            // a refused greeting must not take over the live session's route
            self.start_receiver(conn, &address, &frame);
        } else {
            self.bind(Fabric::Network, conn, &address);
            if !self.relay(Fabric::Local, frame) {
                tracing::warn!("sender of {} ignores its credit, hanging up", address);
                self.on_closed(Fabric::Network, conn);
            }
        }
    }

    fn start_receiver(&mut self, conn: ConnId, address: &str, frame: &RawFrame) {
        if let Some(handle) = self.receivers.get_mut(address) {
            if !handle.is_finished() {
                tracing::warn!("duplicate greeting for {}", address);
                let text = format!("a receiver is already running for {address}");
                self.send_to(Fabric::Network, conn, address, &Message::ReceiverInitError(text));
                return;
            }
            self.receivers.remove(address);
        }
        let greeting = match frame.message() {
            Ok(Message::SenderReady(greeting)) => greeting,
            Ok(other) => {
                tracing::error!("sender-ready decoded as {}", other.command());
                return;
            }
            Err(e) => {
                let text = format!("malformed greeting: {e}");
                self.send_to(Fabric::Network, conn, address, &Message::ReceiverInitError(text));
                return;
            }
        };
        // a finished receiver may still hold the route
        if let Some(connection) = self
            .local_routes
            .remove(address)
            .and_then(|old| self.local_conns.get_mut(&old))
        {
            connection.addresses.remove(address);
        }
        self.bind(Fabric::Network, conn, address);
        let job = ReceiveJob {
            address: address.to_string(),
            greeting,
        };
        match self.launcher.launch_receiver(job) {
            Ok(handle) => {
                tracing::info!("launched receiver for {}", address);
                self.receivers.insert(address.to_string(), handle);
            }
            Err(e) => {
                tracing::error!("failed to launch receiver for {}: {:#}", address, e);
                let text = format!("{e:#}");
                self.send_to(Fabric::Network, conn, address, &Message::ReceiverInitError(text));
            }
        }
    }

    async fn on_local_frame(&mut self, conn: ConnId, frame: RawFrame) {
        let address = frame.address().to_string();
        let command = frame.command();
        if command == Command::NewSend {
            let reply = match frame.message() {
                Ok(Message::NewSend(id)) => match self.start_send(id).await {
                    Ok(text) => Message::Success(text),
                    Err(e) => {
                        tracing::warn!("new-send {} refused: {}", id, e);
                        Message::Error(e.to_string())
                    }
                },
                Ok(other) => Message::Error(format!("unexpected {}", other.command())),
                Err(e) => Message::Error(e.to_string()),
            };
            self.send_to(Fabric::Local, conn, &address, &reply);
            return;
        }
        if !self.receivers.contains_key(&address) {
            tracing::warn!("{} from unknown local session {}", command, address);
            return;
        }
        self.bind(Fabric::Local, conn, &address);
        if command.needs_ack() {
            self.send_to(Fabric::Local, conn, &address, &Message::Ack);
        }
        let counters = self.counters.entry(address).or_default();
        counters.frames_out += 1;
        counters.bytes_out += frame.payload_len() as u64;
        self.relay(Fabric::Network, frame);
    }

    /// Send admission for replica `id`, launching a sender when it passes.
    #[instrument(skip(self))]
    async fn start_send(&mut self, id: trail::ReplicaId) -> Result<String, SendRefused> {
        let replica = self.store.replica(id).await?;
        if !replica.enabled {
            return Err(SendRefused::Disabled(id));
        }
        if let Some(handle) = self.senders.get_mut(&id) {
            if !handle.is_finished() {
                return Err(SendRefused::AlreadyRunning(id));
            }
            self.senders.remove(&id);
        }
        let mut trails = self.store.replica_trails(id).await?;
        if let Some(newest) = trails
            .first_mut()
            .filter(|t| t.status == trail::TrailStatus::Pending)
        {
            tracing::warn!(
                "trail {} of replica {} was left pending, failing it",
                newest.id,
                id
            );
            let update = trail::TrailUpdate::Failed {
                kb: newest.kb_sent,
                error: "sender exited without finalizing the attempt".to_string(),
            };
            match self.store.update_replica_trail(newest.id, update).await {
                Ok(()) | Err(trail::StoreError::AlreadyFinal(_)) => {}
                Err(e) => return Err(e.into()),
            }
            newest.status = trail::TrailStatus::Failed;
            newest.end_ts = Some(chrono::Utc::now());
        }
        let failures = retention::consecutive_failures(&trails, replica.ts);
        if failures >= self.settings.retention.max_send_attempts {
            tracing::error!(
                "replica {} failed {} times in a row, disabling it",
                id,
                failures
            );
            self.store.disable_replica(id).await?;
            return Err(SendRefused::RetriesExhausted { id, failures });
        }
        let appliance = self.store.appliance(&replica.appliance).await?;
        let ip = replica.dest_ip.unwrap_or(appliance.ip);
        let destination = std::net::SocketAddr::new(ip, appliance.replication_port);
        let base = retention::newest_succeeded(&trails).cloned();
        let address = remote::protocol::sender_address(&self.settings.appliance_id, id);
        let job = SendJob {
            address: address.clone(),
            replica,
            destination,
            base,
        };
        let handle = self
            .launcher
            .launch_sender(job)
            .map_err(|e| SendRefused::Launch(format!("{e:#}")))?;
        self.senders.insert(id, handle);
        tracing::info!("started sender {} to {}", address, destination);
        Ok(format!("started sender {address} to {destination}"))
    }

    /// Drops handles of exited sessions and logs what is still running.
    fn prune_sessions(&mut self) {
        self.senders.retain(|id, handle| {
            let finished = handle.is_finished();
            if finished {
                tracing::debug!("sender for replica {} exited", id);
            }
            !finished
        });
        self.receivers.retain(|address, handle| {
            let finished = handle.is_finished();
            if finished {
                tracing::debug!("receiver for {} exited", address);
            }
            !finished
        });
        let receivers = &self.receivers;
        self.counters.retain(|address, counters| {
            let live = receivers.contains_key(address);
            if !live {
                tracing::info!("session {} done: {:?}", address, counters);
            }
            live
        });
        for (address, counters) in &self.counters {
            tracing::info!("session {} live: {:?}", address, counters);
        }
        tracing::debug!(
            "{} senders, {} receivers, {} network and {} local connections",
            self.senders.len(),
            self.receivers.len(),
            self.network_conns.len(),
            self.local_conns.len()
        );
    }

    /// Returns `false` once the broker should stop.
    async fn on_idle_tick(&mut self) -> bool {
        if self.parent.is_some_and(|parent| !parent.parent_alive()) {
            tracing::error!("parent process exited, shutting down");
            return false;
        }
        self.idle_left = self.idle_left.saturating_sub(1);
        if self.idle_left > 0 {
            return true;
        }
        self.idle_left = self.settings.event_loop.idle_iterations;
        self.prune_sessions();
        let interval = self.settings.retention.prune_interval;
        if self.last_prune.is_none_or(|at| at.elapsed() >= interval) {
            self.last_prune = Some(std::time::Instant::now());
            if let Err(e) = retention::prune_trails(
                self.store.as_ref(),
                self.settings.retention.trail_window,
                chrono::Utc::now(),
            )
            .await
            {
                tracing::warn!("trail pruning failed: {}", e);
            }
        }
        true
    }

    fn shutdown(&mut self) {
        for handle in self.senders.values_mut() {
            handle.abort();
        }
        for handle in self.receivers.values_mut() {
            handle.abort();
        }
        self.network_conns.clear();
        self.local_conns.clear();
    }
}

/// A bound broker, ready to [`run`](Broker::run).
#[derive(Debug)]
pub struct Broker {
    network: tokio::net::TcpListener,
    local: tokio::net::UnixListener,
    network_addr: std::net::SocketAddr,
    state: State,
}

impl Broker {
    /// Binds the network fabric on `listen` and the local fabric on the configured socket.
    pub async fn bind(
        settings: std::sync::Arc<common::EngineSettings>,
        listen: std::net::SocketAddr,
        store: std::sync::Arc<dyn trail::TrailStore>,
        launcher: std::sync::Arc<dyn Launcher>,
    ) -> anyhow::Result<Self> {
        settings
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid engine settings: {e}"))?;
        let network = remote::bind_network(listen).await?;
        let network_addr = network.local_addr()?;
        let local = remote::bind_local(&settings.local_socket)?;
        Ok(Self {
            network,
            local,
            network_addr,
            state: State::new(settings, store, launcher),
        })
    }

    /// Address the network fabric ended up on, useful when binding port 0.
    pub fn network_addr(&self) -> std::net::SocketAddr {
        self.network_addr
    }

    /// Stop when the process that started us exits.
    pub fn watch_parent(mut self, watch: common::ParentWatch) -> Self {
        self.state.parent = Some(watch);
        self
    }

    /// Serves both fabrics until `cancel` fires or the parent process exits.
    #[instrument(skip_all, fields(network = %self.network_addr))]
    pub async fn run(self, cancel: tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
        let Broker {
            network,
            local,
            mut state,
            ..
        } = self;
        let (events, mut incoming) = tokio::sync::mpsc::channel(EVENT_QUEUE_DEPTH);
        let mut io = tokio::task::JoinSet::new();
        let poll_interval = state.settings.event_loop.poll_interval;
        tracing::info!("broker for {} running", state.settings.appliance_id);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("broker cancelled");
                    break;
                }
                accepted = network.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let (send, recv) = match remote::network_streams(stream) {
                            Ok(streams) => streams,
                            Err(e) => {
                                tracing::warn!("failed to set up connection from {}: {:#}", peer, e);
                                continue;
                            }
                        };
                        let (conn, frames) = state.add_connection(Fabric::Network);
                        tracing::debug!("network connection {} from {}", conn, peer);
                        io.spawn(write_frames(send, frames));
                        let reader = io.spawn(read_frames(Fabric::Network, conn, recv, events.clone()));
                        state.set_reader(Fabric::Network, conn, reader);
                    }
                    Err(e) => tracing::warn!("network accept failed: {}", e),
                },
                accepted = local.accept() => match accepted {
                    Ok((stream, _)) => {
                        let (send, recv) = remote::local_streams(stream);
                        let (conn, frames) = state.add_connection(Fabric::Local);
                        tracing::debug!("local connection {}", conn);
                        io.spawn(write_frames(send, frames));
                        let reader = io.spawn(read_frames(Fabric::Local, conn, recv, events.clone()));
                        state.set_reader(Fabric::Local, conn, reader);
                    }
                    Err(e) => tracing::warn!("local accept failed: {}", e),
                },
                Some(event) = incoming.recv() => state.on_event(event).await,
                Some(_) = io.join_next(), if !io.is_empty() => {}
                _ = tokio::time::sleep(poll_interval) => {
                    if !state.on_idle_tick().await {
                        break;
                    }
                }
            }
        }
        state.shutdown();
        io.shutdown().await;
        Ok(())
    }
}
