//! UDP endpoint actor.
//!
//! One tokio task owns the socket and every peer's state. It multiplexes
//! three inputs with `select!`:
//!
//! - inbound datagrams (decoded, routed through the peer's reliable session)
//! - commands from [`TransportHandle`]s (connect, send, disconnect)
//! - a housekeeping tick (retransmits, acks, heartbeats, liveness)
//!
//! Peer removal goes through a single function, which is the only place a
//! `Disconnected` event is emitted. Dropping the peer drops its reliable
//! session, cancelling any pending retransmissions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::framing::{decode_datagram, ChannelMessage, Frame, MAX_DATAGRAM_SIZE};
use super::reliable::ReliableSession;
use super::{
    Command, DisconnectReason, Reliability, Remote, RemoteId, TransportConfig, TransportEvent,
    TransportHandle,
};

/// A bound UDP endpoint.
///
/// Servers bind with `accept_incoming = true` and learn about peers from
/// their first datagram. Apps bind with `accept_incoming = false` and reach
/// a server through [`TransportHandle::connect`].
///
/// Dropping the endpoint shuts it down.
#[derive(Debug)]
pub struct Endpoint {
    local_addr: SocketAddr,
    handle: TransportHandle,
    task: Option<JoinHandle<()>>,
}

impl Endpoint {
    /// Bind a socket and spawn the endpoint task.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        config: TransportConfig,
        accept_incoming: bool,
    ) -> Result<(Self, UnboundedReceiver<TransportEvent>)> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("Failed to bind UDP socket on {addr}"))?;
        let local_addr = socket.local_addr().context("Failed to read local address")?;

        log::info!("[Transport] Listening on {}", local_addr);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let actor = EndpointActor {
            socket,
            config,
            accept_incoming,
            peers: HashMap::new(),
            by_addr: HashMap::new(),
            event_tx,
        };
        let task = tokio::spawn(actor.run(command_rx));

        Ok((
            Self {
                local_addr,
                handle: TransportHandle::from_sender(command_tx),
                task: Some(task),
            },
            event_rx,
        ))
    }

    /// A handle for sending and connecting.
    pub fn handle(&self) -> TransportHandle {
        self.handle.clone()
    }

    /// The bound socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Disconnect every peer and wait for the endpoint task to finish.
    pub async fn shutdown(mut self) {
        self.handle.shutdown();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("[Transport] Endpoint task ended abnormally: {e}");
            }
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.handle.shutdown();
        }
    }
}

/// Per-peer state, owned by the actor.
#[derive(Debug)]
struct Peer {
    remote: Remote,
    session: ReliableSession,
    last_heard: Instant,
    last_sent: Instant,
}

#[derive(Debug)]
struct EndpointActor {
    socket: UdpSocket,
    config: TransportConfig,
    accept_incoming: bool,
    peers: HashMap<RemoteId, Peer>,
    by_addr: HashMap<SocketAddr, RemoteId>,
    event_tx: UnboundedSender<TransportEvent>,
}

impl EndpointActor {
    async fn run(mut self, mut command_rx: UnboundedReceiver<Command>) {
        // One spare byte so an oversized datagram is detectable.
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((len, addr)) => self.handle_datagram(addr, &buf[..len]),
                    Err(e) => log::debug!("[Transport] recv_from error: {e}"),
                },
                command = command_rx.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                _ = tick.tick() => self.on_tick(),
            }
        }

        self.shutdown_all();
        log::info!("[Transport] Endpoint stopped");
    }

    fn handle_datagram(&mut self, addr: SocketAddr, bytes: &[u8]) {
        if bytes.len() > MAX_DATAGRAM_SIZE {
            log::warn!("[Transport] Dropping oversized datagram from {addr}");
            return;
        }

        let frames = match decode_datagram(bytes) {
            Ok(frames) => frames,
            Err(e) => {
                log::warn!("[Transport] Dropping malformed datagram from {addr}: {e}");
                return;
            }
        };

        let id = match self.by_addr.get(&addr) {
            Some(id) => *id,
            None => {
                let opens_session = frames.iter().any(|f| !matches!(f, Frame::Disconnect));
                if !self.accept_incoming || !opens_session {
                    log::debug!("[Transport] Ignoring datagram from unknown peer {addr}");
                    return;
                }
                self.add_peer(addr).id
            }
        };

        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        peer.last_heard = Instant::now();

        let mut needs_ack = false;
        for frame in frames {
            match frame {
                Frame::Reliable { seq, message } => {
                    needs_ack = true;
                    for delivered in peer.session.receiver.receive(seq, message) {
                        emit(
                            &self.event_tx,
                            message_event(peer.remote, delivered, Reliability::ReliableOrdered),
                        );
                    }
                }
                Frame::Unreliable(message) => {
                    emit(
                        &self.event_tx,
                        message_event(peer.remote, message, Reliability::UnreliableUnordered),
                    );
                }
                Frame::Ack { ranges } => {
                    peer.session.sender.process_ack(&ranges);
                }
                Frame::Heartbeat => {}
                Frame::Disconnect => {
                    self.remove_peer(id, DisconnectReason::RemoteClosed);
                    return;
                }
            }
        }

        if needs_ack {
            let ack = peer.session.receiver.generate_ack();
            send_frames(&self.socket, peer.remote.addr, &[ack]);
            peer.last_sent = Instant::now();
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { addr, reply } => {
                let remote = match self.by_addr.get(&addr) {
                    Some(id) => self.peers[id].remote,
                    None => {
                        let remote = self.add_peer(addr);
                        // Announce ourselves; the server creates its peer on receipt.
                        send_frames(&self.socket, addr, &[Frame::Heartbeat]);
                        remote
                    }
                };
                if reply.send(remote).is_err() {
                    log::debug!("[Transport] Connect caller went away before reply");
                }
            }
            Command::Send {
                remote,
                channel,
                payload,
                reliability,
            } => {
                let Some(peer) = self.peers.get_mut(&remote) else {
                    log::debug!("[Transport] Dropping send to unknown remote {remote}");
                    return;
                };
                let message = ChannelMessage::new(channel, payload);
                let frame = match reliability {
                    Reliability::ReliableOrdered => peer.session.sender.prepare_send(message),
                    Reliability::UnreliableUnordered => Frame::Unreliable(message),
                };
                send_frames(&self.socket, peer.remote.addr, &[frame]);
                peer.last_sent = Instant::now();
            }
            Command::Disconnect { remote } => {
                if let Some(peer) = self.peers.get(&remote) {
                    send_frames(&self.socket, peer.remote.addr, &[Frame::Disconnect]);
                    self.remove_peer(remote, DisconnectReason::Local);
                }
            }
            Command::Shutdown => {}
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        let mut dead = Vec::new();

        for (id, peer) in &mut self.peers {
            if now.duration_since(peer.last_heard) >= self.config.liveness_timeout {
                dead.push((*id, DisconnectReason::LivenessTimeout));
                continue;
            }

            let mut frames = peer.session.sender.get_retransmits();
            if !peer.session.sender.take_failed().is_empty() {
                dead.push((*id, DisconnectReason::DeliveryFailed));
                continue;
            }

            if peer.session.receiver.should_send_ack_heartbeat() {
                frames.push(peer.session.receiver.generate_ack());
            }
            if frames.is_empty()
                && now.duration_since(peer.last_sent) >= self.config.heartbeat_interval
            {
                frames.push(Frame::Heartbeat);
            }

            if !frames.is_empty() {
                send_frames(&self.socket, peer.remote.addr, &frames);
                peer.last_sent = now;
            }
        }

        for (id, reason) in dead {
            if let Some(peer) = self.peers.get(&id) {
                send_frames(&self.socket, peer.remote.addr, &[Frame::Disconnect]);
            }
            self.remove_peer(id, reason);
        }
    }

    fn add_peer(&mut self, addr: SocketAddr) -> Remote {
        let remote = Remote {
            id: RemoteId::new(),
            addr,
        };
        let now = Instant::now();
        self.peers.insert(
            remote.id,
            Peer {
                remote,
                session: ReliableSession::new(self.config.reliability),
                last_heard: now,
                last_sent: now,
            },
        );
        self.by_addr.insert(addr, remote.id);

        log::info!("[Transport] Peer connected: {}", remote);
        emit(&self.event_tx, TransportEvent::Connected(remote));
        remote
    }

    /// Forget a peer. The only place `Disconnected` is emitted.
    fn remove_peer(&mut self, id: RemoteId, reason: DisconnectReason) {
        let Some(peer) = self.peers.remove(&id) else {
            return;
        };
        self.by_addr.remove(&peer.remote.addr);

        let pending = peer.session.sender.pending_count();
        if pending > 0 {
            log::debug!(
                "[Transport] Discarding {} unacked messages for {}",
                pending,
                peer.remote
            );
        }
        log::info!("[Transport] Peer disconnected: {} ({})", peer.remote, reason);
        emit(
            &self.event_tx,
            TransportEvent::Disconnected {
                remote: peer.remote,
                reason,
            },
        );
    }

    fn shutdown_all(&mut self) {
        let ids: Vec<RemoteId> = self.peers.keys().copied().collect();
        for id in ids {
            if let Some(peer) = self.peers.get(&id) {
                send_frames(&self.socket, peer.remote.addr, &[Frame::Disconnect]);
            }
            self.remove_peer(id, DisconnectReason::Shutdown);
        }
    }
}

fn message_event(remote: Remote, message: ChannelMessage, reliability: Reliability) -> TransportEvent {
    TransportEvent::Message {
        remote,
        channel: message.channel,
        payload: message.payload,
        reliability,
    }
}

fn emit(event_tx: &UnboundedSender<TransportEvent>, event: TransportEvent) {
    if event_tx.send(event).is_err() {
        log::trace!("[Transport] Event receiver dropped");
    }
}

/// Pack frames into as few datagrams as possible and send without waiting.
///
/// A full socket buffer drops the datagram; reliable frames are retransmitted.
fn send_frames(socket: &UdpSocket, addr: SocketAddr, frames: &[Frame]) {
    let mut datagram: Vec<u8> = Vec::new();
    for frame in frames {
        let encoded = frame.encode();
        if !datagram.is_empty() && datagram.len() + encoded.len() > MAX_DATAGRAM_SIZE {
            send_datagram(socket, addr, &datagram);
            datagram.clear();
        }
        datagram.extend_from_slice(&encoded);
    }
    if !datagram.is_empty() {
        send_datagram(socket, addr, &datagram);
    }
}

fn send_datagram(socket: &UdpSocket, addr: SocketAddr, datagram: &[u8]) {
    if let Err(e) = socket.try_send_to(datagram, addr) {
        log::debug!("[Transport] Send to {addr} failed: {e}");
    }
}
