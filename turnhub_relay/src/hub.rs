// Hub state: registry, live connections, and per-recipient mailboxes.
//
// `Hub` is the central data structure that `server.rs` drives. All mutation
// happens on the server's single event-loop thread, so there is no internal
// locking; concurrent sessions are serialized through that one loop and share
// nothing but this table.
//
// Key responsibilities:
// - Handshake: register (or reconnect) a participant, send `Welcome` with the
//   session roster, flush its mailbox, announce it to the rest of the session.
// - Relay: route `Send` payloads within the sender's session. A connected
//   recipient gets `Deliver` immediately; a registered but disconnected one
//   gets it queued; an unregistered one produces `SendFailed` back to the
//   sender. The payload is never inspected.
// - Liveness: every inbound message refreshes the sender's registration;
//   `sweep` removes registrations past the timeout and announces them as
//   `Unreachable`.
//
// Writing to client streams: each connection holds a cloned `TcpStream` write
// half in a `BufWriter`, with a write timeout so a client that stops reading
// cannot hold up the loop. A failed or timed-out write closes the socket and
// marks the connection dead; the payload goes to the mailbox so it is not
// lost, and the reader thread reports the disconnect shortly after.

use std::collections::BTreeMap;
use std::io::BufWriter;
use std::net::{Shutdown, TcpStream};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use turnhub_protocol::framing::write_message;
use turnhub_protocol::message::{LeaveReason, RejectReason, SendFailure, ServerMessage};
use turnhub_protocol::types::{ParticipantId, Role, SessionId};

use crate::mailbox::{Mailbox, QueuedMessage};
use crate::registry::{Registered, Registry, RegistryError};

/// Server-assigned id for one accepted TCP connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

type Key = (SessionId, ParticipantId);

struct Connection {
    key: Key,
    writer: BufWriter<TcpStream>,
}

pub struct Hub {
    registry: Registry,
    connections: BTreeMap<ConnectionId, Connection>,
    routes: BTreeMap<Key, ConnectionId>,
    mailboxes: BTreeMap<Key, Mailbox>,
    queue_capacity: usize,
    write_timeout: Option<Duration>,
}

impl Hub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            registry: Registry::new(),
            connections: BTreeMap::new(),
            routes: BTreeMap::new(),
            mailboxes: BTreeMap::new(),
            queue_capacity,
            write_timeout: None,
        }
    }

    /// Bound every write to a client stream by `timeout`.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Register the participant behind `conn` and attach its stream.
    ///
    /// On success the participant receives `Welcome` followed by any queued
    /// messages, and the rest of its session receives `ParticipantJoined`.
    pub fn connect(
        &mut self,
        conn: ConnectionId,
        session: SessionId,
        id: ParticipantId,
        role: Role,
        stream: TcpStream,
        now: Instant,
    ) -> Result<Registered, RejectReason> {
        let address = stream.peer_addr().ok();
        if let Err(err) = stream.set_write_timeout(self.write_timeout) {
            debug!(connection = conn.0, error = %err, "could not set write timeout");
        }
        let registered = self
            .registry
            .register(&session, &id, role, address, now)
            .map_err(|err| match err {
                RegistryError::AlreadyRegistered(id) | RegistryError::Unknown(id) => {
                    RejectReason::AlreadyRegistered { id }
                }
            })?;

        let key = (session.clone(), id.clone());
        let queued: Vec<QueuedMessage> = self
            .mailboxes
            .get_mut(&key)
            .map(|mb| mb.drain().collect())
            .unwrap_or_default();

        let participants = self
            .registry
            .participants(&session)
            .map(|(pid, reg)| reg.info(pid))
            .collect();
        let joined = self
            .registry
            .resolve(&session, &id)
            .map(|reg| reg.info(&id))
            .ok();

        if let Some(participant) = joined {
            self.broadcast_except(
                &session,
                &id,
                &ServerMessage::ParticipantJoined { participant },
            );
        }

        self.connections.insert(
            conn,
            Connection {
                key: key.clone(),
                writer: BufWriter::new(stream),
            },
        );
        self.routes.insert(key, conn);

        info!(
            session = %session,
            participant = %id,
            %role,
            reconnect = registered == Registered::Reconnected,
            queued = queued.len(),
            "participant connected"
        );

        let welcome = ServerMessage::Welcome {
            participant_id: id.clone(),
            session_id: session.clone(),
            participants,
            redelivered: u32::try_from(queued.len()).unwrap_or(u32::MAX),
        };
        self.write_to(conn, &welcome);
        for msg in queued {
            self.deliver(&session, &id, msg);
        }
        Ok(registered)
    }

    /// Relay a payload from the participant behind `conn` to `to`.
    pub fn send(&mut self, conn: ConnectionId, to: ParticipantId, payload: Vec<u8>, now: Instant) {
        let Some((session, from)) = self.touch(conn, now) else {
            return;
        };
        if self.registry.resolve(&session, &to).is_err() {
            debug!(session = %session, from = %from, to = %to, "send to unknown recipient");
            self.write_to(
                conn,
                &ServerMessage::SendFailed {
                    to,
                    reason: SendFailure::UnknownRecipient,
                },
            );
            return;
        }
        self.deliver(&session, &to, QueuedMessage { from, payload });
    }

    /// Answer a lookup from the participant behind `conn`.
    pub fn resolve(&mut self, conn: ConnectionId, id: ParticipantId, now: Instant) {
        let Some((session, _)) = self.touch(conn, now) else {
            return;
        };
        let participant = self
            .registry
            .resolve(&session, &id)
            .map(|reg| reg.info(&id))
            .ok();
        self.write_to(conn, &ServerMessage::Resolved { id, participant });
    }

    pub fn heartbeat(&mut self, conn: ConnectionId, now: Instant) {
        self.touch(conn, now);
    }

    /// The connection closed without `Goodbye`. The registration stays so the
    /// participant can reconnect until the liveness timeout removes it.
    pub fn disconnect(&mut self, conn: ConnectionId) {
        if let Some(connection) = self.connections.remove(&conn) {
            let (session, id) = &connection.key;
            if self.routes.get(&connection.key) == Some(&conn) {
                self.routes.remove(&connection.key);
                self.registry.mark_disconnected(session, id);
                info!(session = %session, participant = %id, "participant disconnected");
            }
        }
    }

    /// Explicit leave: drop the registration and tell the session.
    pub fn leave(&mut self, conn: ConnectionId) {
        let Some(connection) = self.connections.remove(&conn) else {
            return;
        };
        let (session, id) = connection.key;
        self.routes.remove(&(session.clone(), id.clone()));
        self.remove_participant(&session, &id, LeaveReason::Goodbye);
    }

    /// Remove every registration not heard from within `timeout`.
    /// Returns the removed participants.
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> Vec<(SessionId, ParticipantId)> {
        let expired = self.registry.expired(now, timeout);
        for (session, id) in &expired {
            warn!(session = %session, participant = %id, "participant unreachable");
            let key = (session.clone(), id.clone());
            if let Some(conn) = self.routes.remove(&key) {
                if let Some(connection) = self.connections.remove(&conn) {
                    connection.writer.get_ref().shutdown(Shutdown::Both).ok();
                }
            }
            self.remove_participant(session, id, LeaveReason::Unreachable);
        }
        expired
    }

    /// Close every connection. Used on hub shutdown so reader threads exit.
    pub fn shutdown(&mut self) {
        for connection in self.connections.values() {
            connection.writer.get_ref().shutdown(Shutdown::Both).ok();
        }
        self.connections.clear();
        self.routes.clear();
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn queued_for(&self, session: &SessionId, id: &ParticipantId) -> usize {
        self.mailboxes
            .get(&(session.clone(), id.clone()))
            .map_or(0, Mailbox::len)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn remove_participant(&mut self, session: &SessionId, id: &ParticipantId, reason: LeaveReason) {
        if self.registry.remove(session, id).is_none() {
            return;
        }
        if let Some(mb) = self.mailboxes.remove(&(session.clone(), id.clone())) {
            if !mb.is_empty() {
                debug!(session = %session, participant = %id, discarded = mb.len(), "mailbox discarded");
            }
        }
        info!(session = %session, participant = %id, ?reason, "participant left");
        self.broadcast_except(
            session,
            id,
            &ServerMessage::ParticipantLeft {
                id: id.clone(),
                reason,
            },
        );
    }

    /// Refresh liveness for the sender behind `conn` and return its key.
    fn touch(&mut self, conn: ConnectionId, now: Instant) -> Option<(SessionId, ParticipantId)> {
        let (session, id) = self.connections.get(&conn)?.key.clone();
        self.registry.heartbeat(&session, &id, now).ok()?;
        Some((session, id))
    }

    /// Write to the recipient's live connection, or queue it.
    fn deliver(&mut self, session: &SessionId, to: &ParticipantId, msg: QueuedMessage) {
        let key = (session.clone(), to.clone());
        if let Some(&conn) = self.routes.get(&key) {
            let frame = ServerMessage::Deliver {
                from: msg.from.clone(),
                payload: msg.payload.clone(),
            };
            if self.write_to(conn, &frame) {
                return;
            }
        }
        let capacity = self.queue_capacity;
        let mailbox = self
            .mailboxes
            .entry(key)
            .or_insert_with(|| Mailbox::new(capacity));
        if let Some(evicted) = mailbox.push(msg) {
            warn!(
                session = %session,
                recipient = %to,
                evicted_from = %evicted.from,
                dropped_total = mailbox.dropped(),
                "delivery queue full, dropped oldest message"
            );
        }
    }

    fn broadcast_except(&mut self, session: &SessionId, except: &ParticipantId, msg: &ServerMessage) {
        let targets: Vec<ConnectionId> = self
            .routes
            .iter()
            .filter(|((s, id), _)| s == session && id != except)
            .map(|(_, conn)| *conn)
            .collect();
        for conn in targets {
            self.write_to(conn, msg);
        }
    }

    /// Write one message. On failure the socket is closed, the connection is
    /// detached (the reader thread reports the disconnect), and `false` is
    /// returned.
    fn write_to(&mut self, conn: ConnectionId, msg: &ServerMessage) -> bool {
        let Some(connection) = self.connections.get_mut(&conn) else {
            return false;
        };
        match send_message(&mut connection.writer, msg) {
            Ok(()) => true,
            Err(err) => {
                debug!(connection = conn.0, error = %err, "write failed");
                // A timed-out write may have left half a frame on the wire.
                connection.writer.get_ref().shutdown(Shutdown::Both).ok();
                self.disconnect(conn);
                false
            }
        }
    }
}

/// Serialize a `ServerMessage` to JSON and write it with length-delimited
/// framing.
pub(crate) fn send_message(
    writer: &mut BufWriter<TcpStream>,
    msg: &ServerMessage,
) -> Result<(), Box<dyn std::error::Error>> {
    let json = serde_json::to_vec(msg)?;
    write_message(writer, &json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::BufReader;
    use std::net::TcpListener;

    use turnhub_protocol::framing::read_message;
    use turnhub_protocol::message::ParticipantInfo;

    use super::*;

    /// Create a TCP pair: (client_stream, server_stream) on localhost.
    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn recv(stream: &mut BufReader<TcpStream>) -> ServerMessage {
        let bytes = read_message(stream).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn session() -> SessionId {
        SessionId::new("chess-001")
    }

    fn pid(name: &str) -> ParticipantId {
        ParticipantId::new(name)
    }

    /// Connect `name` on a fresh TCP pair; returns the client-side reader.
    fn join(hub: &mut Hub, conn: u64, name: &str, role: Role) -> BufReader<TcpStream> {
        let (client, server) = tcp_pair();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        hub.connect(
            ConnectionId(conn),
            session(),
            pid(name),
            role,
            server,
            Instant::now(),
        )
        .unwrap();
        BufReader::new(client)
    }

    #[test]
    fn connect_sends_welcome_with_roster() {
        let mut hub = Hub::new(16);
        let mut board = join(&mut hub, 1, "board_starter", Role::Authority);
        match recv(&mut board) {
            ServerMessage::Welcome {
                participant_id,
                participants,
                redelivered,
                ..
            } => {
                assert_eq!(participant_id, pid("board_starter"));
                assert_eq!(participants.len(), 1);
                assert_eq!(participants[0].role, Role::Authority);
                assert_eq!(redelivered, 0);
            }
            other => panic!("expected Welcome, got {other:?}"),
        }
    }

    #[test]
    fn second_participant_is_announced() {
        let mut hub = Hub::new(16);
        let mut board = join(&mut hub, 1, "board_starter", Role::Authority);
        let _ = recv(&mut board);
        let mut alice = join(&mut hub, 2, "alice", Role::Player);

        match recv(&mut board) {
            ServerMessage::ParticipantJoined {
                participant: ParticipantInfo { id, role, .. },
            } => {
                assert_eq!(id, pid("alice"));
                assert_eq!(role, Role::Player);
            }
            other => panic!("expected ParticipantJoined, got {other:?}"),
        }
        match recv(&mut alice) {
            ServerMessage::Welcome { participants, .. } => assert_eq!(participants.len(), 2),
            other => panic!("expected Welcome, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_connected_id_is_rejected() {
        let mut hub = Hub::new(16);
        let _alice = join(&mut hub, 1, "alice", Role::Player);
        let (_client, server) = tcp_pair();
        let err = hub
            .connect(
                ConnectionId(2),
                session(),
                pid("alice"),
                Role::Player,
                server,
                Instant::now(),
            )
            .unwrap_err();
        assert_eq!(err, RejectReason::AlreadyRegistered { id: pid("alice") });
        assert_eq!(hub.connection_count(), 1);
    }

    #[test]
    fn send_relays_payload_untouched() {
        let mut hub = Hub::new(16);
        let mut board = join(&mut hub, 1, "board_starter", Role::Authority);
        let mut alice = join(&mut hub, 2, "alice", Role::Player);
        let _ = recv(&mut board); // Welcome
        let _ = recv(&mut board); // ParticipantJoined(alice)
        let _ = recv(&mut alice); // Welcome

        hub.send(ConnectionId(1), pid("alice"), vec![0xFF, 0x00, 0x7F], Instant::now());

        match recv(&mut alice) {
            ServerMessage::Deliver { from, payload } => {
                assert_eq!(from, pid("board_starter"));
                assert_eq!(payload, vec![0xFF, 0x00, 0x7F]);
            }
            other => panic!("expected Deliver, got {other:?}"),
        }
    }

    #[test]
    fn send_to_unknown_recipient_fails_back_to_sender() {
        let mut hub = Hub::new(16);
        let mut alice = join(&mut hub, 1, "alice", Role::Player);
        let _ = recv(&mut alice);

        hub.send(ConnectionId(1), pid("board_starter"), vec![1], Instant::now());

        match recv(&mut alice) {
            ServerMessage::SendFailed { to, reason } => {
                assert_eq!(to, pid("board_starter"));
                assert_eq!(reason, SendFailure::UnknownRecipient);
            }
            other => panic!("expected SendFailed, got {other:?}"),
        }
    }

    #[test]
    fn disconnected_recipient_gets_queue_on_reconnect_in_order() {
        let mut hub = Hub::new(16);
        let _board = join(&mut hub, 1, "board_starter", Role::Authority);
        let alice = join(&mut hub, 2, "alice", Role::Player);
        drop(alice);
        hub.disconnect(ConnectionId(2));

        for n in 0..3u8 {
            hub.send(ConnectionId(1), pid("alice"), vec![n], Instant::now());
        }
        assert_eq!(hub.queued_for(&session(), &pid("alice")), 3);

        let mut alice = join(&mut hub, 3, "alice", Role::Player);
        match recv(&mut alice) {
            ServerMessage::Welcome { redelivered, .. } => assert_eq!(redelivered, 3),
            other => panic!("expected Welcome, got {other:?}"),
        }
        for n in 0..3u8 {
            match recv(&mut alice) {
                ServerMessage::Deliver { payload, .. } => assert_eq!(payload, vec![n]),
                other => panic!("expected Deliver, got {other:?}"),
            }
        }
        assert_eq!(hub.queued_for(&session(), &pid("alice")), 0);
    }

    #[test]
    fn queue_overflow_keeps_newest() {
        let mut hub = Hub::new(2);
        let _board = join(&mut hub, 1, "board_starter", Role::Authority);
        let alice = join(&mut hub, 2, "alice", Role::Player);
        drop(alice);
        hub.disconnect(ConnectionId(2));

        for n in 0..5u8 {
            hub.send(ConnectionId(1), pid("alice"), vec![n], Instant::now());
        }
        assert_eq!(hub.queued_for(&session(), &pid("alice")), 2);

        let mut alice = join(&mut hub, 3, "alice", Role::Player);
        let _ = recv(&mut alice);
        let payloads: Vec<u8> = (0..2)
            .map(|_| match recv(&mut alice) {
                ServerMessage::Deliver { payload, .. } => payload[0],
                other => panic!("expected Deliver, got {other:?}"),
            })
            .collect();
        assert_eq!(payloads, vec![3, 4]);
    }

    #[test]
    fn goodbye_removes_registration_and_announces() {
        let mut hub = Hub::new(16);
        let mut board = join(&mut hub, 1, "board_starter", Role::Authority);
        let _alice = join(&mut hub, 2, "alice", Role::Player);
        let _ = recv(&mut board);
        let _ = recv(&mut board);

        hub.leave(ConnectionId(2));

        match recv(&mut board) {
            ServerMessage::ParticipantLeft { id, reason } => {
                assert_eq!(id, pid("alice"));
                assert_eq!(reason, LeaveReason::Goodbye);
            }
            other => panic!("expected ParticipantLeft, got {other:?}"),
        }
        assert!(hub.registry().resolve(&session(), &pid("alice")).is_err());
    }

    #[test]
    fn sweep_declares_silent_participants_unreachable() {
        let mut hub = Hub::new(16);
        let t0 = Instant::now();
        let mut board = join(&mut hub, 1, "board_starter", Role::Authority);
        let _alice = join(&mut hub, 2, "alice", Role::Player);
        let _ = recv(&mut board);
        let _ = recv(&mut board);

        // The board keeps talking; alice goes quiet.
        hub.heartbeat(ConnectionId(1), t0 + Duration::from_secs(20));
        let removed = hub.sweep(t0 + Duration::from_secs(20), Duration::from_secs(10));

        assert_eq!(removed, vec![(session(), pid("alice"))]);
        match recv(&mut board) {
            ServerMessage::ParticipantLeft { id, reason } => {
                assert_eq!(id, pid("alice"));
                assert_eq!(reason, LeaveReason::Unreachable);
            }
            other => panic!("expected ParticipantLeft, got {other:?}"),
        }
        assert_eq!(hub.connection_count(), 1);
    }

    #[test]
    fn stalled_reader_is_detached_without_blocking_the_hub() {
        let mut hub = Hub::new(16).with_write_timeout(Duration::from_millis(50));
        let mut board = join(&mut hub, 1, "board_starter", Role::Authority);
        let _ = recv(&mut board);
        // Alice never reads, so her socket buffers eventually fill.
        let _alice = join(&mut hub, 2, "alice", Role::Player);
        let _ = recv(&mut board);

        let payload = vec![7u8; 256 * 1024];
        let mut sends = 0;
        while hub.queued_for(&session(), &pid("alice")) == 0 {
            assert!(sends < 1024, "writes to alice never timed out");
            hub.send(ConnectionId(1), pid("alice"), payload.clone(), Instant::now());
            sends += 1;
        }
        assert_eq!(hub.connection_count(), 1);

        // Later messages queue instead of blocking, and the board is still served.
        hub.send(ConnectionId(1), pid("alice"), vec![1], Instant::now());
        assert_eq!(hub.queued_for(&session(), &pid("alice")), 2);
        hub.resolve(ConnectionId(1), pid("alice"), Instant::now());
        match recv(&mut board) {
            ServerMessage::Resolved { id, participant } => {
                assert_eq!(id, pid("alice"));
                assert!(participant.is_some_and(|p| !p.connected));
            }
            other => panic!("expected Resolved, got {other:?}"),
        }
    }

    #[test]
    fn sessions_do_not_see_each_other() {
        let mut hub = Hub::new(16);
        let mut alice = join(&mut hub, 1, "alice", Role::Player);
        let _ = recv(&mut alice);

        let (_client, server) = tcp_pair();
        hub.connect(
            ConnectionId(2),
            SessionId::new("werewolf-9"),
            pid("bob"),
            Role::Player,
            server,
            Instant::now(),
        )
        .unwrap();

        // Alice's session is unaware of bob; sending to him fails.
        hub.send(ConnectionId(1), pid("bob"), vec![1], Instant::now());
        match recv(&mut alice) {
            ServerMessage::SendFailed { to, .. } => assert_eq!(to, pid("bob")),
            other => panic!("expected SendFailed, got {other:?}"),
        }
    }
}
