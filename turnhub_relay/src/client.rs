// TCP client for connecting to the hub.
//
// Architecture:
// - `connect()` performs TCP connect + Hello handshake on the calling thread,
//   then spawns a background reader thread.
// - The reader thread calls `read_message()` in a loop, deserializes
//   `ServerMessage`, and pushes into an `mpsc` channel. When the connection
//   ends the channel closes, which `recv_timeout` reports as `Disconnected`.
// - The caller holds a `BufWriter<TcpStream>` for sending; each send flushes
//   synchronously.
//
// `connect_with_retry` wraps `connect` with exponential backoff for processes
// that start before the hub is up, or that are reconnecting after losing it.
// Only transport failures are retried; a `Rejected` handshake is final.

use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};
use turnhub_protocol::framing::{read_message, write_message};
use turnhub_protocol::message::{
    ClientMessage, PROTOCOL_VERSION, ParticipantInfo, RejectReason, ServerMessage,
};
use turnhub_protocol::types::{ParticipantId, Role, SessionId};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("hub I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed hub message: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("handshake rejected: {0}")]
    Rejected(RejectReason),
    #[error("unexpected handshake response: {0}")]
    UnexpectedResponse(String),
    #[error("connection to hub lost")]
    Disconnected,
}

/// Information returned by a successful handshake.
#[derive(Clone, Debug)]
pub struct Welcome {
    pub participant_id: ParticipantId,
    pub session_id: SessionId,
    pub participants: Vec<ParticipantInfo>,
    /// Queued messages delivered right after the handshake.
    pub redelivered: u32,
}

/// Exponential backoff schedule: `initial`, `initial * factor`, ... capped at
/// `max`.
#[derive(Clone, Debug)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub factor: u32,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, factor: u32) -> Self {
        Self {
            initial,
            max,
            factor: factor.max(1),
            current: initial,
        }
    }

    /// The next delay to wait. Advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        self.current = self.current.saturating_mul(self.factor).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(5), 2)
    }
}

/// TCP client for hub communication.
pub struct HubClient {
    writer: BufWriter<TcpStream>,
    inbox: Receiver<ServerMessage>,
    _reader_thread: Option<JoinHandle<()>>,
    participant_id: ParticipantId,
    session_id: SessionId,
}

impl HubClient {
    /// Connect to a hub, perform the Hello handshake, and spawn a reader
    /// thread. Returns the client and welcome info on success.
    pub fn connect(
        addr: impl ToSocketAddrs,
        session_id: &SessionId,
        participant_id: &ParticipantId,
        role: Role,
    ) -> Result<(Self, Welcome), ClientError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true).ok();
        stream.set_read_timeout(Some(Duration::from_secs(5))).ok();

        let reader_stream = stream.try_clone()?;
        let mut writer = BufWriter::new(stream);

        send_msg(
            &mut writer,
            &ClientMessage::Hello {
                protocol_version: PROTOCOL_VERSION,
                session_id: session_id.clone(),
                participant_id: participant_id.clone(),
                role,
            },
        )?;

        let mut reader = BufReader::new(reader_stream);
        let response: ServerMessage = serde_json::from_slice(&read_message(&mut reader)?)?;

        let welcome = match response {
            ServerMessage::Welcome {
                participant_id,
                session_id,
                participants,
                redelivered,
            } => Welcome {
                participant_id,
                session_id,
                participants,
                redelivered,
            },
            ServerMessage::Rejected { reason } => return Err(ClientError::Rejected(reason)),
            other => return Err(ClientError::UnexpectedResponse(format!("{other:?}"))),
        };

        // Clear read timeout for the long-lived reader loop.
        reader.get_ref().set_read_timeout(None).ok();

        let (tx, rx) = mpsc::channel();
        let reader_thread = thread::spawn(move || {
            reader_loop(reader, tx);
        });

        debug!(
            session = %welcome.session_id,
            participant = %welcome.participant_id,
            redelivered = welcome.redelivered,
            "connected to hub"
        );

        Ok((
            Self {
                writer,
                inbox: rx,
                _reader_thread: Some(reader_thread),
                participant_id: welcome.participant_id.clone(),
                session_id: welcome.session_id.clone(),
            },
            welcome,
        ))
    }

    /// `connect`, retrying transport failures with `backoff` up to
    /// `max_attempts` times (`None` retries forever).
    pub fn connect_with_retry(
        addr: &str,
        session_id: &SessionId,
        participant_id: &ParticipantId,
        role: Role,
        backoff: &mut Backoff,
        max_attempts: Option<u32>,
    ) -> Result<(Self, Welcome), ClientError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match Self::connect(addr, session_id, participant_id, role) {
                Ok(connected) => {
                    backoff.reset();
                    return Ok(connected);
                }
                Err(ClientError::Io(e)) if max_attempts.is_none_or(|max| attempt < max) => {
                    let delay = backoff.next_delay();
                    warn!(%addr, attempt, error = %e, ?delay, "hub unreachable, retrying");
                    thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Relay an opaque payload to another participant of the session.
    pub fn send(&mut self, to: &ParticipantId, payload: &[u8]) -> Result<(), ClientError> {
        send_msg(
            &mut self.writer,
            &ClientMessage::Send {
                to: to.clone(),
                payload: payload.to_vec(),
            },
        )
    }

    /// Ask the hub about a participant. The answer arrives as `Resolved`.
    pub fn resolve(&mut self, id: &ParticipantId) -> Result<(), ClientError> {
        send_msg(&mut self.writer, &ClientMessage::Resolve { id: id.clone() })
    }

    pub fn heartbeat(&mut self) -> Result<(), ClientError> {
        send_msg(&mut self.writer, &ClientMessage::Heartbeat)
    }

    /// Send Goodbye and close the connection.
    pub fn disconnect(&mut self) {
        let _ = send_msg(&mut self.writer, &ClientMessage::Goodbye);
        let _ = self.writer.get_ref().shutdown(Shutdown::Both);
    }

    /// Wait up to `timeout` for the next message. `Ok(None)` on timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<ServerMessage>, ClientError> {
        match self.inbox.recv_timeout(timeout) {
            Ok(msg) => Ok(Some(msg)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ClientError::Disconnected),
        }
    }

    /// Drain all queued server messages (non-blocking).
    pub fn poll(&self) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(msg) = self.inbox.try_recv() {
            messages.push(msg);
        }
        messages
    }
}

impl Drop for HubClient {
    // The reader thread holds a clone of the socket, so dropping the writer
    // alone would leave the connection open.
    fn drop(&mut self) {
        let _ = self.writer.get_ref().shutdown(Shutdown::Both);
    }
}

/// Serialize a `ClientMessage` to JSON and write with length-delimited framing.
fn send_msg(writer: &mut BufWriter<TcpStream>, msg: &ClientMessage) -> Result<(), ClientError> {
    let json = serde_json::to_vec(msg)?;
    write_message(writer, &json)?;
    Ok(())
}

/// Reader thread: read framed messages in a loop, push to channel.
fn reader_loop(mut reader: BufReader<TcpStream>, tx: mpsc::Sender<ServerMessage>) {
    while let Ok(bytes) = read_message(&mut reader) {
        match serde_json::from_slice::<ServerMessage>(&bytes) {
            Ok(msg) => {
                if tx.send(msg).is_err() {
                    break; // Receiver dropped
                }
            }
            Err(e) => {
                debug!(error = %e, "malformed message from hub");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500), 2);
        let delays: Vec<u64> = (0..5)
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn backoff_reset_starts_over() {
        let mut backoff = Backoff::default();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn connect_to_closed_port_is_io_error() {
        // Bind then drop to get a port nothing listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let err = HubClient::connect(
            ("127.0.0.1", port),
            &SessionId::new("s"),
            &ParticipantId::new("p"),
            Role::Player,
        )
        .err()
        .unwrap();
        assert!(matches!(err, ClientError::Io(_)), "{err}");
    }

    #[test]
    fn retry_gives_up_after_max_attempts() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let addr = format!("127.0.0.1:{port}");
        let mut backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(2), 2);
        let result = HubClient::connect_with_retry(
            &addr,
            &SessionId::new("s"),
            &ParticipantId::new("p"),
            Role::Player,
            &mut backoff,
            Some(3),
        );
        assert!(matches!(result, Err(ClientError::Io(_))));
    }
}
