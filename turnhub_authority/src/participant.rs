// The shared role contract and the loop that connects a role to the hub.
//
// Authority, player, and viewer are all `Participant`s: sans-IO state
// machines that react to `HubEvent`s and to the passage of time, and queue
// outgoing `GameMessage`s in an `Outbox`. `run_participant` is the only code
// that touches the network. Its loop:
//
//   connect (with backoff) → Welcome → loop {
//       wait for a hub message until the participant's next wakeup or the
//       next heartbeat → dispatch → on_tick → heartbeat → flush outbox
//   }
//
// A lost connection sends the loop back to connect under the same id; the
// hub treats that as a reconnect and flushes whatever it queued meanwhile.
// The loop ends when the participant reports itself finished, or when the
// caller's stop flag is cleared.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use turnhub_protocol::game::GameMessage;
use turnhub_protocol::message::{LeaveReason, ParticipantInfo, ServerMessage};
use turnhub_protocol::types::{ParticipantId, Role, SessionId};
use turnhub_relay::client::{Backoff, ClientError, HubClient};

use crate::config::SessionConfig;

/// Longest single wait in the run loop, so the stop flag is noticed promptly.
const MAX_WAIT: Duration = Duration::from_millis(100);

/// What the hub told a participant, with game payloads already decoded.
#[derive(Clone, Debug, PartialEq)]
pub enum HubEvent {
    /// (Re)connected. Carries the session roster at that moment.
    Welcome { participants: Vec<ParticipantInfo> },
    Joined(ParticipantInfo),
    Left {
        id: ParticipantId,
        reason: LeaveReason,
    },
    Message {
        from: ParticipantId,
        message: GameMessage,
    },
    /// A message to `to` could not be routed: `to` is not registered.
    SendFailed { to: ParticipantId },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Outgoing {
    pub to: ParticipantId,
    pub message: GameMessage,
}

/// Messages a participant wants sent, in order.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: VecDeque<Outgoing>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&mut self, to: &ParticipantId, message: GameMessage) {
        self.queue.push_back(Outgoing {
            to: to.clone(),
            message,
        });
    }

    pub fn pop(&mut self) -> Option<Outgoing> {
        self.queue.pop_front()
    }

    /// Put a message that could not be sent back at the front.
    pub fn unpop(&mut self, outgoing: Outgoing) {
        self.queue.push_front(outgoing);
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Outgoing> + '_ {
        self.queue.drain(..)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// The turn-participation contract shared by every role.
pub trait Participant {
    fn role(&self) -> Role;

    fn on_event(&mut self, event: HubEvent, now: Instant, out: &mut Outbox);

    /// Called after every wait, whether or not anything arrived.
    fn on_tick(&mut self, now: Instant, out: &mut Outbox);

    /// Earliest time `on_tick` has work to do, if any.
    fn next_wakeup(&self) -> Option<Instant>;

    fn is_finished(&self) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Client(#[from] ClientError),
}

#[derive(Clone, Debug)]
pub struct RunOptions {
    pub hub_addr: String,
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    pub heartbeat_interval: Duration,
    pub backoff: Backoff,
    /// Connection attempts per (re)connect before giving up. `None` retries
    /// forever.
    pub max_connect_attempts: Option<u32>,
    /// Cleared by the caller to stop the loop.
    pub running: Option<Arc<AtomicBool>>,
}

impl RunOptions {
    pub fn new(hub_addr: impl Into<String>, session_id: SessionId, participant_id: ParticipantId) -> Self {
        Self {
            hub_addr: hub_addr.into(),
            session_id,
            participant_id,
            heartbeat_interval: Duration::from_secs(1),
            backoff: Backoff::default(),
            max_connect_attempts: None,
            running: None,
        }
    }

    /// Options for joining the session `config` describes: its hub, its
    /// session scope, and its heartbeat interval.
    pub fn for_session(config: &SessionConfig, participant_id: ParticipantId) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            ..Self::new(
                config.hub_addr.clone(),
                config.session_id.clone(),
                participant_id,
            )
        }
    }

    fn stopped(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|flag| !flag.load(Ordering::SeqCst))
    }
}

/// Connect `participant` to the hub and drive it until it finishes.
pub fn run_participant<P: Participant>(
    participant: &mut P,
    options: &RunOptions,
) -> Result<(), RunError> {
    let mut backoff = options.backoff.clone();
    let mut out = Outbox::new();

    loop {
        let (mut client, welcome) = HubClient::connect_with_retry(
            &options.hub_addr,
            &options.session_id,
            &options.participant_id,
            participant.role(),
            &mut backoff,
            options.max_connect_attempts,
        )?;
        info!(
            session = %options.session_id,
            participant = %options.participant_id,
            role = %participant.role(),
            "joined hub"
        );
        participant.on_event(
            HubEvent::Welcome {
                participants: welcome.participants,
            },
            Instant::now(),
            &mut out,
        );

        let mut last_heartbeat = Instant::now();
        let lost = loop {
            if let Err(e) = flush(&mut client, &mut out) {
                break e;
            }
            if participant.is_finished() || options.stopped() {
                client.disconnect();
                return Ok(());
            }

            let now = Instant::now();
            let heartbeat_due = last_heartbeat + options.heartbeat_interval;
            let wake = participant
                .next_wakeup()
                .map_or(heartbeat_due, |w| w.min(heartbeat_due));
            let wait = wake.saturating_duration_since(now).min(MAX_WAIT);

            match client.recv_timeout(wait) {
                Ok(Some(msg)) => {
                    if let Some(event) = to_event(msg) {
                        participant.on_event(event, Instant::now(), &mut out);
                    }
                    // Handle everything already queued before ticking.
                    for msg in client.poll() {
                        if let Some(event) = to_event(msg) {
                            participant.on_event(event, Instant::now(), &mut out);
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => break e,
            }

            let now = Instant::now();
            participant.on_tick(now, &mut out);
            if now >= heartbeat_due {
                if let Err(e) = client.heartbeat() {
                    break e;
                }
                last_heartbeat = now;
            }
        };

        warn!(
            session = %options.session_id,
            participant = %options.participant_id,
            error = %lost,
            "lost hub connection, reconnecting"
        );
        if options.stopped() {
            return Ok(());
        }
    }
}

/// Send everything queued. A message that fails to send stays queued.
fn flush(client: &mut HubClient, out: &mut Outbox) -> Result<(), ClientError> {
    while let Some(outgoing) = out.pop() {
        let bytes = match outgoing.message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(to = %outgoing.to, error = %e, "dropping unencodable message");
                continue;
            }
        };
        if let Err(e) = client.send(&outgoing.to, &bytes) {
            out.unpop(outgoing);
            return Err(e);
        }
    }
    Ok(())
}

fn to_event(msg: ServerMessage) -> Option<HubEvent> {
    match msg {
        ServerMessage::Deliver { from, payload } => match GameMessage::decode(&payload) {
            Ok(message) => Some(HubEvent::Message { from, message }),
            Err(e) => {
                debug!(from = %from, error = %e, "ignoring undecodable payload");
                None
            }
        },
        ServerMessage::SendFailed { to, .. } => Some(HubEvent::SendFailed { to }),
        ServerMessage::ParticipantJoined { participant } => Some(HubEvent::Joined(participant)),
        ServerMessage::ParticipantLeft { id, reason } => Some(HubEvent::Left { id, reason }),
        ServerMessage::Welcome { .. }
        | ServerMessage::Rejected { .. }
        | ServerMessage::Resolved { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use turnhub_protocol::types::TurnSeq;

    use super::*;

    fn ack(n: u64) -> GameMessage {
        GameMessage::DeltaAck {
            session_id: SessionId::new("s"),
            turn_seq: TurnSeq(n),
        }
    }

    #[test]
    fn outbox_is_fifo_and_unpop_goes_first() {
        let board = ParticipantId::new("board_starter");
        let mut out = Outbox::new();
        out.send(&board, ack(0));
        out.send(&board, ack(1));

        let first = out.pop().unwrap();
        assert_eq!(first.message, ack(0));
        out.unpop(first);
        let order: Vec<_> = out.drain().map(|o| o.message).collect();
        assert_eq!(order, vec![ack(0), ack(1)]);
        assert!(out.is_empty());
    }

    #[test]
    fn deliveries_decode_into_game_messages() {
        let payload = ack(3).encode().unwrap();
        let event = to_event(ServerMessage::Deliver {
            from: ParticipantId::new("alice"),
            payload,
        });
        assert_eq!(
            event,
            Some(HubEvent::Message {
                from: ParticipantId::new("alice"),
                message: ack(3),
            })
        );
    }

    #[test]
    fn garbage_payloads_are_dropped() {
        let event = to_event(ServerMessage::Deliver {
            from: ParticipantId::new("alice"),
            payload: b"not json".to_vec(),
        });
        assert_eq!(event, None);
    }

    #[test]
    fn session_config_supplies_hub_scope_and_heartbeat() {
        let config = SessionConfig {
            hub_addr: "10.0.0.5:7000".into(),
            heartbeat_interval_ms: 250,
            ..SessionConfig::werewolf()
        };
        let options = RunOptions::for_session(&config, ParticipantId::new("seer"));
        assert_eq!(options.hub_addr, "10.0.0.5:7000");
        assert_eq!(options.session_id, SessionId::new("werewolf"));
        assert_eq!(options.participant_id, ParticipantId::new("seer"));
        assert_eq!(options.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(options.max_connect_attempts, None);
    }

    #[test]
    fn stop_flag_is_observed() {
        let flag = Arc::new(AtomicBool::new(true));
        let mut options = RunOptions::new("127.0.0.1:1", SessionId::new("s"), ParticipantId::new("p"));
        options.running = Some(Arc::clone(&flag));
        assert!(!options.stopped());
        flag.store(false, Ordering::SeqCst);
        assert!(options.stopped());
    }
}
