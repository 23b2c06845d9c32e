// Participant registry: who is registered in which session, where they are
// reachable, and when they were last heard from.
//
// Registrations are keyed by `(SessionId, ParticipantId)`. A registration
// outlives its TCP connection: when a connection drops without `Goodbye`, the
// entry is only marked disconnected so that a restarted process can reclaim
// its id and receive whatever was queued meanwhile. Entries are removed on
// explicit leave or when `expired` reports them past the liveness timeout.
//
// Time is passed in by the caller (`Instant` for liveness, `SystemTime` for
// the public join timestamp) so tests can drive expiry without sleeping.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use turnhub_protocol::message::ParticipantInfo;
use turnhub_protocol::types::{ParticipantId, Role, SessionId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("{0} is already registered")]
    AlreadyRegistered(ParticipantId),
    #[error("{0} is not registered")]
    Unknown(ParticipantId),
}

/// One registered participant.
#[derive(Debug, Clone)]
pub struct Registration {
    pub role: Role,
    pub address: Option<SocketAddr>,
    pub joined_at: SystemTime,
    pub connected: bool,
    last_seen: Instant,
}

impl Registration {
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn info(&self, id: &ParticipantId) -> ParticipantInfo {
        ParticipantInfo {
            id: id.clone(),
            role: self.role,
            address: self.address.map(|a| a.to_string()),
            joined_at_ms: self
                .joined_at
                .duration_since(UNIX_EPOCH)
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
                .unwrap_or(0),
            connected: self.connected,
        }
    }
}

/// Result of a successful `register`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registered {
    New,
    /// A disconnected registration was reclaimed by the same id and role.
    Reconnected,
}

#[derive(Debug, Default)]
pub struct Registry {
    sessions: BTreeMap<SessionId, BTreeMap<ParticipantId, Registration>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` in `session`, or reclaim a disconnected registration.
    ///
    /// Fails with `AlreadyRegistered` if the id is currently connected, or if
    /// a disconnected registration exists under a different role.
    pub fn register(
        &mut self,
        session: &SessionId,
        id: &ParticipantId,
        role: Role,
        address: Option<SocketAddr>,
        now: Instant,
    ) -> Result<Registered, RegistryError> {
        let entries = self.sessions.entry(session.clone()).or_default();
        if let Some(existing) = entries.get_mut(id) {
            if existing.connected || existing.role != role {
                return Err(RegistryError::AlreadyRegistered(id.clone()));
            }
            existing.connected = true;
            existing.address = address;
            existing.last_seen = now;
            return Ok(Registered::Reconnected);
        }
        entries.insert(
            id.clone(),
            Registration {
                role,
                address,
                joined_at: SystemTime::now(),
                connected: true,
                last_seen: now,
            },
        );
        Ok(Registered::New)
    }

    pub fn resolve(
        &self,
        session: &SessionId,
        id: &ParticipantId,
    ) -> Result<&Registration, RegistryError> {
        self.sessions
            .get(session)
            .and_then(|entries| entries.get(id))
            .ok_or_else(|| RegistryError::Unknown(id.clone()))
    }

    /// Record that `id` was heard from at `now`.
    pub fn heartbeat(
        &mut self,
        session: &SessionId,
        id: &ParticipantId,
        now: Instant,
    ) -> Result<(), RegistryError> {
        let entry = self
            .sessions
            .get_mut(session)
            .and_then(|entries| entries.get_mut(id))
            .ok_or_else(|| RegistryError::Unknown(id.clone()))?;
        entry.last_seen = now;
        Ok(())
    }

    /// The connection dropped; keep the registration for reconnect.
    pub fn mark_disconnected(&mut self, session: &SessionId, id: &ParticipantId) {
        if let Some(entry) = self
            .sessions
            .get_mut(session)
            .and_then(|entries| entries.get_mut(id))
        {
            entry.connected = false;
            entry.address = None;
        }
    }

    pub fn remove(&mut self, session: &SessionId, id: &ParticipantId) -> Option<Registration> {
        let entries = self.sessions.get_mut(session)?;
        let removed = entries.remove(id);
        if entries.is_empty() {
            self.sessions.remove(session);
        }
        removed
    }

    /// Registrations not heard from within `timeout` of `now`.
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<(SessionId, ParticipantId)> {
        self.sessions
            .iter()
            .flat_map(|(session, entries)| {
                entries
                    .iter()
                    .filter(move |(_, reg)| now.saturating_duration_since(reg.last_seen) > timeout)
                    .map(move |(id, _)| (session.clone(), id.clone()))
            })
            .collect()
    }

    /// Registrations of one session, in id order.
    pub fn participants(
        &self,
        session: &SessionId,
    ) -> impl Iterator<Item = (&ParticipantId, &Registration)> {
        self.sessions.get(session).into_iter().flat_map(|e| e.iter())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (SessionId, ParticipantId) {
        (SessionId::new("game-1"), ParticipantId::new("alice"))
    }

    #[test]
    fn register_then_resolve() {
        let (session, alice) = ids();
        let mut reg = Registry::new();
        let now = Instant::now();
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();

        assert_eq!(
            reg.register(&session, &alice, Role::Player, Some(addr), now),
            Ok(Registered::New)
        );
        let entry = reg.resolve(&session, &alice).unwrap();
        assert_eq!(entry.address, Some(addr));
        assert!(entry.connected);
        assert_eq!(entry.info(&alice).address.as_deref(), Some("127.0.0.1:4000"));
    }

    #[test]
    fn duplicate_connected_id_conflicts() {
        let (session, alice) = ids();
        let mut reg = Registry::new();
        let now = Instant::now();
        reg.register(&session, &alice, Role::Player, None, now)
            .unwrap();
        assert_eq!(
            reg.register(&session, &alice, Role::Player, None, now),
            Err(RegistryError::AlreadyRegistered(alice.clone()))
        );
    }

    #[test]
    fn disconnected_id_can_reconnect_with_same_role() {
        let (session, alice) = ids();
        let mut reg = Registry::new();
        let now = Instant::now();
        reg.register(&session, &alice, Role::Player, None, now)
            .unwrap();
        reg.mark_disconnected(&session, &alice);

        assert_eq!(
            reg.register(&session, &alice, Role::Observer, None, now),
            Err(RegistryError::AlreadyRegistered(alice.clone()))
        );
        assert_eq!(
            reg.register(&session, &alice, Role::Player, None, now),
            Ok(Registered::Reconnected)
        );
    }

    #[test]
    fn sessions_are_independent_namespaces() {
        let alice = ParticipantId::new("alice");
        let mut reg = Registry::new();
        let now = Instant::now();
        reg.register(&SessionId::new("a"), &alice, Role::Player, None, now)
            .unwrap();
        reg.register(&SessionId::new("b"), &alice, Role::Player, None, now)
            .unwrap();
        assert_eq!(reg.session_count(), 2);
        assert!(
            reg.resolve(&SessionId::new("c"), &alice).is_err(),
            "lookup is scoped to the session"
        );
    }

    #[test]
    fn unknown_lookups_and_heartbeats_fail() {
        let (session, alice) = ids();
        let mut reg = Registry::new();
        assert_eq!(
            reg.resolve(&session, &alice).err(),
            Some(RegistryError::Unknown(alice.clone()))
        );
        assert_eq!(
            reg.heartbeat(&session, &alice, Instant::now()),
            Err(RegistryError::Unknown(alice))
        );
    }

    #[test]
    fn heartbeat_defers_expiry() {
        let (session, alice) = ids();
        let bob = ParticipantId::new("bob");
        let mut reg = Registry::new();
        let t0 = Instant::now();
        let timeout = Duration::from_secs(10);
        reg.register(&session, &alice, Role::Player, None, t0)
            .unwrap();
        reg.register(&session, &bob, Role::Player, None, t0)
            .unwrap();

        reg.heartbeat(&session, &alice, t0 + Duration::from_secs(8))
            .unwrap();

        let expired = reg.expired(t0 + Duration::from_secs(12), timeout);
        assert_eq!(expired, vec![(session.clone(), bob)]);
    }

    #[test]
    fn remove_drops_empty_sessions() {
        let (session, alice) = ids();
        let mut reg = Registry::new();
        reg.register(&session, &alice, Role::Player, None, Instant::now())
            .unwrap();
        assert!(reg.remove(&session, &alice).is_some());
        assert_eq!(reg.session_count(), 0);
        assert_eq!(reg.participants(&session).count(), 0);
    }
}
