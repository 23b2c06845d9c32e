// Session roster and lifecycle status.
//
// A session has a fixed, ordered list of named slots ("white", "black";
// "wolf", "wolf", "village", ...). Players claim slots by joining; the
// session can start once every slot is held. Holders may drop out and come
// back: a slot stays bound to its holder for the life of the session and is
// only flagged absent, so a restarted player rejoins into the same seat.
//
// Status only moves forward: Forming → InProgress → Terminated (Forming may
// also go straight to Terminated when formation is abandoned).

use std::collections::BTreeSet;
use std::fmt;

use turnhub_prng::HubRng;
use turnhub_protocol::types::{ParticipantId, SessionId, SlotId};

use crate::config::SlotAssignment;
use crate::rules::SlotInfo;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionStatus {
    Forming,
    InProgress,
    Terminated,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Forming => "forming",
            SessionStatus::InProgress => "in progress",
            SessionStatus::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    #[error("{0} is already registered")]
    AlreadyRegistered(ParticipantId),
    #[error("all slots are taken")]
    SessionFull,
    #[error("the game has already started")]
    AlreadyStarted,
    #[error("join addressed to session {0}")]
    WrongSession(SessionId),
    #[error("the game is over")]
    Terminated,
}

/// Result of a successful join.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Joined {
    New(SlotId),
    /// The id already held this slot.
    Rejoined(SlotId),
}

impl Joined {
    pub fn slot(self) -> SlotId {
        match self {
            Joined::New(slot) | Joined::Rejoined(slot) => slot,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Slot {
    pub name: String,
    pub holder: Option<ParticipantId>,
    /// False while the holder is known to be gone.
    pub present: bool,
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    status: SessionStatus,
    slots: Vec<Slot>,
    observers: BTreeSet<ParticipantId>,
    assignment: SlotAssignment,
    rng: HubRng,
}

impl Session {
    pub fn new(
        id: SessionId,
        slot_names: &[String],
        assignment: SlotAssignment,
        rng: HubRng,
    ) -> Self {
        Self {
            id,
            status: SessionStatus::Forming,
            slots: slot_names
                .iter()
                .map(|name| Slot {
                    name: name.clone(),
                    holder: None,
                    present: false,
                })
                .collect(),
            observers: BTreeSet::new(),
            assignment,
            rng,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Move the status forward. Returns false (and changes nothing) for a
    /// backward or same-state move.
    pub fn advance(&mut self, to: SessionStatus) -> bool {
        if to <= self.status {
            return false;
        }
        self.status = to;
        true
    }

    /// Claim a slot for `id`, or reclaim the one it already holds.
    pub fn join(&mut self, id: &ParticipantId) -> Result<Joined, JoinError> {
        if let Some(slot) = self.slot_of(id) {
            if self.status == SessionStatus::Terminated {
                return Err(JoinError::Terminated);
            }
            return Ok(Joined::Rejoined(slot));
        }
        let lowered = id.as_str().to_lowercase();
        let clash = self
            .slots
            .iter()
            .filter_map(|s| s.holder.as_ref())
            .chain(self.observers.iter())
            .any(|h| h.as_str().to_lowercase() == lowered);
        if clash {
            return Err(JoinError::AlreadyRegistered(id.clone()));
        }
        match self.status {
            SessionStatus::Forming => {}
            SessionStatus::InProgress => return Err(JoinError::AlreadyStarted),
            SessionStatus::Terminated => return Err(JoinError::Terminated),
        }

        let free: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.holder.is_none())
            .map(|(i, _)| i)
            .collect();
        let index = match self.assignment {
            SlotAssignment::InOrder => free.first().copied(),
            SlotAssignment::Random => self.rng.choose(&free).copied(),
        }
        .ok_or(JoinError::SessionFull)?;

        let slot = &mut self.slots[index];
        slot.holder = Some(id.clone());
        slot.present = true;
        Ok(Joined::New(slot_id(index)))
    }

    /// Free a slot during formation, when its holder leaves before the game
    /// starts.
    pub fn release(&mut self, id: &ParticipantId) -> Option<SlotId> {
        let slot = self.slot_of(id)?;
        if self.status != SessionStatus::Forming {
            return None;
        }
        let entry = &mut self.slots[slot.index()];
        entry.holder = None;
        entry.present = false;
        Some(slot)
    }

    pub fn mark_absent(&mut self, id: &ParticipantId) -> Option<SlotId> {
        let slot = self.slot_of(id)?;
        self.slots[slot.index()].present = false;
        Some(slot)
    }

    pub fn mark_present(&mut self, id: &ParticipantId) -> Option<SlotId> {
        let slot = self.slot_of(id)?;
        self.slots[slot.index()].present = true;
        Some(slot)
    }

    pub fn is_full(&self) -> bool {
        self.slots.iter().all(|s| s.holder.is_some())
    }

    pub fn filled(&self) -> usize {
        self.slots.iter().filter(|s| s.holder.is_some()).count()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, slot: SlotId) -> Option<&Slot> {
        self.slots.get(slot.index())
    }

    pub fn slot_of(&self, id: &ParticipantId) -> Option<SlotId> {
        self.slots
            .iter()
            .position(|s| s.holder.as_ref() == Some(id))
            .map(slot_id)
    }

    pub fn holder(&self, slot: SlotId) -> Option<&ParticipantId> {
        self.slot(slot).and_then(|s| s.holder.as_ref())
    }

    pub fn is_present(&self, slot: SlotId) -> bool {
        self.slot(slot).is_some_and(|s| s.present)
    }

    /// Seated slots, for the rule-checker.
    pub fn slot_infos(&self) -> Vec<SlotInfo> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                s.holder.as_ref().map(|holder| SlotInfo {
                    id: slot_id(i),
                    name: s.name.clone(),
                    holder: holder.clone(),
                })
            })
            .collect()
    }

    /// Register a read-only subscriber. Slot holders are never observers.
    pub fn add_observer(&mut self, id: &ParticipantId) -> bool {
        if self.slot_of(id).is_some() {
            return false;
        }
        self.observers.insert(id.clone())
    }

    pub fn remove_observer(&mut self, id: &ParticipantId) -> bool {
        self.observers.remove(id)
    }

    pub fn is_observer(&self, id: &ParticipantId) -> bool {
        self.observers.contains(id)
    }

    /// Everyone who receives state deltas: slot holders in slot order, then
    /// observers.
    pub fn audience(&self) -> Vec<ParticipantId> {
        self.slots
            .iter()
            .filter_map(|s| s.holder.clone())
            .chain(self.observers.iter().cloned())
            .collect()
    }
}

fn slot_id(index: usize) -> SlotId {
    SlotId(u32::try_from(index).unwrap_or(u32::MAX))
}
