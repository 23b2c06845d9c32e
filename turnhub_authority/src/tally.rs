// Plurality vote counting.
//
// Abstentions are ignored. The choice with the most votes wins; a tie is
// settled by the configured `TieBreak`:
// - `SlotOrder`: the tied choice first voted for by the lowest slot wins, so
//   the result does not depend on arrival order.
// - `Random`: drawn from the session's seeded generator.
// - `NoDecision`: nobody wins the vote.

use serde::{Deserialize, Serialize};
use turnhub_prng::HubRng;

use crate::rules::SlotBallot;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    #[default]
    SlotOrder,
    Random,
    NoDecision,
}

#[derive(Clone, Debug)]
pub struct TieBreaker {
    policy: TieBreak,
    rng: HubRng,
}

impl TieBreaker {
    pub fn new(policy: TieBreak, rng: HubRng) -> Self {
        Self { policy, rng }
    }

    pub fn policy(&self) -> TieBreak {
        self.policy
    }

    /// Winning choice, or `None` if everyone abstained or a tie went
    /// undecided.
    pub fn plurality<'a, A: PartialEq>(&mut self, ballots: &'a [SlotBallot<A>]) -> Option<&'a A> {
        // (choice, votes, lowest voting slot)
        let mut counts: Vec<(&A, usize, u32)> = Vec::new();
        for ballot in ballots {
            let Some(choice) = &ballot.choice else {
                continue;
            };
            match counts.iter_mut().find(|(c, _, _)| *c == choice) {
                Some(entry) => {
                    entry.1 += 1;
                    entry.2 = entry.2.min(ballot.slot.0);
                }
                None => counts.push((choice, 1, ballot.slot.0)),
            }
        }

        let top = counts.iter().map(|(_, n, _)| *n).max()?;
        let mut leaders: Vec<(&A, u32)> = counts
            .into_iter()
            .filter(|(_, n, _)| *n == top)
            .map(|(c, _, first)| (c, first))
            .collect();
        if leaders.len() == 1 {
            return leaders.pop().map(|(c, _)| c);
        }

        leaders.sort_by_key(|(_, first)| *first);
        match self.policy {
            TieBreak::SlotOrder => leaders.first().map(|(c, _)| *c),
            TieBreak::Random => self.rng.choose(&leaders).map(|(c, _)| *c),
            TieBreak::NoDecision => None,
        }
    }
}
