// End-to-end tests for the whole turn pipeline.
//
// Each test starts a real hub and runs an authority, players, and sometimes
// a viewer on their own threads, all talking over TCP through
// `run_participant`:
// authority ⇄ hub ⇄ players / viewer → join → turn requests → actions →
// commit → deltas → acks → terminal outcome.
//
// Games come from `turnhub_tests` (Countdown, Elimination); the deciders are
// the stock `FirstLegal` plus a `Silent` one that never answers.

use std::thread;
use std::time::Duration;

use turnhub_authority::{FirstLegal, PlayerExit, SessionConfig};
use turnhub_protocol::game::{AppliedAction, ForfeitCause, Outcome};
use turnhub_tests::{
    Countdown, Elimination, Silent, holder_of, pid, session_config, spawn_authority, spawn_player,
    spawn_viewer, start_test_hub,
};

fn winners(exit: Option<&PlayerExit>) -> Vec<String> {
    match exit {
        Some(PlayerExit::Finished(Some(Outcome::Win { winners, .. }))) => {
            winners.iter().map(|w| w.as_str().to_owned()).collect()
        }
        other => panic!("expected a win, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Test scenarios
// ---------------------------------------------------------------------------

/// Two players play Countdown to the end; every process sees the same
/// gap-free history and the same outcome.
#[test]
fn countdown_game_runs_to_completion() {
    let (hub, addr) = start_test_hub();
    let authority = spawn_authority(addr, session_config("countdown", 2), Countdown { tokens: 10 });
    thread::sleep(Duration::from_millis(200));
    let (viewer, seen) = spawn_viewer(addr, "countdown");
    thread::sleep(Duration::from_millis(200));

    let alice = spawn_player(addr, "countdown", "alice", FirstLegal);
    let bob = spawn_player(addr, "countdown", "bob", FirstLegal);

    let authority = authority.join().unwrap();
    let players = vec![alice.join().unwrap(), bob.join().unwrap()];
    let viewer = viewer.join().unwrap();

    // Ten single-token turns: slot 1 takes the last one.
    let history = authority.history();
    let seqs: Vec<u64> = history.deltas().iter().map(|d| d.turn_seq.0).collect();
    assert_eq!(seqs, (0..10).collect::<Vec<_>>());
    assert!(history.is_terminal());

    let winner = holder_of(&players, 1);
    for player in &players {
        assert_eq!(winners(player.exit()), vec![winner.as_str().to_owned()]);
        assert_eq!(player.history().len(), 10);
    }

    assert_eq!(seen.lock().unwrap().as_slice(), history.deltas());
    assert_eq!(viewer.history().map(|h| h.len()), Some(10));

    hub.stop();
}

/// Players may come up before the authority; their joins are retried until
/// it registers.
#[test]
fn players_may_start_before_the_authority() {
    let (hub, addr) = start_test_hub();
    let alice = spawn_player(addr, "early", "alice", FirstLegal);
    let bob = spawn_player(addr, "early", "bob", FirstLegal);
    thread::sleep(Duration::from_millis(300));

    let authority = spawn_authority(addr, session_config("early", 2), Countdown { tokens: 4 });

    let authority = authority.join().unwrap();
    let players = [alice.join().unwrap(), bob.join().unwrap()];
    assert!(authority.history().is_terminal());
    for player in &players {
        assert!(matches!(player.exit(), Some(PlayerExit::Finished(Some(_)))));
        assert!(player.slot().is_some());
    }

    hub.stop();
}

/// A player that never answers has its turns skipped at the deadline, and
/// the game still finishes.
#[test]
fn silent_player_forfeits_by_timeout() {
    let (hub, addr) = start_test_hub();
    let config = SessionConfig {
        turn_timeout_ms: 300,
        ..session_config("silent", 2)
    };
    let authority = spawn_authority(addr, config, Countdown { tokens: 3 });
    let active = spawn_player(addr, "silent", "active", FirstLegal);
    let quiet = spawn_player(addr, "silent", "quiet", Silent);

    let authority = authority.join().unwrap();
    let active = active.join().unwrap();
    let quiet = quiet.join().unwrap();

    let forfeits = authority
        .history()
        .deltas()
        .iter()
        .filter(|d| {
            d.applied
                == AppliedAction::Forfeited {
                    by: pid("quiet"),
                    cause: ForfeitCause::Timeout,
                }
        })
        .count();
    assert!(forfeits >= 2, "expected skipped turns, got {forfeits}");

    assert_eq!(winners(active.exit()), vec!["active".to_owned()]);
    assert_eq!(winners(quiet.exit()), vec!["active".to_owned()]);

    hub.stop();
}

/// Simultaneous rounds: four players vote each round and the two survivors
/// win together.
#[test]
fn elimination_votes_resolve_each_round() {
    let (hub, addr) = start_test_hub();
    let authority = spawn_authority(addr, session_config("vote", 4), Elimination);
    let handles: Vec<_> = ["ann", "ben", "cat", "dan"]
        .into_iter()
        .map(|name| spawn_player(addr, "vote", name, FirstLegal))
        .collect();

    let authority = authority.join().unwrap();
    let players: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // Everyone votes for the lowest other living slot: slot 0 goes first,
    // then slot 1.
    let deltas = authority.history().deltas();
    assert_eq!(deltas.len(), 2);
    assert!(deltas.iter().all(|d| matches!(d.applied, AppliedAction::Joint { .. })));

    let expected = vec![
        holder_of(&players, 2).as_str().to_owned(),
        holder_of(&players, 3).as_str().to_owned(),
    ];
    for player in &players {
        assert_eq!(winners(player.exit()), expected);
    }

    hub.stop();
}

/// A third player for a two-slot session is turned away; the other two play.
#[test]
fn extra_player_is_turned_away() {
    let (hub, addr) = start_test_hub();
    let authority = spawn_authority(addr, session_config("crowded", 2), Countdown { tokens: 4 });
    let handles: Vec<_> = ["ann", "ben", "cat"]
        .into_iter()
        .map(|name| spawn_player(addr, "crowded", name, FirstLegal))
        .collect();

    let authority = authority.join().unwrap();
    let players: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let rejected = players
        .iter()
        .filter(|p| matches!(p.exit(), Some(PlayerExit::Rejected(_))))
        .count();
    let finished = players
        .iter()
        .filter(|p| matches!(p.exit(), Some(PlayerExit::Finished(Some(_)))))
        .count();
    assert_eq!((rejected, finished), (1, 2));
    assert!(authority.history().is_terminal());

    hub.stop();
}
