//! Respawn timing through the full session.

use std::time::Duration;

use session_shared::net::ConnectionId;
use session_tests::{
    in_progress, join_and_load, recording_session, test_config, tick_range, RecordingFactory,
};

const STEP: Duration = Duration::from_millis(100);

fn secs(s: f64) -> Duration {
    Duration::from_millis((s * 1000.0).round() as u64)
}

#[test]
fn body_lost_at_ten_seconds_respawns_once_at_fifteen() {
    let (factory, log) = RecordingFactory::new();
    let (mut s, hooks) = recording_session(&test_config(), Box::new(factory));
    s.load_scene("arena").unwrap();
    join_and_load(&mut s, ConnectionId(1), Duration::ZERO);
    assert!(in_progress(&s));
    tick_range(&mut s, STEP, secs(9.9), STEP).unwrap();
    assert_eq!(log.lock().unwrap().instantiated.len(), 1);

    let pawn = s.pawn_of(ConnectionId(1)).unwrap();
    assert!(s.kill(pawn, "fell"));
    s.tick(secs(10.0)).unwrap();
    assert_eq!(s.current_match().unwrap().respawns().len(), 1);

    tick_range(&mut s, secs(10.1), secs(14.9), STEP).unwrap();
    assert_eq!(log.lock().unwrap().instantiated.len(), 1);
    assert_eq!(s.pawn_of(ConnectionId(1)), None);

    s.tick(secs(15.0)).unwrap();
    assert_eq!(log.lock().unwrap().instantiated.len(), 2);

    tick_range(&mut s, secs(15.1), secs(20.0), STEP).unwrap();
    assert_eq!(log.lock().unwrap().instantiated.len(), 2);
    let body = s.pawn_of(ConnectionId(1)).unwrap();
    assert_ne!(body, pawn);
    assert_eq!(hooks.lock().unwrap().spawned.len(), 2);
}

#[test]
fn never_two_requests_for_one_connection() {
    let (factory, _) = RecordingFactory::new();
    let (mut s, _) = recording_session(&test_config(), Box::new(factory));
    s.load_scene("arena").unwrap();
    join_and_load(&mut s, ConnectionId(1), Duration::ZERO);
    s.tick(STEP).unwrap();

    let pawn = s.pawn_of(ConnectionId(1)).unwrap();
    s.kill(pawn, "fell");
    for t in [1.0, 1.0, 1.5, 2.0, 3.0] {
        s.tick(secs(t)).unwrap();
        assert_eq!(s.current_match().unwrap().respawns().len(), 1);
    }
}

#[test]
fn departed_player_is_not_respawned() {
    let (factory, log) = RecordingFactory::new();
    let (mut s, _) = recording_session(&test_config(), Box::new(factory));
    s.load_scene("arena").unwrap();
    join_and_load(&mut s, ConnectionId(1), Duration::ZERO);
    join_and_load(&mut s, ConnectionId(2), Duration::ZERO);
    s.tick(STEP).unwrap();
    s.tick(STEP * 2).unwrap();
    assert_eq!(log.lock().unwrap().instantiated.len(), 2);

    let pawn = s.pawn_of(ConnectionId(1)).unwrap();
    s.kill(pawn, "fell");
    s.tick(secs(10.0)).unwrap();
    s.disconnect(ConnectionId(1));
    assert!(s.current_match().unwrap().respawns().is_empty());

    tick_range(&mut s, secs(10.1), secs(16.0), STEP).unwrap();
    assert_eq!(log.lock().unwrap().instantiated.len(), 2);
}

#[test]
fn only_one_due_request_is_served_per_tick() {
    let (factory, log) = RecordingFactory::new();
    let (mut s, _) = recording_session(&test_config(), Box::new(factory));
    s.load_scene("arena").unwrap();
    join_and_load(&mut s, ConnectionId(1), Duration::ZERO);
    join_and_load(&mut s, ConnectionId(2), Duration::ZERO);
    s.tick(STEP).unwrap();
    s.tick(STEP * 2).unwrap();

    for id in [1, 2] {
        let pawn = s.pawn_of(ConnectionId(id)).unwrap();
        s.kill(pawn, "fell");
    }
    s.tick(secs(1.0)).unwrap();
    assert_eq!(s.current_match().unwrap().respawns().len(), 2);

    s.tick(secs(6.0)).unwrap();
    assert_eq!(log.lock().unwrap().instantiated.len(), 3);
    s.tick(secs(6.1)).unwrap();
    assert_eq!(log.lock().unwrap().instantiated.len(), 4);
}
