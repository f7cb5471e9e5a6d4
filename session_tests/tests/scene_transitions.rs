//! Scene-load handshake across several connections.

use std::time::Duration;

use session_server::MatchState;
use session_shared::{
    ecs::EntityId,
    net::{Channel, ConnectionId, NetMsg},
};
use session_tests::{
    join_and_load, recording_session, test_config, ManualFactory, ManualSpawns, RecordingFactory,
};

fn ack(generation: u32) -> NetMsg {
    NetMsg::LoadSceneDone { generation }
}

#[test]
fn late_joiner_gets_exactly_one_load_for_current_generation() {
    let (factory, _) = RecordingFactory::new();
    let (mut s, _) = recording_session(&test_config(), Box::new(factory));
    for scene in ["a", "b", "c"] {
        s.load_scene(scene).unwrap();
    }
    assert_eq!(s.generation(), 3);
    s.drain_outbox();

    s.connect(ConnectionId(7)).unwrap();
    let loads: Vec<_> = s
        .drain_outbox()
        .into_iter()
        .filter(|o| matches!(o.msg, NetMsg::LoadScene { .. }))
        .collect();
    assert_eq!(loads.len(), 1);
    assert_eq!(loads[0].to, ConnectionId(7));
    assert_eq!(loads[0].channel, Channel::Reliable);
    assert_eq!(
        loads[0].msg,
        NetMsg::LoadScene {
            scene_name: "c".into(),
            generation: 3
        }
    );
    assert!(s
        .registry()
        .get(ConnectionId(7))
        .unwrap()
        .is_loading_level());
}

#[test]
fn all_loaded_fires_once_when_remaining_peers_ack() {
    let (factory, _) = RecordingFactory::new();
    let (mut s, hooks) = recording_session(&test_config(), Box::new(factory));
    for id in 1..=3 {
        s.connect(ConnectionId(id)).unwrap();
    }
    s.load_scene("arena").unwrap();

    s.handle_message(ConnectionId(1), ack(1));
    s.disconnect(ConnectionId(3));
    assert!(hooks.lock().unwrap().all_loaded.is_empty());

    s.handle_message(ConnectionId(2), ack(1));
    assert_eq!(hooks.lock().unwrap().all_loaded, vec![1]);

    // Nothing can make it fire again for this generation.
    s.handle_message(ConnectionId(2), ack(1));
    s.connect(ConnectionId(4)).unwrap();
    s.handle_message(ConnectionId(4), ack(1));
    s.tick(Duration::ZERO).unwrap();
    assert_eq!(hooks.lock().unwrap().all_loaded, vec![1]);
    assert_eq!(s.scene().ack_count(), 3);
}

#[test]
fn last_loader_leaving_completes_the_generation() {
    let (factory, _) = RecordingFactory::new();
    let (mut s, hooks) = recording_session(&test_config(), Box::new(factory));
    s.connect(ConnectionId(1)).unwrap();
    s.connect(ConnectionId(2)).unwrap();
    s.load_scene("arena").unwrap();
    s.handle_message(ConnectionId(1), ack(1));
    assert!(hooks.lock().unwrap().all_loaded.is_empty());

    s.disconnect(ConnectionId(2));
    assert_eq!(hooks.lock().unwrap().all_loaded, vec![1]);
}

#[test]
fn stale_acks_change_nothing() {
    let (factory, _) = RecordingFactory::new();
    let (mut s, hooks) = recording_session(&test_config(), Box::new(factory));
    s.connect(ConnectionId(1)).unwrap();
    s.load_scene("a").unwrap();
    s.load_scene("b").unwrap();
    s.drain_outbox();

    for stale in [0, 1, 3, 99] {
        s.handle_message(ConnectionId(1), ack(stale));
    }
    assert_eq!(s.scene().ack_count(), 0);
    assert!(s
        .registry()
        .get(ConnectionId(1))
        .unwrap()
        .is_loading_level());
    assert!(hooks.lock().unwrap().all_loaded.is_empty());
    assert!(s.outbox().is_empty());

    s.handle_message(ConnectionId(1), ack(2));
    assert_eq!(hooks.lock().unwrap().all_loaded, vec![2]);
}

#[test]
fn new_scene_tears_down_previous_match_and_entities() {
    let (factory, log) = RecordingFactory::new();
    let (mut s, hooks) = recording_session(&test_config(), Box::new(factory));
    s.load_scene("a").unwrap();
    join_and_load(&mut s, ConnectionId(1), Duration::ZERO);
    s.tick(Duration::from_millis(16)).unwrap();
    assert_eq!(s.match_state(), Some(MatchState::InProgress));
    let pawn = s.pawn_of(ConnectionId(1)).unwrap();

    assert_eq!(s.load_scene("b"), Ok(2));
    {
        let hooks = hooks.lock().unwrap();
        assert_eq!(hooks.match_ended, 1);
        assert_eq!(hooks.left_map, 1);
    }
    assert_eq!(s.match_state(), Some(MatchState::WaitingToStart));
    assert_eq!(s.pawn_of(ConnectionId(1)), None);
    assert!(s.world().is_empty());
    assert!(log.lock().unwrap().released.contains(&pawn));
    assert!(s
        .registry()
        .get(ConnectionId(1))
        .unwrap()
        .replica()
        .is_empty());
}

#[test]
fn spawn_completing_after_scene_change_is_released() {
    let spawns = ManualSpawns::default();
    let (mut s, _) = recording_session(&test_config(), Box::new(ManualFactory(spawns.clone())));
    s.load_scene("a").unwrap();
    join_and_load(&mut s, ConnectionId(1), Duration::ZERO);
    assert_eq!(spawns.pending(), 1);

    s.load_scene("b").unwrap();
    assert!(spawns.complete_next(EntityId(50)));
    s.handle_message(ConnectionId(1), ack(2));
    s.tick(Duration::from_millis(16)).unwrap();

    assert_eq!(spawns.released(), vec![EntityId(50)]);
    assert_eq!(s.pawn_of(ConnectionId(1)), None);
    assert!(!s.world().contains(EntityId(50)));
    // The new match asked for a fresh body.
    assert_eq!(spawns.pending(), 1);
}

#[test]
fn spawn_for_departed_connection_is_released() {
    let spawns = ManualSpawns::default();
    let (mut s, _) = recording_session(&test_config(), Box::new(ManualFactory(spawns.clone())));
    s.load_scene("a").unwrap();
    join_and_load(&mut s, ConnectionId(1), Duration::ZERO);

    s.disconnect(ConnectionId(1));
    assert!(spawns.complete_next(EntityId(60)));
    s.tick(Duration::from_millis(16)).unwrap();

    assert_eq!(spawns.released(), vec![EntityId(60)]);
    assert!(s.world().is_empty());
}
