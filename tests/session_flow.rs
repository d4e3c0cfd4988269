//! End-to-end session flows driven synchronously over the in-memory transport.

use std::sync::Arc;
use std::time::{Duration, Instant};

use mmo_lanes_server::auth::DevAuthenticator;
use mmo_lanes_server::bot::{Bot, BotPhase};
use mmo_lanes_server::config::{PlacementKind, ServerConfig, ServerRole};
use mmo_lanes_server::constants::CLOSE_CODE_NORMAL;
use mmo_lanes_server::coordinator::{ControlRequest, Placement};
use mmo_lanes_server::protocol::ClientMessage;
use mmo_lanes_server::runtime::{assemble, Assembly};
use mmo_lanes_server::transport::MemoryTransport;
use mmo_lanes_server::types::{
    AccountId, ControlMessage, ControlScope, InstanceKey, MatchSeat, MatchSpec,
};

struct Harness {
    transport: Arc<MemoryTransport>,
    assembly: Assembly,
    started: Instant,
    ticks: u64,
}

impl Harness {
    fn new(config: ServerConfig) -> Self {
        let transport = Arc::new(MemoryTransport::new(4096));
        let assembly = assemble(&config, transport.clone(), Box::new(DevAuthenticator::new()))
            .expect("config should be valid");
        Self {
            transport,
            assembly,
            started: Instant::now(),
            ticks: 0,
        }
    }

    fn step(&mut self, bots: &mut [Bot]) {
        self.ticks += 1;
        let now = self.started + Duration::from_millis(self.ticks * 50);
        self.assembly.step(now);
        for bot in bots.iter_mut() {
            bot.poll();
            bot.act(self.ticks);
        }
    }

    fn run_until(&mut self, bots: &mut [Bot], limit: u64, done: impl Fn(&[Bot]) -> bool) -> bool {
        for _ in 0..limit {
            self.step(bots);
            if done(bots) {
                return true;
            }
        }
        false
    }
}

fn config(role: ServerRole) -> ServerConfig {
    ServerConfig {
        role,
        lanes: 2,
        tick_rate: 20,
        max_clients: 32,
        queue_capacity: 64,
        placement: PlacementKind::RoundRobin,
        match_duration_ms: 1_000,
        match_connect_timeout_ms: 500,
        ..ServerConfig::default()
    }
}

fn all_playing(bots: &[Bot]) -> bool {
    bots.iter().all(|bot| bot.phase() == BotPhase::Playing)
}

fn assert_clean(bots: &[Bot]) {
    for bot in bots {
        assert!(bot.anomalies().is_empty(), "{}: {:?}", bot.nickname(), bot.anomalies());
    }
}

#[test]
fn bots_join_hubs_and_see_each_other() {
    let mut harness = Harness::new(config(ServerRole::Hub));
    let mut bots: Vec<Bot> = (0..4)
        .map(|idx| Bot::connect(harness.transport.clone(), &format!("bot-{idx}"), idx))
        .collect();

    assert!(harness.run_until(&mut bots, 40, all_playing));
    for bot in &bots {
        assert_eq!(bot.instance(), Some(InstanceKey::Hub));
        assert!(bot.session_token().is_some());
        let owners = harness.assembly.owners_of(bot.handle());
        assert_eq!(owners.len(), 1);
    }
    // Round robin puts two bots on each lane; each hub shows the other player.
    assert!(bots.iter().all(|bot| bot.known_entities() >= 2));

    bots[0].send(&ClientMessage::Chat {
        text: "hello hub".to_string(),
    });
    harness.run_until(&mut bots, 3, |_| false);
    assert!(bots.iter().filter(|bot| bot.chats_received() > 0).count() >= 2);
    assert_clean(&bots);
}

#[test]
fn announcement_reaches_every_lane() {
    let mut harness = Harness::new(config(ServerRole::Hub));
    let mut bots: Vec<Bot> = (0..2)
        .map(|idx| Bot::connect(harness.transport.clone(), &format!("bot-{idx}"), idx))
        .collect();
    assert!(harness.run_until(&mut bots, 40, all_playing));

    harness
        .assembly
        .control
        .try_send(ControlRequest::Route {
            scope: ControlScope::Broadcast,
            message: ControlMessage::Announcement {
                text: "maintenance soon".to_string(),
            },
        })
        .expect("control queue should accept");
    harness.run_until(&mut bots, 3, |_| false);

    for bot in &bots {
        assert_eq!(bot.notices(), ["maintenance soon".to_string()]);
    }
}

#[test]
fn match_round_trip_returns_players_to_the_hub() {
    let mut harness = Harness::new(config(ServerRole::Hub));
    let mut bots: Vec<Bot> = (0..3)
        .map(|idx| Bot::connect(harness.transport.clone(), &format!("bot-{idx}"), idx))
        .collect();
    assert!(harness.run_until(&mut bots, 40, all_playing));

    let seats: Vec<MatchSeat> = bots[..2]
        .iter()
        .filter_map(Bot::account_id)
        .map(|id| MatchSeat {
            account_id: AccountId(id),
            team: 0,
            class_type: 1,
        })
        .collect();
    assert_eq!(seats.len(), 2);
    harness
        .assembly
        .control
        .try_send(ControlRequest::CreateMatch(MatchSpec {
            match_id: 77,
            seats,
            bots: 1,
        }))
        .expect("control queue should accept");

    let in_match = harness.run_until(&mut bots, 40, |bots| {
        bots[..2]
            .iter()
            .all(|bot| bot.instance() == Some(InstanceKey::Match(77)) && bot.phase() == BotPhase::Playing)
    });
    assert!(in_match, "players never reached the match");
    for bot in &bots[..2] {
        assert!(matches!(
            harness.assembly.coordinator.placement_of(bot.handle()),
            Some(Placement::Owned {
                instance: InstanceKey::Match(77),
                ..
            })
        ));
    }
    assert_eq!(bots[2].instance(), Some(InstanceKey::Hub));

    let back = harness.run_until(&mut bots, 60, |bots| {
        bots[..2]
            .iter()
            .all(|bot| bot.instances_entered() >= 3 && bot.phase() == BotPhase::Playing)
    });
    assert!(back, "players never came back from the match");
    for bot in &bots {
        assert_eq!(bot.instance(), Some(InstanceKey::Hub));
        assert_eq!(harness.assembly.owners_of(bot.handle()).len(), 1);
    }
    assert!(harness
        .assembly
        .lanes
        .iter()
        .all(|lane| lane.instance(InstanceKey::Match(77)).is_none()));
    assert_clean(&bots);
}

#[test]
fn play_server_closes_connection_when_match_ends() {
    let mut harness = Harness::new(config(ServerRole::Play));
    // Accounts are minted from 1 upward.
    harness
        .assembly
        .control
        .try_send(ControlRequest::CreateMatch(MatchSpec {
            match_id: 5,
            seats: vec![MatchSeat {
                account_id: AccountId(1),
                team: 0,
                class_type: 2,
            }],
            bots: 0,
        }))
        .expect("control queue should accept");
    let mut bots = Vec::new();
    harness.step(&mut bots);

    bots.push(Bot::connect(harness.transport.clone(), "solo", 9));
    let playing = harness.run_until(&mut bots, 20, all_playing);
    assert!(playing);
    assert_eq!(bots[0].instance(), Some(InstanceKey::Match(5)));

    let closed = harness.run_until(&mut bots, 60, |bots| bots[0].phase() == BotPhase::Closed);
    assert!(closed, "play connection stayed open after the match");
    assert_eq!(
        harness.transport.close_code(bots[0].handle()).map(|(code, _)| code),
        Some(CLOSE_CODE_NORMAL)
    );
    assert_eq!(harness.assembly.coordinator.session_count(), 0);
}

#[test]
fn play_server_rejects_accounts_without_a_match() {
    let mut harness = Harness::new(config(ServerRole::Play));
    let mut bots = vec![Bot::connect(harness.transport.clone(), "stray", 1)];
    harness.run_until(&mut bots, 3, |_| false);
    assert_eq!(bots[0].phase(), BotPhase::Closed);
    assert!(harness.assembly.owners_of(bots[0].handle()).is_empty());
}
