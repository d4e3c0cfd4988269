//! Random connect, close and transfer sequences across several lanes never leave a
//! connection owned by two lanes at once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use mmo_lanes_server::auth::DevAuthenticator;
use mmo_lanes_server::config::{PlacementKind, ServerConfig};
use mmo_lanes_server::coordinator::Placement;
use mmo_lanes_server::protocol::{encode_client_message, ClientMessage};
use mmo_lanes_server::runtime::{assemble, Assembly};
use mmo_lanes_server::transport::MemoryTransport;
use mmo_lanes_server::types::{ConnectionHandle, Destination, InstanceKey, LaneId};
use proptest::prelude::*;

const SLOTS: usize = 6;

#[derive(Clone, Debug)]
enum Op {
    Connect(usize),
    Close(usize),
    Transfer(usize, usize),
    Step,
}

fn op_strategy(lanes: usize) -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..SLOTS).prop_map(Op::Connect),
        1 => (0..SLOTS).prop_map(Op::Close),
        3 => (0..SLOTS, 0..lanes).prop_map(|(slot, lane)| Op::Transfer(slot, lane)),
        4 => Just(Op::Step),
    ]
}

fn scenario_strategy() -> impl Strategy<Value = (usize, Vec<Op>)> {
    (2usize..=4).prop_flat_map(|lanes| (Just(lanes), prop::collection::vec(op_strategy(lanes), 1..80)))
}

struct World {
    transport: Arc<MemoryTransport>,
    assembly: Assembly,
    slots: Vec<Option<ConnectionHandle>>,
    closed: Vec<ConnectionHandle>,
    started: Instant,
    ticks: u64,
}

impl World {
    fn new(lanes: usize) -> Self {
        let config = ServerConfig {
            lanes,
            max_clients: 64,
            queue_capacity: 64,
            placement: PlacementKind::RoundRobin,
            ..ServerConfig::default()
        };
        let transport = Arc::new(MemoryTransport::new(4096));
        let assembly = assemble(&config, transport.clone(), Box::new(DevAuthenticator::new()))
            .expect("config should be valid");
        Self {
            transport,
            assembly,
            slots: vec![None; SLOTS],
            closed: Vec::new(),
            started: Instant::now(),
            ticks: 0,
        }
    }

    fn apply(&mut self, op: &Op) {
        match *op {
            Op::Connect(slot) => {
                if self.slots[slot].is_some() {
                    return;
                }
                let handle = self.transport.open();
                let hello = encode_client_message(&ClientMessage::Hello {
                    nickname: format!("p{slot}"),
                    leader_class: 0,
                    session_token: None,
                })
                .expect("hello should encode");
                assert!(self.transport.client_send(handle, &hello));
                self.slots[slot] = Some(handle);
            }
            Op::Close(slot) => {
                if let Some(handle) = self.slots[slot].take() {
                    self.transport.client_close(handle);
                    self.closed.push(handle);
                }
            }
            Op::Transfer(slot, lane) => {
                if let Some(handle) = self.slots[slot] {
                    self.assembly.coordinator.request_transfer(
                        handle,
                        Destination::on_lane(LaneId(lane), InstanceKey::Hub),
                    );
                }
            }
            Op::Step => self.step(),
        }
    }

    fn step(&mut self) {
        self.ticks += 1;
        let now = self.started + Duration::from_millis(self.ticks * 50);
        self.assembly.step(now);
        for handle in self.transport_handles() {
            // Server output is irrelevant here; keep the queues from filling up.
            self.transport.client_receive(handle);
        }
    }

    fn transport_handles(&self) -> Vec<ConnectionHandle> {
        self.slots.iter().flatten().copied().collect()
    }

    fn check_ownership(&self) -> Result<(), TestCaseError> {
        for handle in self.slots.iter().flatten().chain(self.closed.iter()) {
            let owners = self.assembly.owners_of(*handle);
            prop_assert!(owners.len() <= 1, "{handle} owned by {owners:?}");
        }
        for handle in &self.closed {
            prop_assert!(
                self.assembly.owners_of(*handle).is_empty(),
                "closed {handle} still owned"
            );
        }
        for handle in self.slots.iter().flatten() {
            if let Some(Placement::Owned { lane, .. }) =
                self.assembly.coordinator.placement_of(*handle)
            {
                prop_assert_eq!(self.assembly.owners_of(*handle), vec![lane]);
            }
        }
        Ok(())
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn no_connection_is_owned_by_two_lanes((lanes, ops) in scenario_strategy()) {
        let mut world = World::new(lanes);
        for op in &ops {
            world.apply(op);
            if matches!(op, Op::Step) {
                world.check_ownership()?;
            }
        }

        for _ in 0..4 {
            world.step();
        }
        world.check_ownership()?;
        for handle in world.transport_handles() {
            prop_assert_eq!(world.assembly.owners_of(handle).len(), 1, "{} unplaced", handle);
        }
    }
}
