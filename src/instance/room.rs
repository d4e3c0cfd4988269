use std::collections::BTreeMap;

use serde_json::json;
use tracing::{debug, info};

use crate::error::InstanceError;
use crate::protocol::ClientMessage;
use crate::types::{
    AccountContext, AccountId, ConnectionHandle, Destination, EntityUid, InstanceKey, MatchSeat,
    MatchSpec, RoomSpec,
};

use super::{InstanceCommand, InstanceContext, InstanceCore, InstanceSpec};

#[derive(Clone, Debug)]
struct Seat {
    entity: EntityUid,
    team: u8,
    class_type: u8,
    ready: bool,
}

/// Pre-match lobby. Each expected account gets a seat; once every seat is ready the room
/// spawns the match on its lane, moves everyone there and closes.
pub struct RoomInstance {
    pub(crate) core: InstanceCore,
    spec: RoomSpec,
    seats: BTreeMap<AccountId, Seat>,
    ever_joined: bool,
    launched: bool,
    terminated: bool,
}

impl RoomInstance {
    pub(crate) fn new(core: InstanceCore, spec: RoomSpec) -> Self {
        Self {
            core,
            spec,
            seats: BTreeMap::new(),
            ever_joined: false,
            launched: false,
            terminated: false,
        }
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub(crate) fn init(&mut self, _ctx: &mut InstanceContext<'_>) -> Result<(), InstanceError> {
        for (index, account_id) in self.spec.accounts.iter().enumerate() {
            let team = (index % 2) as u8;
            let entity = self.core.world.spawn_service(
                "seat",
                json!({
                    "accountId": account_id,
                    "team": team,
                    "classType": 0,
                    "ready": false,
                }),
            );
            self.seats.insert(
                *account_id,
                Seat {
                    entity,
                    team,
                    class_type: 0,
                    ready: false,
                },
            );
        }
        Ok(())
    }

    pub(crate) fn on_client_joined(
        &mut self,
        ctx: &mut InstanceContext<'_>,
        handle: ConnectionHandle,
        account: AccountContext,
    ) -> Result<(), InstanceError> {
        if !self.seats.contains_key(&account.account_id) || self.launched {
            return Err(InstanceError::Unexpected {
                instance: self.core.key,
            });
        }
        self.ever_joined = true;
        self.core.join(ctx, handle, account, false)
    }

    pub(crate) fn on_packet(
        &mut self,
        _ctx: &mut InstanceContext<'_>,
        handle: ConnectionHandle,
        message: ClientMessage,
    ) -> Result<(), InstanceError> {
        let Some(account_id) = self
            .core
            .members
            .get(&handle)
            .map(|member| member.account.account_id)
        else {
            return Err(InstanceError::NotMember {
                handle,
                instance: self.core.key,
            });
        };
        let Some(seat) = self.seats.get_mut(&account_id) else {
            return Ok(());
        };
        match message {
            ClientMessage::PickClass { class_type } => {
                if seat.ready {
                    debug!(%handle, "class pick ignored after ready");
                    return Ok(());
                }
                seat.class_type = class_type;
            }
            ClientMessage::Ready { ready } => {
                seat.ready = ready;
            }
            other => {
                debug!(%handle, message = ?other, "room ignores message");
                return Ok(());
            }
        }
        let body = json!({
            "accountId": account_id,
            "team": seat.team,
            "classType": seat.class_type,
            "ready": seat.ready,
        });
        let entity = seat.entity;
        self.core.world.update_service(entity, body)?;
        Ok(())
    }

    pub(crate) fn update(&mut self, ctx: &mut InstanceContext<'_>) -> Result<(), InstanceError> {
        self.core.step(ctx)?;
        if self.terminated {
            return Ok(());
        }

        if self.ever_joined && self.core.members.is_empty() {
            info!(room = self.spec.room_id, "room emptied");
            self.terminate(ctx);
            return Ok(());
        }

        let everyone_present = self.core.members.len() == self.seats.len();
        let everyone_ready = self.seats.values().all(|seat| seat.ready);
        if !self.launched && everyone_present && everyone_ready {
            self.launch(ctx);
        }
        Ok(())
    }

    fn launch(&mut self, ctx: &mut InstanceContext<'_>) {
        self.launched = true;
        let match_spec = MatchSpec {
            match_id: self.spec.match_id,
            seats: self
                .seats
                .iter()
                .map(|(account_id, seat)| MatchSeat {
                    account_id: *account_id,
                    team: seat.team,
                    class_type: seat.class_type,
                })
                .collect(),
            bots: 0,
        };
        info!(
            room = self.spec.room_id,
            match_id = self.spec.match_id,
            players = match_spec.seats.len(),
            "room launching match"
        );
        ctx.commands.push(InstanceCommand::Spawn(InstanceSpec::Match(match_spec)));
        self.core.transfer_all(
            ctx,
            Destination::on_lane(ctx.lane, InstanceKey::Match(self.spec.match_id)),
        );
        self.terminate(ctx);
    }

    fn terminate(&mut self, ctx: &mut InstanceContext<'_>) {
        self.terminated = true;
        ctx.commands.push(InstanceCommand::Terminate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::tests::{account, settings, Harness};
    use crate::instance::Instance;
    use crate::types::LaneId;

    fn room(harness: &mut Harness) -> Instance {
        let spec = RoomSpec {
            room_id: 3,
            match_id: 30,
            accounts: vec![AccountId(1), AccountId(2)],
        };
        let mut room = Instance::create(InstanceSpec::Room(spec), settings());
        room.init(&mut harness.ctx()).expect("init should succeed");
        room
    }

    #[test]
    fn unexpected_account_is_refused() {
        let mut harness = Harness::new();
        let mut room = room(&mut harness);
        let result = room.on_client_joined(&mut harness.ctx(), ConnectionHandle(9), account(9));
        assert!(matches!(result, Err(InstanceError::Unexpected { .. })));
    }

    #[test]
    fn all_ready_launches_match_and_closes() {
        let mut harness = Harness::new();
        let mut room = room(&mut harness);
        for id in [1, 2] {
            room.on_client_joined(&mut harness.ctx(), ConnectionHandle(id), account(id))
                .expect("join should succeed");
            room.on_packet(
                &mut harness.ctx(),
                ConnectionHandle(id),
                ClientMessage::PickClass { class_type: 4 },
            );
        }
        room.on_packet(
            &mut harness.ctx(),
            ConnectionHandle(1),
            ClientMessage::Ready { ready: true },
        );
        harness.update(&mut room).expect("update should succeed");
        assert!(harness.commands.is_empty());

        room.on_packet(
            &mut harness.ctx(),
            ConnectionHandle(2),
            ClientMessage::Ready { ready: true },
        );
        harness.update(&mut room).expect("update should succeed");

        assert!(room.is_terminated());
        let InstanceCommand::Spawn(InstanceSpec::Match(spec)) = &harness.commands[0] else {
            panic!("expected match spawn first");
        };
        assert_eq!(spec.match_id, 30);
        assert!(spec.seats.iter().all(|seat| seat.class_type == 4));
        let transfers = harness
            .commands
            .iter()
            .filter(|command| {
                matches!(
                    command,
                    InstanceCommand::Transfer { destination, .. }
                        if *destination == Destination::on_lane(LaneId(0), InstanceKey::Match(30))
                )
            })
            .count();
        assert_eq!(transfers, 2);
        assert_eq!(harness.commands.last(), Some(&InstanceCommand::Terminate));
    }

    #[test]
    fn empty_room_closes() {
        let mut harness = Harness::new();
        let mut room = room(&mut harness);
        room.on_client_joined(&mut harness.ctx(), ConnectionHandle(1), account(1))
            .expect("join should succeed");
        room.on_client_left(&mut harness.ctx(), ConnectionHandle(1));
        harness.update(&mut room).expect("update should succeed");
        assert!(room.is_terminated());
    }
}
