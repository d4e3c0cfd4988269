use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::error::InstanceError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::types::{
    AccountContext, AccountId, ConnectionHandle, Destination, MatchPhase, MatchSpec,
};

use super::{InstanceCommand, InstanceContext, InstanceCore};

/// A timed match. Waits for every expected account, plays for the configured duration,
/// then sends everyone back to a hub and closes.
pub struct PvpMatchInstance {
    pub(crate) core: InstanceCore,
    spec: MatchSpec,
    phase: MatchPhase,
    joined: BTreeSet<AccountId>,
    phase_elapsed_ms: u64,
    terminated: bool,
}

impl PvpMatchInstance {
    pub(crate) fn new(core: InstanceCore, spec: MatchSpec) -> Self {
        Self {
            core,
            spec,
            phase: MatchPhase::WaitingForPlayers,
            joined: BTreeSet::new(),
            phase_elapsed_ms: 0,
            terminated: false,
        }
    }

    pub fn phase(&self) -> MatchPhase {
        self.phase
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub(crate) fn init(&mut self, _ctx: &mut InstanceContext<'_>) -> Result<(), InstanceError> {
        info!(
            match_id = self.spec.match_id,
            seats = self.spec.seats.len(),
            bots = self.spec.bots,
            "match created"
        );
        Ok(())
    }

    /// Expected accounts that have not connected yet.
    pub fn remaining_links(&self) -> usize {
        self.spec
            .seats
            .iter()
            .filter(|seat| !self.joined.contains(&seat.account_id))
            .count()
    }

    pub(crate) fn on_client_joined(
        &mut self,
        ctx: &mut InstanceContext<'_>,
        handle: ConnectionHandle,
        mut account: AccountContext,
    ) -> Result<(), InstanceError> {
        if !self.spec.expects(account.account_id) || self.phase == MatchPhase::Finished {
            return Err(InstanceError::Unexpected {
                instance: self.core.key,
            });
        }
        if let Some(seat) = self
            .spec
            .seats
            .iter()
            .find(|seat| seat.account_id == account.account_id)
        {
            account.leader_class = seat.class_type;
        }
        let account_id = account.account_id;
        self.core.join(ctx, handle, account, true)?;
        self.joined.insert(account_id);
        ctx.outbox.reliable(handle, self.phase_message());
        Ok(())
    }

    pub(crate) fn on_client_left(&mut self, _ctx: &mut InstanceContext<'_>, handle: ConnectionHandle) {
        debug!(%handle, match_id = self.spec.match_id, remaining = self.core.members.len(), "player left match");
    }

    pub(crate) fn on_packet(
        &mut self,
        _ctx: &mut InstanceContext<'_>,
        handle: ConnectionHandle,
        message: ClientMessage,
    ) -> Result<(), InstanceError> {
        debug!(%handle, message = ?message, "match ignores message");
        Ok(())
    }

    pub(crate) fn update(&mut self, ctx: &mut InstanceContext<'_>) -> Result<(), InstanceError> {
        self.core.step(ctx)?;
        if self.terminated {
            return Ok(());
        }
        self.phase_elapsed_ms += ctx.dt_ms;

        match self.phase {
            MatchPhase::WaitingForPlayers => {
                if self.remaining_links() == 0 {
                    self.enter_phase(ctx, MatchPhase::Playing);
                } else if self.phase_elapsed_ms >= self.core.settings.match_connect_timeout_ms {
                    if self.core.members.is_empty() {
                        info!(match_id = self.spec.match_id, "nobody connected to match");
                        self.finish(ctx);
                    } else {
                        info!(
                            match_id = self.spec.match_id,
                            missing = self.remaining_links(),
                            "starting match without every player"
                        );
                        self.enter_phase(ctx, MatchPhase::Playing);
                    }
                }
            }
            MatchPhase::Playing => {
                if self.core.members.is_empty() {
                    info!(match_id = self.spec.match_id, "every player left the match");
                    self.finish(ctx);
                } else if self.phase_elapsed_ms >= self.core.settings.match_duration_ms {
                    self.finish(ctx);
                }
            }
            MatchPhase::Finished => {}
        }
        Ok(())
    }

    fn phase_message(&self) -> ServerMessage {
        let remaining_ms = match self.phase {
            MatchPhase::Playing => self
                .core
                .settings
                .match_duration_ms
                .saturating_sub(self.phase_elapsed_ms),
            _ => 0,
        };
        ServerMessage::MatchPhase {
            phase: self.phase,
            remaining_ms,
        }
    }

    fn enter_phase(&mut self, ctx: &mut InstanceContext<'_>, phase: MatchPhase) {
        info!(match_id = self.spec.match_id, ?phase, "match phase changed");
        self.phase = phase;
        self.phase_elapsed_ms = 0;
        let message = self.phase_message();
        self.core.broadcast(ctx, message);
    }

    fn finish(&mut self, ctx: &mut InstanceContext<'_>) {
        self.enter_phase(ctx, MatchPhase::Finished);
        self.core.transfer_all(ctx, Destination::hub());
        self.terminated = true;
        ctx.commands.push(InstanceCommand::Terminate);
    }
}
