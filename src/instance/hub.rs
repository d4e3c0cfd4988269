use std::collections::VecDeque;

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::constants::{CHAT_MAX_LEN, JUKEBOX_MAX_QUEUE, JUKEBOX_SONG_MS};
use crate::error::InstanceError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::types::{ConnectionHandle, ControlMessage, EntityUid};

use super::{InstanceCommand, InstanceContext, InstanceCore};

/// Long-lived social space with chat and a shared jukebox.
pub struct HubInstance {
    pub(crate) core: InstanceCore,
    jukebox: Option<EntityUid>,
    queue: VecDeque<u32>,
    now_playing: Option<u32>,
    song_elapsed_ms: u64,
}

impl HubInstance {
    pub(crate) fn new(core: InstanceCore) -> Self {
        Self {
            core,
            jukebox: None,
            queue: VecDeque::new(),
            now_playing: None,
            song_elapsed_ms: 0,
        }
    }

    pub(crate) fn init(&mut self, _ctx: &mut InstanceContext<'_>) -> Result<(), InstanceError> {
        let body = self.jukebox_body();
        self.jukebox = Some(self.core.world.spawn_service("jukebox", body));
        Ok(())
    }

    pub(crate) fn on_packet(
        &mut self,
        ctx: &mut InstanceContext<'_>,
        handle: ConnectionHandle,
        message: ClientMessage,
    ) -> Result<(), InstanceError> {
        match message {
            ClientMessage::Chat { text } => {
                let Some(text) = sanitize_chat(&text) else {
                    return Ok(());
                };
                let Some(member) = self.core.members.get(&handle) else {
                    return Ok(());
                };
                let sender = member.account.nickname.clone();
                self.core
                    .broadcast(ctx, ServerMessage::Chat { sender, text });
            }
            ClientMessage::JukeboxQueueSong { song_id } => {
                if self.queue.len() >= JUKEBOX_MAX_QUEUE {
                    ctx.outbox
                        .reliable(handle, ServerMessage::error("jukebox queue is full"));
                    return Ok(());
                }
                self.queue.push_back(song_id);
                if self.now_playing.is_none() {
                    self.advance_song();
                }
                self.publish_jukebox()?;
            }
            other => {
                debug!(%handle, message = ?other, "hub ignores message");
            }
        }
        Ok(())
    }

    pub(crate) fn on_control(
        &mut self,
        ctx: &mut InstanceContext<'_>,
        target: Option<ConnectionHandle>,
        message: &ControlMessage,
    ) {
        match (target, message) {
            (Some(handle), ControlMessage::MatchFound { destination }) => {
                if !self.core.members.contains_key(&handle) {
                    debug!(%handle, "match found for connection that already left the hub");
                    return;
                }
                info!(%handle, instance = %destination.key, "moving player to match");
                ctx.outbox.reliable(
                    handle,
                    ServerMessage::MatchFound {
                        instance: destination.key,
                    },
                );
                ctx.commands.push(InstanceCommand::Transfer {
                    handle,
                    destination: *destination,
                });
            }
            _ => debug!(?message, "hub ignores control message"),
        }
    }

    pub(crate) fn update(&mut self, ctx: &mut InstanceContext<'_>) -> Result<(), InstanceError> {
        if self.now_playing.is_some() {
            self.song_elapsed_ms += ctx.dt_ms;
            if self.song_elapsed_ms >= JUKEBOX_SONG_MS {
                self.advance_song();
                self.publish_jukebox()?;
            }
        }
        self.core.step(ctx)
    }

    fn advance_song(&mut self) {
        self.now_playing = self.queue.pop_front();
        self.song_elapsed_ms = 0;
    }

    fn jukebox_body(&self) -> Value {
        json!({
            "nowPlaying": self.now_playing,
            "queue": self.queue,
        })
    }

    fn publish_jukebox(&mut self) -> Result<(), InstanceError> {
        let Some(uid) = self.jukebox else {
            return Ok(());
        };
        let body = self.jukebox_body();
        self.core.world.update_service(uid, body)?;
        Ok(())
    }
}

fn sanitize_chat(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(CHAT_MAX_LEN).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::tests::{account, settings, Harness};
    use crate::instance::{Instance, InstanceSpec};
    use crate::types::{Destination, InstanceKey, LaneId};

    fn hub_with(harness: &mut Harness, handles: &[u64]) -> Instance {
        let mut hub = Instance::create(InstanceSpec::Hub, settings());
        hub.init(&mut harness.ctx()).expect("init should succeed");
        for id in handles {
            hub.on_client_joined(&mut harness.ctx(), ConnectionHandle(*id), account(*id))
                .expect("join should succeed");
        }
        hub
    }

    #[test]
    fn chat_is_broadcast_with_sender_name() {
        let mut harness = Harness::new();
        let mut hub = hub_with(&mut harness, &[1, 2]);
        harness.outbox.clear();

        hub.on_packet(
            &mut harness.ctx(),
            ConnectionHandle(1),
            ClientMessage::Chat {
                text: "  hello  ".to_string(),
            },
        );
        let expected = ServerMessage::Chat {
            sender: "player1".to_string(),
            text: "hello".to_string(),
        };
        assert_eq!(harness.outbox.messages_for(ConnectionHandle(1)), vec![&expected]);
        assert_eq!(harness.outbox.messages_for(ConnectionHandle(2)), vec![&expected]);
    }

    #[test]
    fn blank_chat_is_dropped() {
        assert_eq!(sanitize_chat("   "), None);
        assert_eq!(sanitize_chat(&"x".repeat(500)).map(|text| text.len()), Some(CHAT_MAX_LEN));
    }

    #[test]
    fn jukebox_updates_are_replicated() {
        let mut harness = Harness::new();
        let mut hub = hub_with(&mut harness, &[1]);
        let handle = ConnectionHandle(1);
        hub.on_packet(&mut harness.ctx(), handle, ClientMessage::MapLoaded);
        harness.update(&mut hub).expect("update should succeed");
        harness.outbox.clear();

        hub.on_packet(
            &mut harness.ctx(),
            handle,
            ClientMessage::JukeboxQueueSong { song_id: 42 },
        );
        harness.update(&mut hub).expect("update should succeed");

        let update = harness
            .outbox
            .messages_for(handle)
            .into_iter()
            .find_map(|message| match message {
                ServerMessage::UpdateService { body, .. } => Some(body.clone()),
                _ => None,
            })
            .expect("jukebox update should be sent");
        assert_eq!(update["nowPlaying"], 42);
    }

    #[test]
    fn match_found_transfers_member() {
        let mut harness = Harness::new();
        let mut hub = hub_with(&mut harness, &[1]);
        let destination = Destination::on_lane(LaneId(2), InstanceKey::Match(9));

        hub.on_control(
            &mut harness.ctx(),
            Some(ConnectionHandle(1)),
            &ControlMessage::MatchFound { destination },
        );
        hub.on_control(
            &mut harness.ctx(),
            Some(ConnectionHandle(5)),
            &ControlMessage::MatchFound { destination },
        );

        assert_eq!(
            harness.commands,
            vec![InstanceCommand::Transfer {
                handle: ConnectionHandle(1),
                destination
            }]
        );
    }

    #[test]
    fn announcement_reaches_everyone() {
        let mut harness = Harness::new();
        let mut hub = hub_with(&mut harness, &[1, 2]);
        harness.outbox.clear();
        hub.on_control(
            &mut harness.ctx(),
            None,
            &ControlMessage::Announcement {
                text: "maintenance".to_string(),
            },
        );
        assert_eq!(harness.outbox.len(), 2);
    }
}
