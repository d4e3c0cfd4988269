//! Scripted client used by the simulator and integration tests. Speaks the wire
//! protocol through a [`MemoryTransport`] and checks what the server replicates.

use std::collections::HashSet;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use tracing::debug;

use crate::protocol::{encode_client_message, ClientMessage, FrameDecoder};
use crate::transport::MemoryTransport;
use crate::types::{ConnectionHandle, InstanceKey, LocalId, Transform, Vec3};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BotPhase {
    Connecting,
    Authenticated,
    Loading,
    Playing,
    Closed,
}

pub struct Bot {
    handle: ConnectionHandle,
    nickname: String,
    transport: Arc<MemoryTransport>,
    decoder: FrameDecoder,
    rng: StdRng,
    phase: BotPhase,
    account_id: Option<u64>,
    session_token: Option<String>,
    instance: Option<InstanceKey>,
    self_id: Option<LocalId>,
    known: HashSet<u32>,
    position: Vec3,
    instances_entered: u32,
    messages_received: u64,
    chats_received: u64,
    notices: Vec<String>,
    anomalies: Vec<String>,
}

impl Bot {
    /// Opens a connection and sends `Hello`.
    pub fn connect(transport: Arc<MemoryTransport>, nickname: &str, seed: u64) -> Self {
        let handle = transport.open();
        let mut bot = Self {
            handle,
            nickname: nickname.to_string(),
            transport,
            decoder: FrameDecoder::new(),
            rng: StdRng::seed_from_u64(seed),
            phase: BotPhase::Connecting,
            account_id: None,
            session_token: None,
            instance: None,
            self_id: None,
            known: HashSet::new(),
            position: Vec3::ZERO,
            instances_entered: 0,
            messages_received: 0,
            chats_received: 0,
            notices: Vec::new(),
            anomalies: Vec::new(),
        };
        bot.send(&ClientMessage::Hello {
            nickname: bot.nickname.clone(),
            leader_class: 1,
            session_token: None,
        });
        bot
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn phase(&self) -> BotPhase {
        self.phase
    }

    pub fn account_id(&self) -> Option<u64> {
        self.account_id
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    pub fn instance(&self) -> Option<InstanceKey> {
        self.instance
    }

    pub fn known_entities(&self) -> usize {
        self.known.len()
    }

    pub fn instances_entered(&self) -> u32 {
        self.instances_entered
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received
    }

    pub fn chats_received(&self) -> u64 {
        self.chats_received
    }

    pub fn notices(&self) -> &[String] {
        &self.notices
    }

    pub fn anomalies(&self) -> &[String] {
        &self.anomalies
    }

    pub fn send(&mut self, message: &ClientMessage) {
        if self.phase == BotPhase::Closed {
            return;
        }
        match encode_client_message(message) {
            Ok(bytes) => {
                if !self.transport.client_send(self.handle, &bytes) {
                    self.phase = BotPhase::Closed;
                }
            }
            Err(err) => self.anomalies.push(format!("encode failed: {err}")),
        }
    }

    pub fn close(&mut self) {
        self.transport.client_close(self.handle);
        self.phase = BotPhase::Closed;
    }

    /// Drains everything the server sent since the last call.
    pub fn poll(&mut self) {
        for bytes in self.transport.client_receive(self.handle) {
            if let Err(err) = self.decoder.extend(&bytes) {
                self.anomalies.push(format!("server stream overflow: {err}"));
                return;
            }
        }
        loop {
            match self.decoder.next_frame() {
                Ok(Some(frame)) => match serde_json::from_slice::<Value>(&frame.payload) {
                    Ok(body) => self.on_message(&body),
                    Err(err) => self
                        .anomalies
                        .push(format!("net id {} carried invalid json: {err}", frame.net_id)),
                },
                Ok(None) => break,
                Err(err) => {
                    self.anomalies.push(format!("bad server frame: {err}"));
                    break;
                }
            }
        }
        if self.phase != BotPhase::Closed && !self.transport.is_open(self.handle) {
            self.phase = BotPhase::Closed;
        }
    }

    fn on_message(&mut self, body: &Value) {
        self.messages_received += 1;
        let kind = body.get("type").and_then(Value::as_str).unwrap_or_default();
        match kind {
            "auth_accepted" => {
                self.account_id = body.get("account_id").and_then(Value::as_u64);
                self.session_token = body
                    .get("session_token")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                self.phase = BotPhase::Authenticated;
            }
            "auth_rejected" => self.phase = BotPhase::Closed,
            "enter_instance" => {
                let instance = body
                    .get("instance")
                    .cloned()
                    .and_then(|value| serde_json::from_value::<InstanceKey>(value).ok());
                debug!(handle = %self.handle, ?instance, "bot entering instance");
                self.instance = instance;
                self.instances_entered += 1;
                self.known.clear();
                self.self_id = None;
                self.phase = BotPhase::Loading;
                self.send(&ClientMessage::MapLoaded);
            }
            "initial_frame_complete" => self.send(&ClientMessage::LoadingComplete),
            "loading_complete" => self.phase = BotPhase::Playing,
            "spawn_avatar" | "spawn_npc" | "spawn_prop" | "spawn_service" => {
                let Some(local_id) = local_id_of(body) else {
                    self.anomalies.push(format!("{kind} without local_id"));
                    return;
                };
                if !self.known.insert(local_id) {
                    self.anomalies
                        .push(format!("{kind} for local id {local_id} that is still alive"));
                }
                if body.get("is_self").and_then(Value::as_bool) == Some(true) {
                    self.self_id = Some(LocalId(local_id));
                }
            }
            "destroy" => {
                let Some(local_id) = local_id_of(body) else {
                    self.anomalies.push("destroy without local_id".to_string());
                    return;
                };
                if !self.known.remove(&local_id) {
                    self.anomalies
                        .push(format!("destroy for unknown local id {local_id}"));
                }
            }
            "update_transform" | "update_action" | "update_service" => {
                let Some(local_id) = local_id_of(body) else {
                    self.anomalies.push(format!("{kind} without local_id"));
                    return;
                };
                if !self.known.contains(&local_id) {
                    self.anomalies
                        .push(format!("{kind} for unknown local id {local_id}"));
                }
            }
            // The hub is about to hand us over; stop driving the old avatar.
            "match_found" => self.phase = BotPhase::Authenticated,
            "chat" => self.chats_received += 1,
            "system_notice" => {
                if let Some(text) = body.get("text").and_then(Value::as_str) {
                    self.notices.push(text.to_string());
                }
            }
            "error" => debug!(handle = %self.handle, body = %body, "server reported error"),
            _ => {}
        }
    }

    /// One client frame of scripted behaviour: wander, and now and then say something.
    pub fn act(&mut self, tick: u64) {
        if self.phase != BotPhase::Playing {
            return;
        }
        let Some(self_id) = self.self_id else {
            return;
        };
        let step = Vec3::new(
            self.rng.random_range(-2.0..2.0),
            0.0,
            self.rng.random_range(-2.0..2.0),
        );
        self.position = Vec3::new(
            (self.position.x + step.x).clamp(-150.0, 150.0),
            0.0,
            (self.position.z + step.z).clamp(-150.0, 150.0),
        );
        self.send(&ClientMessage::UpdatePosition {
            local_id: self_id,
            transform: Transform {
                pos: self.position,
                dir: Vec3::new(0.0, 0.0, 1.0),
                rotate: 0.0,
                speed: 2.0,
            },
        });
        if tick % 50 == 0 && self.rng.random_bool(0.3) {
            let text = format!("{} says hi at {tick}", self.nickname);
            self.send(&ClientMessage::Chat { text });
        }
    }
}

fn local_id_of(body: &Value) -> Option<u32> {
    body.get("local_id")
        .and_then(Value::as_u64)
        .and_then(|raw| u32::try_from(raw).ok())
}
