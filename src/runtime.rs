use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::auth::Authenticator;
use crate::config::{ServerConfig, ServerRole};
use crate::coordinator::{ControlSender, Coordinator, CoordinatorStats};
use crate::error::{ConfigError, RuntimeError};
use crate::lane::{Lane, LaneHandle, LaneStats};
use crate::scheduler::spawn_fixed_step;
use crate::transport::Transport;
use crate::types::{ConnectionHandle, LaneId};

/// The coordinator and every lane, wired together but not running. Tests and the
/// simulator drive it synchronously with [`Assembly::step`].
pub struct Assembly {
    pub coordinator: Coordinator,
    pub lanes: Vec<Lane>,
    pub lane_handles: Vec<LaneHandle>,
    pub control: ControlSender,
}

pub fn assemble(
    config: &ServerConfig,
    transport: Arc<dyn Transport>,
    auth: Box<dyn Authenticator>,
) -> Result<Assembly, ConfigError> {
    config.validate()?;
    let (events_tx, events_rx) = mpsc::channel(config.max_clients.saturating_mul(4).max(1));

    let mut lanes = Vec::with_capacity(config.lanes);
    let mut lane_handles = Vec::with_capacity(config.lanes);
    for index in 0..config.lanes {
        let (lane, handle) = Lane::new(
            LaneId(index),
            config.lane_config(),
            Arc::clone(&transport),
            events_tx.clone(),
        );
        lanes.push(lane);
        lane_handles.push(handle);
    }

    let (coordinator, control) = Coordinator::new(
        config.coordinator_config(),
        lane_handles.clone(),
        transport,
        auth,
        config.placement_policy(),
        events_rx,
    );
    Ok(Assembly {
        coordinator,
        lanes,
        lane_handles,
        control,
    })
}

impl Assembly {
    /// Coordinator tick, one tick of every lane, then another coordinator tick so the
    /// lanes' events are applied before returning.
    pub fn step(&mut self, now: Instant) {
        self.coordinator.tick(now);
        for lane in &mut self.lanes {
            lane.tick();
        }
        self.coordinator.tick(now);
    }

    /// Lanes that currently hold `handle` in their connection set.
    pub fn owners_of(&self, handle: ConnectionHandle) -> Vec<LaneId> {
        self.lanes
            .iter()
            .filter(|lane| lane.owns(handle))
            .map(|lane| lane.id())
            .collect()
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStatus {
    pub role: ServerRole,
    pub uptime_ms: u64,
    pub generated_at_iso: String,
    pub coordinator: CoordinatorStats,
    pub lanes: Vec<LaneStats>,
}

/// Running server core: one coordinator thread and one thread per lane.
pub struct Runtime {
    role: ServerRole,
    started_at: Instant,
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    control: ControlSender,
    lanes: Vec<LaneHandle>,
    coordinator_stats: Arc<Mutex<CoordinatorStats>>,
}

impl Runtime {
    pub fn start(
        config: &ServerConfig,
        transport: Arc<dyn Transport>,
        auth: Box<dyn Authenticator>,
    ) -> Result<Self, RuntimeError> {
        let Assembly {
            coordinator,
            lanes,
            lane_handles,
            control,
        } = assemble(config, transport, auth)?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let coordinator_stats = coordinator.stats_handle();

        let mut threads = Vec::with_capacity(lanes.len() + 1);
        let mut spawned = Ok(());
        for lane in lanes {
            let name = format!("lane-{}", lane.id().0);
            match spawn_fixed_step(name, config.tick_rate, Arc::clone(&shutdown), lane) {
                Ok(thread) => threads.push(thread),
                Err(err) => {
                    spawned = Err(err);
                    break;
                }
            }
        }
        if spawned.is_ok() {
            match spawn_fixed_step(
                "coordinator".to_string(),
                config.coordinator_tick_rate,
                Arc::clone(&shutdown),
                coordinator,
            ) {
                Ok(thread) => threads.push(thread),
                Err(err) => spawned = Err(err),
            }
        }

        let runtime = Self {
            role: config.role,
            started_at: Instant::now(),
            shutdown,
            threads,
            control,
            lanes: lane_handles,
            coordinator_stats,
        };
        if let Err(err) = spawned {
            runtime.shutdown();
            return Err(err);
        }
        info!(lanes = config.lanes, role = ?config.role, tick_rate = config.tick_rate, "runtime started");
        Ok(runtime)
    }

    pub fn control(&self) -> ControlSender {
        self.control.clone()
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    pub fn status(&self) -> RuntimeStatus {
        RuntimeStatus {
            role: self.role,
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            generated_at_iso: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            coordinator: self
                .coordinator_stats
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            lanes: self.lanes.iter().map(LaneHandle::stats).collect(),
        }
    }

    /// Raises the shutdown flag and joins every thread.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Release);
        for thread in self.threads {
            let name = thread.thread().name().unwrap_or("unnamed").to_string();
            if thread.join().is_err() {
                error!(thread = %name, "thread panicked");
            }
        }
        info!("runtime stopped");
    }
}
