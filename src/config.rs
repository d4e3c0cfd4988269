use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::Serialize;

use crate::constants::{
    COORDINATOR_TICK_RATE, DEFAULT_LANE_COUNT, DEFAULT_MATCH_CONNECT_TIMEOUT_MS,
    DEFAULT_MATCH_DURATION_MS, DEFAULT_MAX_CLIENTS, DEFAULT_MAX_CONTRACT_VIOLATIONS,
    DEFAULT_MAX_PLACEMENT_ATTEMPTS, DEFAULT_PLACEMENT_TIMEOUT_MS, DEFAULT_QUEUE_CAPACITY,
    MAX_TICK_RATE, OUTBOUND_QUEUE_CAPACITY, TICK_RATE,
};
use crate::coordinator::{CoordinatorConfig, FirstLane, PlacementPolicy, RoundRobin};
use crate::error::ConfigError;
use crate::instance::InstanceSettings;
use crate::lane::LaneConfig;

/// Where authenticated sessions go first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerRole {
    /// Social hub; matches are hosted on the same process.
    Hub,
    /// Match-only server; accounts must have a pending match.
    Play,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlacementKind {
    FirstLane,
    RoundRobin,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Parser, Clone, Debug)]
#[command(author, version, about)]
pub struct ServerConfig {
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,
    #[arg(long, env = "MMO_ROLE", value_enum, default_value_t = ServerRole::Hub)]
    pub role: ServerRole,
    #[arg(long, env = "MMO_LANES", default_value_t = DEFAULT_LANE_COUNT)]
    pub lanes: usize,
    #[arg(long, env = "MMO_TICK_RATE", default_value_t = TICK_RATE)]
    pub tick_rate: u32,
    #[arg(long, env = "MMO_COORDINATOR_TICK_RATE", default_value_t = COORDINATOR_TICK_RATE)]
    pub coordinator_tick_rate: u32,
    #[arg(long, env = "MMO_MAX_CLIENTS", default_value_t = DEFAULT_MAX_CLIENTS)]
    pub max_clients: usize,
    #[arg(long, env = "MMO_QUEUE_CAPACITY", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,
    #[arg(long, env = "MMO_OUTBOUND_CAPACITY", default_value_t = OUTBOUND_QUEUE_CAPACITY)]
    pub outbound_capacity: usize,
    #[arg(long, env = "MMO_PLACEMENT_TIMEOUT_MS", default_value_t = DEFAULT_PLACEMENT_TIMEOUT_MS)]
    pub placement_timeout_ms: u64,
    #[arg(long, env = "MMO_MAX_PLACEMENT_ATTEMPTS", default_value_t = DEFAULT_MAX_PLACEMENT_ATTEMPTS)]
    pub max_placement_attempts: u32,
    #[arg(long, env = "MMO_MAX_CONTRACT_VIOLATIONS", default_value_t = DEFAULT_MAX_CONTRACT_VIOLATIONS)]
    pub max_contract_violations: u32,
    #[arg(long, env = "MMO_MATCH_DURATION_MS", default_value_t = DEFAULT_MATCH_DURATION_MS)]
    pub match_duration_ms: u64,
    #[arg(long, env = "MMO_MATCH_CONNECT_TIMEOUT_MS", default_value_t = DEFAULT_MATCH_CONNECT_TIMEOUT_MS)]
    pub match_connect_timeout_ms: u64,
    #[arg(long, env = "MMO_PLACEMENT", value_enum, default_value_t = PlacementKind::FirstLane)]
    pub placement: PlacementKind,
    #[arg(long, env = "MMO_SEED", default_value_t = 0)]
    pub seed: u64,
    #[arg(long, env = "MMO_LOG_FORMAT", value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,
    #[arg(long, env = "STATIC_DIR")]
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            role: ServerRole::Hub,
            lanes: DEFAULT_LANE_COUNT,
            tick_rate: TICK_RATE,
            coordinator_tick_rate: COORDINATOR_TICK_RATE,
            max_clients: DEFAULT_MAX_CLIENTS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            outbound_capacity: OUTBOUND_QUEUE_CAPACITY,
            placement_timeout_ms: DEFAULT_PLACEMENT_TIMEOUT_MS,
            max_placement_attempts: DEFAULT_MAX_PLACEMENT_ATTEMPTS,
            max_contract_violations: DEFAULT_MAX_CONTRACT_VIOLATIONS,
            match_duration_ms: DEFAULT_MATCH_DURATION_MS,
            match_connect_timeout_ms: DEFAULT_MATCH_CONNECT_TIMEOUT_MS,
            placement: PlacementKind::FirstLane,
            seed: 0,
            log_format: LogFormat::Compact,
            log_filter: "info".to_string(),
            static_dir: None,
        }
    }
}

fn check_tick_rate(name: &'static str, value: u32) -> Result<(), ConfigError> {
    if value == 0 || value > MAX_TICK_RATE {
        return Err(ConfigError::TickRate {
            name,
            value,
            max: MAX_TICK_RATE,
        });
    }
    Ok(())
}

fn check_nonzero(name: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Zero { name });
    }
    Ok(())
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lanes == 0 {
            return Err(ConfigError::NoLanes);
        }
        check_tick_rate("tick_rate", self.tick_rate)?;
        check_tick_rate("coordinator_tick_rate", self.coordinator_tick_rate)?;
        check_nonzero("max_clients", self.max_clients as u64)?;
        check_nonzero("queue_capacity", self.queue_capacity as u64)?;
        check_nonzero("outbound_capacity", self.outbound_capacity as u64)?;
        check_nonzero("placement_timeout_ms", self.placement_timeout_ms)?;
        check_nonzero("max_placement_attempts", u64::from(self.max_placement_attempts))?;
        check_nonzero("max_contract_violations", u64::from(self.max_contract_violations))?;
        check_nonzero("match_duration_ms", self.match_duration_ms)?;
        Ok(())
    }

    pub fn instance_settings(&self) -> InstanceSettings {
        InstanceSettings {
            max_clients: self.max_clients,
            max_contract_violations: self.max_contract_violations,
            match_duration_ms: self.match_duration_ms,
            match_connect_timeout_ms: self.match_connect_timeout_ms,
            seed: self.seed,
        }
    }

    pub fn lane_config(&self) -> LaneConfig {
        LaneConfig {
            tick_rate: self.tick_rate,
            max_clients: self.max_clients,
            queue_capacity: self.queue_capacity,
            instance: self.instance_settings(),
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            role: self.role,
            tick_rate: self.coordinator_tick_rate,
            max_clients: self.max_clients,
            queue_capacity: self.queue_capacity,
            placement_timeout_ms: self.placement_timeout_ms,
            max_placement_attempts: self.max_placement_attempts,
        }
    }

    pub fn placement_policy(&self) -> Box<dyn PlacementPolicy> {
        match self.placement {
            PlacementKind::FirstLane => Box::new(FirstLane),
            PlacementKind::RoundRobin => Box::new(RoundRobin::default()),
        }
    }
}
