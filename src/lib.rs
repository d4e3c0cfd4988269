pub mod auth;
pub mod bot;
pub mod config;
pub mod constants;
pub mod coordinator;
pub mod error;
pub mod frame;
pub mod instance;
pub mod lane;
pub mod outbox;
pub mod protocol;
pub mod registry;
pub mod replication;
pub mod runtime;
pub mod scheduler;
pub mod telemetry;
pub mod transport;
pub mod types;
pub mod world;
