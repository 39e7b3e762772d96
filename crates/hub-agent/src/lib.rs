//! Process telemetry, restart detection and tunnel supervision for the
//! workspace hub.

pub mod cache;
pub mod compose;
pub mod config;
pub mod cpu;
pub mod detector;
pub mod error;
pub mod hub;
pub mod logs;
pub mod oracle;
pub mod support;
pub mod tunnel;

#[cfg(test)]
mod testing;

pub use cache::{CacheConfig, SnapshotCache};
pub use config::ConfigStore;
pub use cpu::{CpuSampler, PsSampler};
pub use detector::{ChangeDetector, EventBus};
pub use error::{HubError, HubResult};
pub use hub::Hub;
pub use oracle::{Pm2Oracle, ProcessOracle, StartSpec};
pub use tunnel::{TunnelConfig, TunnelManager, TunnelStart};
