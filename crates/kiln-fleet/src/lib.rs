//! Host lifecycle, task assignment and fleet monitoring for Kiln.

pub mod assignment;
pub mod config;
pub mod manager;
pub mod monitor;

pub use assignment::TaskAssigner;
pub use config::FleetConfig;
pub use manager::HostManager;
pub use monitor::{FleetMonitor, MonitorReport};
