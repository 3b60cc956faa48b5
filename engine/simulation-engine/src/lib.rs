//! # SimulationEngine
//!
//! Generates synthetic telemetry for simulated entities and devices and
//! dispatches it on configurable schedules to a context broker (NGSI v1/v2)
//! or to IoT agents (UltraLight/JSON over HTTP or MQTT).
//!
//! The controller wires schedule planning, backpressure-controlled dispatch,
//! the authentication token lifecycle and an optional deterministic
//! fast-forward virtual clock around a single per-run context, and exposes
//! one typed event feed plus `stop()`.

pub mod clock;
pub mod config;
pub mod context;
pub mod cron;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod jobs;
pub mod planner;
pub mod schedule;
pub mod simulation;
pub mod token;


pub use clock::SimClock;
pub use config::{
    AcceptAll, AttributeConfig, AuthenticationConfig, ConfigTranspiler, ConfigValidator,
    DeviceConfig, DomainConfig, EntityConfig, SimulationConfig,
};
pub use context::{RunContext, RunOptions};
pub use error::SimulationError;
pub use events::{EventFeed, SimulationEvent};
pub use schedule::{Schedule, ScheduleSpec};
pub use simulation::{Components, Simulation};
pub use token::{TokenFetcher, TokenGrant, TokenManager};

/// Current version of the simulation engine
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
