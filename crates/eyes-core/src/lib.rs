//! Controller engine for a fleet of remote latency-probe agents.
//!
//! Agents dial in over TCP, identify themselves with a handshake frame, and
//! stay connected. The [`Controller`] sends them probe commands and
//! correlates the results that come back, either to a one-shot callback,
//! to a waiting future, or to every registered listener.

pub mod acceptor;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod id;
pub mod pending;
pub mod protocol;
pub mod registry;
pub mod session;

pub use config::ControllerConfig;
pub use controller::{Controller, ControllerError, version};
pub use id::{IdGenerator, UuidGenerator};
pub use protocol::{
    AgentHello, AgentInfo, AgentProbeResult, ControllerCommand, LatencyDatapoint, LatencyRequest,
    ProbeProtocol,
};
pub use session::AgentSummary;
