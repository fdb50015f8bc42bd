//! Wire envelopes exchanged between the controller and probe agents.
//!
//! Every envelope travels as one length-delimited frame holding a JSON
//! document (see [`codec`]). Three envelope kinds exist:
//!
//! ```text
//! agent ──AgentHello──────────► controller   (first frame on a connection)
//! agent ◄─ControllerCommand──── controller   (probe commands)
//! agent ──AgentProbeResult────► controller   (every later frame)
//! ```

pub mod codec;

use serde::{Deserialize, Serialize};

pub use codec::{ProtocolError, decode, encode, frame_codec};

/// Descriptive information an agent reports about itself at handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Network address the agent believes it is reachable at.
    #[serde(default)]
    pub address: String,
    /// Free-form human label (e.g. "fra-1").
    #[serde(default)]
    pub label: String,
}

/// The handshake envelope: the first frame an agent sends on a new
/// connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentHello {
    /// Agent-chosen identity, unique across the fleet.
    pub id: String,
    #[serde(default)]
    pub info: AgentInfo,
}

/// Transport used by the agent to measure latency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeProtocol {
    #[default]
    Tcp,
    Icmp,
}

fn default_count() -> u32 {
    1
}

/// A latency-probe command plus the correlation id of its eventual result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyRequest {
    /// Correlation id. Empty until the controller assigns one.
    #[serde(default)]
    pub result_id: String,
    /// Host to probe.
    pub host: String,
    /// Port to probe (ignored for ICMP).
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub protocol: ProbeProtocol,
    /// Number of samples the agent should take.
    #[serde(default = "default_count")]
    pub count: u32,
}

impl LatencyRequest {
    /// A single-sample TCP probe with no correlation id yet.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            result_id: String::new(),
            host: host.into(),
            port,
            protocol: ProbeProtocol::Tcp,
            count: default_count(),
        }
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }
}

/// Commands the controller sends to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerCommand {
    LatencyRequest { latency_request: LatencyRequest },
}

impl ControllerCommand {
    /// Correlation id carried by the command.
    pub fn result_id(&self) -> &str {
        match self {
            ControllerCommand::LatencyRequest { latency_request } => &latency_request.result_id,
        }
    }
}

/// One latency sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyDatapoint {
    pub sequence: u32,
    pub latency_ms: f64,
}

/// A result frame sent by an agent in answer to a [`LatencyRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProbeResult {
    /// Correlation id copied from the request.
    pub result_id: String,
    /// Identity of the reporting agent.
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub datapoints: Vec<LatencyDatapoint>,
    /// Set when the agent could not complete the measurement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentProbeResult {
    /// Mean latency across all datapoints, or `None` when there are none.
    pub fn mean_latency_ms(&self) -> Option<f64> {
        if self.datapoints.is_empty() {
            return None;
        }
        let total: f64 = self.datapoints.iter().map(|d| d.latency_ms).sum();
        Some(total / self.datapoints.len() as f64)
    }
}
