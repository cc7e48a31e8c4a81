//! Per-node probing outcome

use super::geo::GeoRecord;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a node ended up in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    #[default]
    Pending,
    /// The kernel cannot run this node
    Incompatible,
    /// Converted, liveness not tested
    Converted,
    Alive,
    Dead,
    /// Alive and located
    Resolved,
    /// Alive but its egress could not be located
    Unknown,
}

impl NodeState {
    /// States no later stage moves a node out of.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Incompatible | Self::Dead | Self::Resolved | Self::Unknown)
    }

    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Alive | Self::Resolved | Self::Unknown)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Incompatible => "incompatible",
            Self::Converted => "converted",
            Self::Alive => "alive",
            Self::Dead => "dead",
            Self::Resolved => "resolved",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Result of probing one node
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProbeResult {
    pub state: NodeState,
    pub latency_ms: Option<u64>,
    pub geo: Option<GeoRecord>,
    /// Whether `geo` was served from the cache
    #[serde(default)]
    pub cached: bool,
}

impl ProbeResult {
    pub fn alive(&self) -> bool {
        self.state.is_alive()
    }

    pub fn incompatible() -> Self {
        Self {
            state: NodeState::Incompatible,
            ..Default::default()
        }
    }

    pub fn converted() -> Self {
        Self {
            state: NodeState::Converted,
            ..Default::default()
        }
    }

    pub fn measured(&mut self, latency_ms: Option<u64>) {
        self.latency_ms = latency_ms;
        self.state = if latency_ms.is_some() {
            NodeState::Alive
        } else {
            NodeState::Dead
        };
    }

    /// Record the geolocation outcome; `None` lands in the unknown bucket.
    pub fn located(&mut self, geo: Option<GeoRecord>) {
        match geo {
            Some(geo) if !geo.is_unknown() => {
                self.geo = Some(geo);
                self.state = NodeState::Resolved;
            }
            _ => {
                self.geo = Some(GeoRecord::unknown());
                self.state = NodeState::Unknown;
            }
        }
    }
}
