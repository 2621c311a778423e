//! Network topology files.
//!
//! A topology is a YAML document with an optional protocol configuration,
//! optional physical-layer and CPU timing models, the node list and the links:
//!
//! ```yaml
//! config:
//!   participants: 4
//!   payload_len: 8
//! medium:
//!   capture_probability: 0.8
//! drift_std_ppm: 10.0
//! mesh_prr: 0.9          # every pair, unless overridden below
//! nodes:
//!   - { id: 1, initiator: true }
//!   - { id: 2, ppm: -12.5, boot_ms: 300 }
//!   - { id: 3 }
//! links:
//!   - { a: 1, b: 3, prr: 0.0 }
//! ```
//!
//! Links are symmetric. Nodes without an explicit drift get one drawn from a
//! normal distribution with standard deviation `drift_std_ppm`.

use crate::error::TopologyError;
use crate::hardware::TimingModel;
use crate::medium::MediumConfig;
use chaos_core::ChaosConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

fn default_prr() -> f64 {
    1.0
}

fn default_drift_std() -> f64 {
    10.0
}

/// One simulated node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: u16,
    #[serde(default)]
    pub initiator: bool,
    /// Clock drift in ppm; drawn at random when absent.
    #[serde(default)]
    pub ppm: Option<f64>,
    /// Boot time in milliseconds of simulation time.
    #[serde(default)]
    pub boot_ms: u64,
}

impl NodeSpec {
    pub fn new(id: u16) -> Self {
        NodeSpec {
            id,
            initiator: false,
            ppm: None,
            boot_ms: 0,
        }
    }
}

/// Symmetric link between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkSpec {
    pub a: u16,
    pub b: u16,
    /// Packet reception ratio.
    #[serde(default = "default_prr")]
    pub prr: f64,
}

/// A simulated network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub config: ChaosConfig,
    #[serde(default)]
    pub medium: MediumConfig,
    #[serde(default)]
    pub timing: TimingModel,
    /// Standard deviation of randomly drawn clock drifts.
    #[serde(default = "default_drift_std")]
    pub drift_std_ppm: f64,
    /// Reception ratio of every pair not listed in `links`.
    #[serde(default)]
    pub mesh_prr: Option<f64>,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub links: Vec<LinkSpec>,
}

impl Topology {
    /// Nodes `1..=count`, node 1 initiating, every pair linked with `prr`.
    pub fn full_mesh(config: ChaosConfig, count: u16, prr: f64) -> Self {
        Topology {
            mesh_prr: Some(prr),
            ..Self::unlinked(config, count)
        }
    }

    /// Nodes `1..=count` on a line, node 1 initiating at one end.
    pub fn line(config: ChaosConfig, count: u16, prr: f64) -> Self {
        let links = (1..count)
            .map(|id| LinkSpec {
                a: id,
                b: id + 1,
                prr,
            })
            .collect();
        Topology {
            links,
            ..Self::unlinked(config, count)
        }
    }

    fn unlinked(config: ChaosConfig, count: u16) -> Self {
        let nodes = (1..=count)
            .map(|id| NodeSpec {
                initiator: id == 1,
                ppm: Some(0.0),
                ..NodeSpec::new(id)
            })
            .collect();
        Topology {
            config,
            medium: MediumConfig::default(),
            timing: TimingModel::default(),
            drift_std_ppm: default_drift_std(),
            mesh_prr: None,
            nodes,
            links: Vec::new(),
        }
    }

    /// Parse and validate a topology document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, TopologyError> {
        let topology: Topology = serde_yaml::from_str(yaml)?;
        topology.validate()?;
        Ok(topology)
    }

    /// Read, parse and validate a topology file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TopologyError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| TopologyError::io(path, e))?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<(), TopologyError> {
        self.config.validate()?;
        if self.nodes.is_empty() {
            return Err(TopologyError::NoNodes);
        }

        let mut ids = BTreeSet::new();
        let mut initiator: Option<u16> = None;
        for node in &self.nodes {
            if !ids.insert(node.id) {
                return Err(TopologyError::DuplicateNode(node.id));
            }
            self.config.node_index(node.id)?;
            if node.initiator {
                if let Some(first) = initiator {
                    return Err(TopologyError::MultipleInitiators {
                        first,
                        second: node.id,
                    });
                }
                initiator = Some(node.id);
            }
        }
        if initiator.is_none() {
            return Err(TopologyError::NoInitiator);
        }

        for link in &self.links {
            for id in [link.a, link.b] {
                if !ids.contains(&id) {
                    return Err(TopologyError::UnknownNode(id));
                }
            }
            if link.a == link.b {
                return Err(TopologyError::SelfLink(link.a));
            }
            check_probability("link prr", link.prr)?;
        }
        if let Some(prr) = self.mesh_prr {
            check_probability("mesh_prr", prr)?;
        }
        check_probability("capture_probability", self.medium.capture_probability)?;
        check_probability("overrun_probability", self.timing.overrun_probability)?;
        if !self.drift_std_ppm.is_finite() || self.drift_std_ppm < 0.0 {
            return Err(TopologyError::InvalidProbability {
                what: "drift_std_ppm",
                value: self.drift_std_ppm,
            });
        }
        Ok(())
    }

    /// Identifier of the initiator.
    pub fn initiator(&self) -> Option<u16> {
        self.nodes.iter().find(|node| node.initiator).map(|node| node.id)
    }

    /// Reception ratio of every ordered pair that can hear each other.
    pub fn link_map(&self) -> BTreeMap<(u16, u16), f64> {
        let mut map = BTreeMap::new();
        if let Some(prr) = self.mesh_prr {
            for a in &self.nodes {
                for b in &self.nodes {
                    if a.id != b.id {
                        map.insert((a.id, b.id), prr);
                    }
                }
            }
        }
        for link in &self.links {
            map.insert((link.a, link.b), link.prr);
            map.insert((link.b, link.a), link.prr);
        }
        map.retain(|_, prr| *prr > 0.0);
        map
    }
}

fn check_probability(what: &'static str, value: f64) -> Result<(), TopologyError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(TopologyError::InvalidProbability { what, value })
    }
}
