//! Resource offers.

use std::collections::BTreeMap;

use keel_id::{AgentId, OfferId};
use serde::{Deserialize, Serialize};

use super::resources::{Resource, ResourceName};

/// Free resources of one agent, valid for a single decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub agent_id: AgentId,
    pub hostname: String,
    pub attributes: BTreeMap<String, String>,
    pub resources: Vec<Resource>,
}

impl Offer {
    pub fn new(agent_id: AgentId, hostname: impl Into<String>, resources: Vec<Resource>) -> Self {
        Self {
            id: OfferId::new(),
            agent_id,
            hostname: hostname.into(),
            attributes: BTreeMap::new(),
            resources,
        }
    }

    /// Sum of a scalar resource across all roles and reservations.
    pub fn scalar_total(&self, name: ResourceName) -> f64 {
        self.resources
            .iter()
            .filter(|r| r.name == name)
            .map(|r| r.value.scalar())
            .sum()
    }

    pub fn has_gpus(&self) -> bool {
        self.scalar_total(ResourceName::Gpus) > 0.0
    }

    pub fn agent_info(&self) -> AgentInfo {
        AgentInfo {
            agent_id: self.agent_id,
            host: self.hostname.clone(),
            attributes: self.attributes.clone(),
        }
    }
}

/// Where an instance runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: AgentId,
    pub host: String,
    pub attributes: BTreeMap<String, String>,
}
