//! Deployment build records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An operator's opt-in to nightly builds
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledBuildPreference {
    pub enabled: bool,
    /// Deployment targets to build, e.g. `production`, `staging`
    #[serde(default)]
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorAccount {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub scheduled_builds: Option<ScheduledBuildPreference>,
}

impl OperatorAccount {
    /// Targets to build; empty unless scheduled builds are enabled
    pub fn scheduled_targets(&self) -> &[String] {
        match &self.scheduled_builds {
            Some(pref) if pref.enabled => &pref.targets,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildTrigger {
    Scheduled,
    Manual,
}

impl fmt::Display for BuildTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Payload of one build job on the deployment build topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    pub operator_id: String,
    pub target: String,
    pub requested_at: DateTime<Utc>,
    pub trigger: BuildTrigger,
}

impl BuildRequest {
    pub fn scheduled(
        operator_id: impl Into<String>,
        target: impl Into<String>,
        requested_at: DateTime<Utc>,
    ) -> Self {
        Self {
            operator_id: operator_id.into(),
            target: target.into(),
            requested_at,
            trigger: BuildTrigger::Scheduled,
        }
    }
}
