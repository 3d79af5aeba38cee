use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Lifecycle stage of a registered version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage { None, Staging, Production, Archived }

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::None => "None",
            Stage::Staging => "Staging",
            Stage::Production => "Production",
            Stage::Archived => "Archived",
        })
    }
}

impl FromStr for Stage {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Stage::None),
            "staging" => Ok(Stage::Staging),
            "production" => Ok(Stage::Production),
            "archived" => Ok(Stage::Archived),
            other => Err(format!("unknown stage {other}")),
        }
    }
}

/// Opaque handle to an artifact blob held by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef(pub String);

impl ArtifactRef {
    pub fn for_version(name: &str, version: u32) -> Self { Self(format!("models/{name}/{version}")) }
}

/// Registry record. Only `stage` ever changes after creation, and only through `promote`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub name: String,
    pub version: u32,
    pub stage: Stage,
    pub artifact_ref: ArtifactRef,
    pub algorithm: String,
    pub metrics: BTreeMap<String, f64>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_parses_case_insensitively() {
        assert_eq!("production".parse::<Stage>().unwrap(), Stage::Production);
        assert_eq!("Staging".parse::<Stage>().unwrap(), Stage::Staging);
        assert!("live".parse::<Stage>().is_err());
        assert_eq!(Stage::Archived.to_string(), "Archived");
    }
}
