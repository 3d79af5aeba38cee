//! Per-request stable/canary assignment.
//!
//! Each request draws independently from a uniform `[0, 100)`; the draw never
//! looks at request content, so the realised split converges on the configured
//! percentage without any per-client stickiness.

use model_registry::{ModelRegistry, Stage};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ServeError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanaryConfig {
    pub model_name: String,
    pub stable_version: u32,
    pub canary_version: Option<u32>,
    pub canary_percentage: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arm {
    Stable,
    Canary,
}

impl Arm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arm::Stable => "stable",
            Arm::Canary => "canary",
        }
    }
}

impl fmt::Display for Arm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl CanaryConfig {
    pub fn stable_only(model_name: impl Into<String>, stable_version: u32) -> Self {
        Self { model_name: model_name.into(), stable_version, canary_version: None, canary_percentage: 0 }
    }

    /// Checks that need no registry access.
    pub fn validate(&self) -> Result<(), ServeError> {
        if self.canary_percentage > 100 {
            return Err(ServeError::InvalidConfig(format!("canary_percentage {} outside 0..=100", self.canary_percentage)));
        }
        if self.canary_percentage > 0 && self.canary_version.is_none() {
            return Err(ServeError::InvalidConfig(format!(
                "canary_percentage {} without a canary_version",
                self.canary_percentage
            )));
        }
        Ok(())
    }

    /// Full validation: the stable version must be the Production one and a
    /// canary must sit in Staging or Production.
    pub fn validate_against(&self, registry: &ModelRegistry) -> Result<(), ServeError> {
        self.validate()?;
        let stable = registry
            .get_version(&self.model_name, self.stable_version)
            .map_err(|e| ServeError::InvalidConfig(e.to_string()))?;
        if stable.stage != Stage::Production {
            return Err(ServeError::InvalidConfig(format!(
                "stable version {} is in stage {}, expected Production",
                self.stable_version, stable.stage
            )));
        }
        if let Some(v) = self.canary_version {
            let record = registry.get_version(&self.model_name, v).map_err(|e| ServeError::InvalidConfig(e.to_string()))?;
            if !matches!(record.stage, Stage::Staging | Stage::Production) {
                return Err(ServeError::InvalidConfig(format!(
                    "canary version {v} is in stage {}, expected Staging or Production",
                    record.stage
                )));
            }
        }
        Ok(())
    }
}

/// Picks the arm for one request using the thread-local generator.
pub fn route(config: &CanaryConfig) -> Arm { route_with(config, &mut rand::thread_rng()) }

/// 0 and 100 short-circuit without drawing.
pub fn route_with<R: Rng + ?Sized>(config: &CanaryConfig, rng: &mut R) -> Arm {
    match config.canary_percentage {
        0 => Arm::Stable,
        p if p >= 100 => Arm::Canary,
        p => {
            if rng.gen_range(0.0..100.0) < f64::from(p) { Arm::Canary } else { Arm::Stable }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model_registry::{Artifact, KNearestModel};
    use rand::{rngs::StdRng, SeedableRng};
    use std::collections::BTreeMap;

    fn cfg(pct: u32) -> CanaryConfig {
        CanaryConfig { model_name: "iris".into(), stable_version: 1, canary_version: Some(2), canary_percentage: pct }
    }

    #[test]
    fn zero_percent_is_always_stable() {
        let c = cfg(0);
        assert!((0..10_000).all(|_| route(&c) == Arm::Stable));
    }

    #[test]
    fn hundred_percent_is_always_canary() {
        let c = cfg(100);
        assert!((0..10_000).all(|_| route(&c) == Arm::Canary));
    }

    #[test]
    fn ten_percent_converges_within_one_point() {
        let c = cfg(10);
        let canary = (0..100_000).filter(|_| route(&c) == Arm::Canary).count();
        let share = canary as f64 / 100_000.0 * 100.0;
        assert!((share - 10.0).abs() < 1.0, "canary share {share}%");
    }

    #[test]
    fn seeded_draws_are_reproducible() {
        let c = cfg(37);
        let a: Vec<Arm> = { let mut r = StdRng::seed_from_u64(9); (0..64).map(|_| route_with(&c, &mut r)).collect() };
        let b: Vec<Arm> = { let mut r = StdRng::seed_from_u64(9); (0..64).map(|_| route_with(&c, &mut r)).collect() };
        assert_eq!(a, b);
    }

    #[test]
    fn out_of_range_or_orphan_percentages_are_rejected() {
        assert!(matches!(cfg(101).validate(), Err(ServeError::InvalidConfig(_))));
        let orphan = CanaryConfig { canary_version: None, ..cfg(5) };
        assert!(matches!(orphan.validate(), Err(ServeError::InvalidConfig(_))));
        assert!(CanaryConfig::stable_only("iris", 1).validate().is_ok());
    }

    #[test]
    fn canary_must_be_staged() {
        let reg = ModelRegistry::temporary().unwrap();
        let a = Artifact::KNearest(KNearestModel { classes: vec![0, 1], k: 1, points: vec![vec![0.0], vec![1.0]], targets: vec![0, 1] });
        for _ in 0..2 { reg.register("iris", &a, BTreeMap::new()).unwrap(); }
        reg.promote("iris", 1, Stage::Production).unwrap();
        assert!(matches!(cfg(10).validate_against(&reg), Err(ServeError::InvalidConfig(_))));
        reg.promote("iris", 2, Stage::Staging).unwrap();
        assert!(cfg(10).validate_against(&reg).is_ok());
        let missing = CanaryConfig { canary_version: Some(9), ..cfg(10) };
        assert!(missing.validate_against(&reg).is_err());
    }

    #[test]
    fn stable_must_be_in_production() {
        let reg = ModelRegistry::temporary().unwrap();
        let a = Artifact::KNearest(KNearestModel { classes: vec![0, 1], k: 1, points: vec![vec![0.0], vec![1.0]], targets: vec![0, 1] });
        for _ in 0..2 { reg.register("iris", &a, BTreeMap::new()).unwrap(); }
        assert!(matches!(CanaryConfig::stable_only("iris", 1).validate_against(&reg), Err(ServeError::InvalidConfig(_))));

        reg.promote("iris", 1, Stage::Production).unwrap();
        assert!(CanaryConfig::stable_only("iris", 1).validate_against(&reg).is_ok());

        reg.promote("iris", 2, Stage::Staging).unwrap();
        assert!(matches!(CanaryConfig::stable_only("iris", 2).validate_against(&reg), Err(ServeError::InvalidConfig(_))));

        // promoting 2 archives 1
        reg.promote("iris", 2, Stage::Production).unwrap();
        assert!(matches!(CanaryConfig::stable_only("iris", 1).validate_against(&reg), Err(ServeError::InvalidConfig(_))));
    }
}
