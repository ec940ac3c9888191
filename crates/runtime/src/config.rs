//! Controller configuration.
//!
//! Every section has a default, so a partial YAML file only needs the
//! values it changes.

use std::path::Path;

use ballast_pipeline::SchedulerConfig;
use ballast_safety::SafetyConfig;
use ballast_shed::{
    AiConfig, DensityConfig, DeviceConfig, ExplosionConfig, HorizonConfig, MergeConfig,
    ParticleConfig, ProjectileConfig, RecentConfig, ThroughputConfig, VisibilityConfig,
};
use ballast_telemetry::{ScaleConfig, TelemetryConfig};
use serde::{Deserialize, Serialize};

/// Errors from loading or writing configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub scheduler: SchedulerConfig,
    pub telemetry: TelemetryConfig,
    pub scale: ScaleConfig,
    pub device: DeviceConfig,
    pub particle: ParticleConfig,
    pub density: DensityConfig,
    pub explosion: ExplosionConfig,
    pub ai: AiConfig,
    pub projectile: ProjectileConfig,
    pub visibility: VisibilityConfig,
    pub merge: MergeConfig,
    pub throughput: ThroughputConfig,
    pub horizon: HorizonConfig,
    pub recent: RecentConfig,
    pub safety: SafetyConfig,
    /// Period of the statistics report. 0 disables it.
    pub stats_period_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            telemetry: TelemetryConfig::default(),
            scale: ScaleConfig::default(),
            device: DeviceConfig::default(),
            particle: ParticleConfig::default(),
            density: DensityConfig::default(),
            explosion: ExplosionConfig::default(),
            ai: AiConfig::default(),
            projectile: ProjectileConfig::default(),
            visibility: VisibilityConfig::default(),
            merge: MergeConfig::default(),
            throughput: ThroughputConfig::default(),
            horizon: HorizonConfig::default(),
            recent: RecentConfig::default(),
            safety: SafetyConfig::default(),
            stats_period_ms: 60_000,
        }
    }
}

impl ControllerConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        std::fs::write(path, self.to_yaml_string()?)?;
        Ok(())
    }

    /// Reject settings no subsystem can run with. Out-of-range tuning values
    /// are clamped where they are used instead.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.min_threshold > self.device.max_threshold {
            return Err(ConfigError::Invalid(format!(
                "device.min_threshold {} exceeds device.max_threshold {}",
                self.device.min_threshold, self.device.max_threshold
            )));
        }
        let safety = &self.safety;
        if !(safety.warn_mspt <= safety.countdown_mspt && safety.countdown_mspt <= safety.immediate_mspt) {
            return Err(ConfigError::Invalid(
                "safety tiers must satisfy warn <= countdown <= immediate".into(),
            ));
        }
        if self.scale.period_ms == 0 {
            return Err(ConfigError::Invalid("scale.period_ms must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = ControllerConfig::from_yaml_str(
            "device:\n  min_threshold: 3\nsafety:\n  countdown_secs: 30\n",
        )
        .unwrap();
        assert_eq!(config.device.min_threshold, 3);
        assert_eq!(config.device.max_threshold, 20);
        assert_eq!(config.safety.countdown_secs, 30);
        assert_eq!(config.safety.warn_mspt, 92.0);
        assert_eq!(config.throughput.base_limit, 64);
    }

    #[test]
    fn empty_document_is_the_default() {
        let config = ControllerConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config.scale.period_ms, 2_000);
        assert_eq!(config.stats_period_ms, 60_000);
    }

    #[test]
    fn yaml_round_trip_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ballast.yaml");
        let mut config = ControllerConfig::default();
        config.merge.item_radius = 5.0;
        config.save(&path).unwrap();
        let loaded = ControllerConfig::load(&path).unwrap();
        assert_eq!(loaded.merge.item_radius, 5.0);
    }

    #[test]
    fn load_reports_missing_file_and_bad_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let missing = ControllerConfig::load(&dir.path().join("absent.yaml"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));

        let path = dir.path().join("broken.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "device: [not, a, map]").unwrap();
        assert!(matches!(ControllerConfig::load(&path), Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn inverted_tiers_are_rejected() {
        let err = ControllerConfig::from_yaml_str("safety:\n  warn_mspt: 300\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let err = ControllerConfig::from_yaml_str("device:\n  min_threshold: 50\n").unwrap_err();
        assert!(err.to_string().contains("min_threshold"));
    }
}
