use config::{Config, ConfigError, Environment};
use serde::Deserialize;

use crate::hooks::IrqSource;
use crate::sink::NegativePolicy;

/// Analyzer configuration
#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct AnalyzerSettings {
    pub nr_cpus: Option<usize>,
    pub irq_source: Option<IrqSource>,
    pub negative_durations: Option<NegativePolicy>,
    pub log_samples: Option<bool>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct Settings {
    pub otel_exporter_otlp_endpoint: Option<String>,
    #[serde(default)]
    pub analyzer: AnalyzerSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let s = Config::builder()
            .add_source(Environment::default().separator("__").try_parsing(true))
            .build()?;

        let settings: Self = s.try_deserialize()?;
        log::debug!("Parsed settings: {:?}", settings);
        Ok(settings)
    }

    pub fn nr_cpus(&self) -> usize {
        self.analyzer.nr_cpus.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn irq_source(&self) -> IrqSource {
        self.analyzer.irq_source.unwrap_or_default()
    }

    pub fn negative_durations(&self) -> NegativePolicy {
        self.analyzer.negative_durations.unwrap_or_default()
    }

    pub fn log_samples(&self) -> bool {
        self.analyzer.log_samples.unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_load_settings() {
        dotenvy::dotenv().ok();

        unsafe {
            std::env::set_var("ANALYZER__NR_CPUS", "3");
            std::env::set_var("ANALYZER__IRQ_SOURCE", "vector");
            std::env::set_var("ANALYZER__NEGATIVE_DURATIONS", "clamp");
            std::env::set_var("ANALYZER__LOG_SAMPLES", "false");
        }

        let settings = Settings::new().expect("Failed to load settings");

        assert_eq!(settings.nr_cpus(), 3);
        assert_eq!(settings.irq_source(), IrqSource::Vector);
        assert_eq!(settings.negative_durations(), NegativePolicy::Clamp);
        assert!(!settings.log_samples());

        unsafe {
            std::env::remove_var("ANALYZER__NR_CPUS");
            std::env::remove_var("ANALYZER__IRQ_SOURCE");
            std::env::remove_var("ANALYZER__NEGATIVE_DURATIONS");
            std::env::remove_var("ANALYZER__LOG_SAMPLES");
        }
    }

    #[test]
    #[serial]
    fn test_rejects_unknown_policy() {
        unsafe {
            std::env::set_var("ANALYZER__NEGATIVE_DURATIONS", "ignore");
        }
        assert!(Settings::new().is_err());
        unsafe {
            std::env::remove_var("ANALYZER__NEGATIVE_DURATIONS");
        }
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert!(settings.nr_cpus() >= 1);
        assert_eq!(settings.irq_source(), IrqSource::Handler);
        assert_eq!(settings.negative_durations(), NegativePolicy::Keep);
        assert!(settings.log_samples());
    }
}
