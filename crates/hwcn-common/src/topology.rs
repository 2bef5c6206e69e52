//! Accelerator topology used to size kernel tiling.
//!
//! Loads [`AcceleratorTopology`] from a TOML file with environment variable
//! overrides via `HWCN_*` prefixed variables. The surrounding framework
//! injects the resulting value at layer setup time.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Compute resources the accelerator program is compiled for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceleratorTopology {
    /// Number of compute units.
    /// Override: `HWCN_NUM_CU`
    pub compute_units: usize,

    /// Processing elements per compute unit.
    /// Override: `HWCN_NUM_PE`
    pub processing_elements: usize,

    /// Upper bound on output channels handled in one burst.
    /// Override: `HWCN_BURST_OC_LIMIT`
    pub burst_oc_limit: usize,

    /// Input channels are padded to a multiple of this value.
    /// Override: `HWCN_CHANNEL_MODULUS`
    pub channel_modulus: usize,
}

impl Default for AcceleratorTopology {
    fn default() -> Self {
        Self { compute_units: 2, processing_elements: 8, burst_oc_limit: 64, channel_modulus: 8 }
    }
}

const ENV_NUM_CU: &str = "HWCN_NUM_CU";
const ENV_NUM_PE: &str = "HWCN_NUM_PE";
const ENV_BURST_OC_LIMIT: &str = "HWCN_BURST_OC_LIMIT";
const ENV_CHANNEL_MODULUS: &str = "HWCN_CHANNEL_MODULUS";

impl AcceleratorTopology {
    pub fn new(
        compute_units: usize,
        processing_elements: usize,
        burst_oc_limit: usize,
        channel_modulus: usize,
    ) -> Self {
        Self { compute_units, processing_elements, burst_oc_limit, channel_modulus }
    }

    /// Generate a default topology TOML string.
    pub fn default_toml() -> String {
        // Four integer fields always serialize.
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml(&contents)
    }

    /// Load from a TOML string, then apply environment overrides.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut topo: AcceleratorTopology =
            toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
        topo.apply_env_overrides()?;
        topo.validate()?;
        Ok(topo)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut topo = Self::default();
        topo.apply_env_overrides()?;
        topo.validate()?;
        Ok(topo)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.compute_units == 0 {
            return Err(ConfigError::ZeroValue("compute_units"));
        }
        if self.processing_elements == 0 {
            return Err(ConfigError::ZeroValue("processing_elements"));
        }
        if self.burst_oc_limit == 0 {
            return Err(ConfigError::ZeroValue("burst_oc_limit"));
        }
        if self.channel_modulus == 0 {
            return Err(ConfigError::ZeroValue("channel_modulus"));
        }
        if self.processing_elements > self.burst_oc_limit {
            return Err(ConfigError::BurstBelowPe {
                pe: self.processing_elements,
                limit: self.burst_oc_limit,
            });
        }
        Ok(())
    }

    /// Apply `HWCN_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_usize(ENV_NUM_CU)? {
            self.compute_units = v;
        }
        if let Some(v) = env_usize(ENV_NUM_PE)? {
            self.processing_elements = v;
        }
        if let Some(v) = env_usize(ENV_BURST_OC_LIMIT)? {
            self.burst_oc_limit = v;
        }
        if let Some(v) = env_usize(ENV_CHANNEL_MODULUS)? {
            self.channel_modulus = v;
        }
        Ok(())
    }
}

fn env_usize(key: &'static str) -> Result<Option<usize>, ConfigError> {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<usize>().map(Some).map_err(|e| ConfigError::EnvOverride {
            key: key.into(),
            value: val.clone(),
            reason: e.to_string(),
        }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ALL_KEYS: [&str; 4] = [ENV_NUM_CU, ENV_NUM_PE, ENV_BURST_OC_LIMIT, ENV_CHANNEL_MODULUS];

    fn cleared() -> Vec<(&'static str, Option<&'static str>)> {
        ALL_KEYS.iter().map(|k| (*k, None)).collect()
    }

    #[test]
    fn test_default_topology_is_valid() {
        assert!(AcceleratorTopology::default().validate().is_ok());
    }

    #[test]
    #[serial(hwcn_env)]
    fn test_default_toml_round_trips() {
        temp_env::with_vars(cleared(), || {
            let topo = AcceleratorTopology::from_toml(&AcceleratorTopology::default_toml()).unwrap();
            assert_eq!(topo, AcceleratorTopology::default());
        });
    }

    #[test]
    #[serial(hwcn_env)]
    fn test_from_toml_partial_uses_defaults() {
        temp_env::with_vars(cleared(), || {
            let topo = AcceleratorTopology::from_toml("compute_units = 4\n").unwrap();
            assert_eq!(topo.compute_units, 4);
            assert_eq!(topo.processing_elements, 8);
        });
    }

    #[test]
    fn test_validation_rejects_zero_fields() {
        let topo = AcceleratorTopology::new(0, 8, 64, 8);
        assert_eq!(topo.validate(), Err(ConfigError::ZeroValue("compute_units")));
        let topo = AcceleratorTopology::new(2, 8, 64, 0);
        assert_eq!(topo.validate(), Err(ConfigError::ZeroValue("channel_modulus")));
    }

    #[test]
    fn test_validation_rejects_burst_below_pe() {
        let err = AcceleratorTopology::new(2, 16, 8, 8).validate().unwrap_err();
        assert!(err.to_string().contains("must not exceed burst_oc_limit"), "{err}");
    }

    #[test]
    #[serial(hwcn_env)]
    fn test_env_override_multiple_fields() {
        temp_env::with_vars(
            [
                (ENV_NUM_CU, Some("4")),
                (ENV_NUM_PE, Some("16")),
                (ENV_BURST_OC_LIMIT, Some("32")),
                (ENV_CHANNEL_MODULUS, Some("16")),
            ],
            || {
                let topo = AcceleratorTopology::from_env().unwrap();
                assert_eq!(topo, AcceleratorTopology::new(4, 16, 32, 16));
            },
        );
    }

    #[test]
    #[serial(hwcn_env)]
    fn test_env_override_invalid_value() {
        temp_env::with_vars(
            [
                (ENV_NUM_CU, Some("lots")),
                (ENV_NUM_PE, None),
                (ENV_BURST_OC_LIMIT, None),
                (ENV_CHANNEL_MODULUS, None),
            ],
            || {
                let err = AcceleratorTopology::from_env().unwrap_err();
                match err {
                    ConfigError::EnvOverride { key, value, .. } => {
                        assert_eq!(key, ENV_NUM_CU);
                        assert_eq!(value, "lots");
                    }
                    other => panic!("unexpected error: {other}"),
                }
            },
        );
    }

    #[test]
    #[serial(hwcn_env)]
    fn test_env_override_applied_after_toml() {
        temp_env::with_vars(
            [
                (ENV_NUM_CU, Some("8")),
                (ENV_NUM_PE, None),
                (ENV_BURST_OC_LIMIT, None),
                (ENV_CHANNEL_MODULUS, None),
            ],
            || {
                let topo = AcceleratorTopology::from_toml("compute_units = 2\n").unwrap();
                assert_eq!(topo.compute_units, 8);
            },
        );
    }
}
