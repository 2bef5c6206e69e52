//! Convolution layer configuration.
//!
//! [`ConvConfig`] is the structured form of a convolution parameter block:
//! kernel, stride, pad, group and bias settings plus the engine selector and
//! the layer mode. It can be built in code or loaded from TOML.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Convolution algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvEngine {
    /// Direct (sliding-window) convolution.
    Direct,
    /// Winograd transform convolution. Recognised, never accepted.
    Winograd,
}

impl std::fmt::Display for ConvEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Winograd => write!(f, "winograd"),
        }
    }
}

impl std::str::FromStr for ConvEngine {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "winograd" => Ok(Self::Winograd),
            other => Err(format!("unknown convolution engine: {other}")),
        }
    }
}

/// Whether the layer is a convolution or a transposed convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvMode {
    #[default]
    Convolution,
    /// Transposed convolution: forward and backward-data roles are swapped.
    Deconvolution,
}

/// Convolution layer configuration.
///
/// Two-element arrays are `[h, w]`. The operator only supports square
/// kernels with equal strides and pads on both axes; [`ConvConfig::validate`]
/// enforces this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvConfig {
    /// Number of filters (output channels).
    pub num_output: usize,
    /// Kernel extent `[h, w]`.
    pub kernel: [usize; 2],
    /// Stride `[h, w]`.
    pub stride: [usize; 2],
    /// Zero padding `[h, w]`.
    pub pad: [usize; 2],
    /// Number of filter groups.
    pub group: usize,
    /// Whether the layer learns a bias.
    pub bias_term: bool,
    /// Convolution engine.
    pub engine: ConvEngine,
    /// Apply ReLU after the bias and record gate decisions.
    pub fused_relu: bool,
    /// Convolution or deconvolution.
    pub mode: ConvMode,
}

impl Default for ConvConfig {
    fn default() -> Self {
        Self {
            num_output: 1,
            kernel: [1, 1],
            stride: [1, 1],
            pad: [0, 0],
            group: 1,
            bias_term: true,
            engine: ConvEngine::Direct,
            fused_relu: true,
            mode: ConvMode::Convolution,
        }
    }
}

impl ConvConfig {
    /// Square-kernel convolution with the given output count, kernel size,
    /// stride and pad. Other settings take their defaults.
    pub fn new(num_output: usize, kernel: usize, stride: usize, pad: usize) -> Self {
        Self {
            num_output,
            kernel: [kernel, kernel],
            stride: [stride, stride],
            pad: [pad, pad],
            ..Self::default()
        }
    }

    pub fn with_group(mut self, group: usize) -> Self {
        self.group = group;
        self
    }

    pub fn with_bias(mut self, bias_term: bool) -> Self {
        self.bias_term = bias_term;
        self
    }

    pub fn with_engine(mut self, engine: ConvEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_relu(mut self, fused_relu: bool) -> Self {
        self.fused_relu = fused_relu;
        self
    }

    pub fn with_mode(mut self, mode: ConvMode) -> Self {
        self.mode = mode;
        self
    }

    /// Edge length of the (square) kernel.
    pub fn kernel_size(&self) -> usize {
        self.kernel[0]
    }

    pub fn stride_size(&self) -> usize {
        self.stride[0]
    }

    pub fn pad_size(&self) -> usize {
        self.pad[0]
    }

    /// Load from a TOML string and validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let cfg: ConvConfig =
            toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a TOML file and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml(&contents)
    }

    /// Validate everything that does not depend on the input shape.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine != ConvEngine::Direct {
            return Err(ConfigError::UnsupportedEngine(self.engine.to_string()));
        }
        if self.kernel[0] != self.kernel[1] {
            return Err(ConfigError::NonSquare { what: "kernel", h: self.kernel[0], w: self.kernel[1] });
        }
        if self.stride[0] != self.stride[1] {
            return Err(ConfigError::NonSquare { what: "stride", h: self.stride[0], w: self.stride[1] });
        }
        if self.pad[0] != self.pad[1] {
            return Err(ConfigError::NonSquare { what: "pad", h: self.pad[0], w: self.pad[1] });
        }
        if self.kernel[0] == 0 {
            return Err(ConfigError::ZeroValue("kernel_size"));
        }
        if self.stride[0] == 0 {
            return Err(ConfigError::ZeroValue("stride"));
        }
        if self.group == 0 {
            return Err(ConfigError::ZeroValue("group"));
        }
        if self.num_output == 0 {
            return Err(ConfigError::ZeroValue("num_output"));
        }
        if self.num_output % self.group != 0 {
            return Err(ConfigError::GroupMismatch {
                which: "output",
                channels: self.num_output,
                groups: self.group,
            });
        }
        if self.mode == ConvMode::Deconvolution && self.group > 1 {
            return Err(ConfigError::GroupedDeconvolution { groups: self.group });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ConvConfig::default().validate().is_ok());
    }

    #[test]
    fn winograd_is_rejected_not_downgraded() {
        let cfg = ConvConfig::new(4, 3, 1, 1).with_engine(ConvEngine::Winograd);
        let err = cfg.validate().unwrap_err();
        assert_eq!(err, ConfigError::UnsupportedEngine("winograd".into()));
    }

    #[test]
    fn non_square_kernel_is_rejected() {
        let cfg = ConvConfig { kernel: [3, 5], ..ConvConfig::default() };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("kernel must be square"), "{err}");
    }

    #[test]
    fn unequal_stride_and_pad_are_rejected() {
        let cfg = ConvConfig { stride: [1, 2], ..ConvConfig::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::NonSquare { what: "stride", .. })));
        let cfg = ConvConfig { pad: [0, 1], ..ConvConfig::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::NonSquare { what: "pad", .. })));
    }

    #[test]
    fn zero_values_are_rejected() {
        assert_eq!(
            ConvConfig::new(4, 0, 1, 0).validate(),
            Err(ConfigError::ZeroValue("kernel_size"))
        );
        assert_eq!(ConvConfig::new(4, 3, 0, 0).validate(), Err(ConfigError::ZeroValue("stride")));
        assert_eq!(
            ConvConfig::new(4, 3, 1, 0).with_group(0).validate(),
            Err(ConfigError::ZeroValue("group"))
        );
    }

    #[test]
    fn output_channels_must_divide_by_group() {
        let err = ConvConfig::new(8, 3, 1, 1).with_group(3).validate().unwrap_err();
        assert_eq!(err, ConfigError::GroupMismatch { which: "output", channels: 8, groups: 3 });
    }

    #[test]
    fn grouped_deconvolution_is_rejected() {
        let cfg = ConvConfig::new(4, 3, 1, 1).with_group(2).with_mode(ConvMode::Deconvolution);
        assert_eq!(cfg.validate(), Err(ConfigError::GroupedDeconvolution { groups: 2 }));
    }

    #[test]
    fn from_toml_fills_defaults() {
        let cfg = ConvConfig::from_toml(
            r#"
num_output = 16
kernel = [3, 3]
pad = [1, 1]
"#,
        )
        .unwrap();
        assert_eq!(cfg.num_output, 16);
        assert_eq!(cfg.kernel_size(), 3);
        assert_eq!(cfg.stride_size(), 1);
        assert_eq!(cfg.pad_size(), 1);
        assert!(cfg.bias_term);
        assert!(cfg.fused_relu);
        assert_eq!(cfg.engine, ConvEngine::Direct);
        assert_eq!(cfg.mode, ConvMode::Convolution);
    }

    #[test]
    fn from_toml_rejects_winograd() {
        let err = ConvConfig::from_toml("num_output = 4\nengine = \"winograd\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedEngine(_)));
    }

    #[test]
    fn from_toml_reports_parse_errors() {
        let err = ConvConfig::from_toml("num_output = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn engine_parses_case_insensitively() {
        assert_eq!("DIRECT".parse::<ConvEngine>(), Ok(ConvEngine::Direct));
        assert_eq!("Winograd".parse::<ConvEngine>(), Ok(ConvEngine::Winograd));
        assert!("fft".parse::<ConvEngine>().is_err());
    }
}
