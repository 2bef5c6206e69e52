//! Error taxonomy for the HWCN convolution operator.
//!
//! Configuration errors are raised eagerly at setup/reshape time and are fatal
//! to the layer. Kernel errors are raised at dispatch time and are never
//! retried: accelerator state after a failed launch is undefined.

use thiserror::Error;

/// Top-level error type.
#[derive(Error, Debug)]
pub enum HwcnError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Errors detected while validating a convolution configuration, an
/// accelerator topology, or the shapes they are applied to.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{which} channels ({channels}) must be divisible by group ({groups})")]
    GroupMismatch { which: &'static str, channels: usize, groups: usize },

    #[error(
        "kernel size {kernel} exceeds padded input extent {input} + 2*{pad} on the {axis} axis"
    )]
    KernelExceedsInput { axis: &'static str, input: usize, kernel: usize, pad: usize },

    #[error(
        "deconvolution of input extent {input} (kernel {kernel}, stride {stride}, pad {pad}) \
         produces an empty output on the {axis} axis"
    )]
    InvalidDeconvShape { axis: &'static str, input: usize, kernel: usize, stride: usize, pad: usize },

    #[error("convolution engine '{0}' is not supported; only 'direct' is implemented")]
    UnsupportedEngine(String),

    #[error("{what} must be square, got {h}x{w}")]
    NonSquare { what: &'static str, h: usize, w: usize },

    #[error("{0} must be > 0")]
    ZeroValue(&'static str),

    #[error("group convolution (group={groups}) is only supported in the forward pass")]
    GroupBackwardUnsupported { groups: usize },

    #[error("deconvolution does not support group > 1 (got {groups})")]
    GroupedDeconvolution { groups: usize },

    #[error("input channels changed from {expected} to {got}; weights are sized for {expected}")]
    ChannelMismatch { expected: usize, got: usize },

    #[error("expected a 4-D H x W x C x N shape, got {0:?}")]
    ShapeRank(Vec<usize>),

    #[error("shape {shape:?} holds {expected} elements, got {got} values")]
    DataLength { shape: Vec<usize>, expected: usize, got: usize },

    #[error(
        "processing_elements ({pe}) must not exceed burst_oc_limit ({limit})"
    )]
    BurstBelowPe { pe: usize, limit: usize },

    #[error("failed to read config file: {0}")]
    Io(String),

    #[error("failed to parse TOML: {0}")]
    Parse(String),

    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride { key: String, value: String, reason: String },
}

/// Errors raised by the kernel dispatcher and the buffers handed to it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("accelerator unavailable: {reason}")]
    DeviceUnavailable { reason: String },

    #[error("accelerator program build failed: {reason}")]
    ProgramBuild { reason: String },

    #[error("accelerator out of resources: {reason}")]
    OutOfResources { reason: String },

    #[error("kernel launch failed: {reason}")]
    LaunchFailed { reason: String },

    #[error("invalid kernel arguments: {reason}")]
    InvalidArguments { reason: String },

    #[error("kernel parameter '{field}' = {value} does not fit in a 32-bit word")]
    ParamOverflow { field: &'static str, value: i64 },
}

/// Result type used throughout the workspace.
pub type Result<T> = std::result::Result<T, HwcnError>;
