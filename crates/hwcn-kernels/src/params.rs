//! Kernel launch parameters and their flattened word format.
//!
//! A [`KernelParams`] is flattened into [`PARAM_WORDS`] signed 32-bit words
//! before it is handed to the dispatcher. The word order below is the contract
//! between the host side and the device program in [`crate::kernels`].
//!
//! | word | field                | word | field            |
//! |------|----------------------|------|------------------|
//! | 0    | pass                 | 12   | stride           |
//! | 1    | groups               | 13   | pad (signed)     |
//! | 2    | num_images           | 14   | dilation         |
//! | 3    | in_y                 | 15   | num_cu           |
//! | 4    | in_x                 | 16   | num_pe           |
//! | 5    | in_channels          | 17   | burst_oc         |
//! | 6    | in_channels_padded   | 18   | work_per_cu      |
//! | 7    | out_y                | 19   | reduce_extent    |
//! | 8    | out_x                | 20   | weight_pad       |
//! | 9    | out_channels         | 21   | tag_mode         |
//! | 10   | out_channels_padded  | 22   | apply_bias       |
//! | 11   | ksize                |      |                  |

use hwcn_common::{KernelError, Result};
use std::fmt;

/// Number of words in a flattened parameter vector.
pub const PARAM_WORDS: usize = 23;

/// Which program entry a parameter set drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvPass {
    Forward,
    BackwardData,
    BackwardBias,
    BackwardWeights,
}

impl ConvPass {
    pub fn code(self) -> i32 {
        match self {
            Self::Forward => 0,
            Self::BackwardData => 1,
            Self::BackwardBias => 2,
            Self::BackwardWeights => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Forward),
            1 => Some(Self::BackwardData),
            2 => Some(Self::BackwardBias),
            3 => Some(Self::BackwardWeights),
            _ => None,
        }
    }

    /// Device program entry point for this pass.
    pub fn entry_point(self) -> &'static str {
        match self {
            Self::Forward | Self::BackwardData => "hwcn_correlate",
            Self::BackwardBias => "hwcn_backward_bias",
            Self::BackwardWeights => "hwcn_backward_weights",
        }
    }
}

impl fmt::Display for ConvPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forward => write!(f, "forward"),
            Self::BackwardData => write!(f, "backward-data"),
            Self::BackwardBias => write!(f, "backward-bias"),
            Self::BackwardWeights => write!(f, "backward-weights"),
        }
    }
}

/// How a launch treats the ReLU tag buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TagMode {
    /// Tags are neither read nor written.
    #[default]
    Ignore,
    /// Apply ReLU to the result and write one gate per output element.
    Record,
    /// Input reads at closed gates count as zero.
    MaskInput,
    /// Filter-operand reads at closed gates count as zero.
    MaskFilter,
}

impl TagMode {
    pub fn code(self) -> i32 {
        match self {
            Self::Ignore => 0,
            Self::Record => 1,
            Self::MaskInput => 2,
            Self::MaskFilter => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Ignore),
            1 => Some(Self::Record),
            2 => Some(Self::MaskInput),
            3 => Some(Self::MaskFilter),
            _ => None,
        }
    }
}

/// Launch parameters for one pass.
///
/// Channel counts are per group. `pad` is signed because the backward-data
/// pass pads by `K - 1 - pad`, which is negative when the forward pad
/// exceeds `K - 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelParams {
    pub pass: ConvPass,
    pub groups: usize,
    pub num_images: usize,
    pub in_y: usize,
    pub in_x: usize,
    pub in_channels: usize,
    pub in_channels_padded: usize,
    pub out_y: usize,
    pub out_x: usize,
    pub out_channels: usize,
    pub out_channels_padded: usize,
    pub ksize: usize,
    pub stride: usize,
    pub pad: isize,
    /// Input dilation: 1 for a plain correlation, the forward stride for
    /// backward-data.
    pub dilation: usize,
    pub num_cu: usize,
    pub num_pe: usize,
    /// Output channels processed per burst, a multiple of `num_pe`.
    pub burst_oc: usize,
    /// Share of the pass's work assigned to each compute unit: output rows
    /// (correlate), bias lanes (backward-bias) or weight elements
    /// (backward-weights).
    pub work_per_cu: usize,
    /// Number of terms summed per output element.
    pub reduce_extent: usize,
    /// Zero lanes appended to each filter row (`in_channels_padded - in_channels`).
    pub weight_pad: usize,
    pub tag_mode: TagMode,
    pub apply_bias: bool,
}

fn word(field: &'static str, value: i64) -> Result<i32> {
    i32::try_from(value).map_err(|_| KernelError::ParamOverflow { field, value }.into())
}

fn unsigned(field: &'static str, value: i32) -> Result<usize> {
    usize::try_from(value).map_err(|_| {
        KernelError::InvalidArguments { reason: format!("parameter '{field}' is negative: {value}") }
            .into()
    })
}

impl KernelParams {
    /// Same parameters with a different tag mode.
    pub fn with_tag_mode(&self, tag_mode: TagMode) -> Self {
        Self { tag_mode, ..self.clone() }
    }

    /// Same parameters with bias application switched on or off.
    pub fn with_bias(&self, apply_bias: bool) -> Self {
        Self { apply_bias, ..self.clone() }
    }

    /// Total input channels across groups.
    pub fn in_total(&self) -> usize {
        self.in_channels * self.groups
    }

    /// Total output channels across groups.
    pub fn out_total(&self) -> usize {
        self.out_channels * self.groups
    }

    /// Elements in the input activation buffer.
    pub fn input_len(&self) -> usize {
        self.in_y * self.in_x * self.in_total() * self.num_images
    }

    /// Elements in the output activation buffer.
    pub fn output_len(&self) -> usize {
        self.out_y * self.out_x * self.out_total() * self.num_images
    }

    /// Elements in a packed filter buffer `[out_total][K][K][in_channels_padded]`.
    pub fn packed_weight_len(&self) -> usize {
        self.out_total() * self.ksize * self.ksize * self.in_channels_padded
    }

    /// Offset of `(oc, ky, kx, c)` in a packed filter buffer.
    #[inline]
    pub fn packed_weight_offset(&self, oc: usize, ky: usize, kx: usize, c: usize) -> usize {
        ((oc * self.ksize + ky) * self.ksize + kx) * self.in_channels_padded + c
    }

    /// Output-channel bursts per group.
    pub fn oc_bursts(&self) -> usize {
        if self.burst_oc == 0 { 0 } else { self.out_channels_padded / self.burst_oc }
    }

    /// Elements the pass writes to its output slot.
    pub fn output_buffer_len(&self) -> usize {
        match self.pass {
            ConvPass::Forward | ConvPass::BackwardData => self.output_len(),
            ConvPass::BackwardBias => self.out_total(),
            ConvPass::BackwardWeights => self.packed_weight_len(),
        }
    }

    /// Elements the pass reads from its filter slot. Backward-weights binds
    /// the conv-output gradient there; backward-bias reads no filter.
    pub fn filter_buffer_len(&self) -> usize {
        match self.pass {
            ConvPass::Forward | ConvPass::BackwardData => self.packed_weight_len(),
            ConvPass::BackwardBias => 0,
            ConvPass::BackwardWeights => self.output_len(),
        }
    }

    /// Elements of the tag buffer the pass touches.
    pub fn tag_buffer_len(&self) -> usize {
        match self.tag_mode {
            TagMode::Ignore => 0,
            TagMode::Record | TagMode::MaskFilter => self.output_len(),
            TagMode::MaskInput => self.input_len(),
        }
    }

    /// Check that every buffer the pass indexes fits the device program's
    /// 32-bit `int` offsets.
    pub fn check_extents(&self) -> Result<()> {
        let product = |factors: &[usize]| factors.iter().fold(1usize, |acc, &f| acc.saturating_mul(f));
        let groups = self.groups;
        let input = product(&[self.in_y, self.in_x, self.in_channels, groups, self.num_images]);
        let output = product(&[self.out_y, self.out_x, self.out_channels, groups, self.num_images]);
        let weights =
            product(&[self.out_channels, groups, self.ksize, self.ksize, self.in_channels_padded]);
        let tags = match self.tag_mode {
            TagMode::Ignore => 0,
            TagMode::Record | TagMode::MaskFilter => output,
            TagMode::MaskInput => input,
        };
        for (field, len) in [
            ("input_len", input),
            ("output_len", output),
            ("packed_weight_len", weights),
            ("tag_buffer_len", tags),
        ] {
            word(field, i64::try_from(len).unwrap_or(i64::MAX))?;
        }
        Ok(())
    }

    /// Flatten into the device word vector. Fails when a field or a buffer
    /// extent does not fit in an `i32`.
    pub fn to_words(&self) -> Result<Vec<i32>> {
        let u = |field: &'static str, v: usize| word(field, v as i64);
        let words = vec![
            self.pass.code(),
            u("groups", self.groups)?,
            u("num_images", self.num_images)?,
            u("in_y", self.in_y)?,
            u("in_x", self.in_x)?,
            u("in_channels", self.in_channels)?,
            u("in_channels_padded", self.in_channels_padded)?,
            u("out_y", self.out_y)?,
            u("out_x", self.out_x)?,
            u("out_channels", self.out_channels)?,
            u("out_channels_padded", self.out_channels_padded)?,
            u("ksize", self.ksize)?,
            u("stride", self.stride)?,
            word("pad", self.pad as i64)?,
            u("dilation", self.dilation)?,
            u("num_cu", self.num_cu)?,
            u("num_pe", self.num_pe)?,
            u("burst_oc", self.burst_oc)?,
            u("work_per_cu", self.work_per_cu)?,
            u("reduce_extent", self.reduce_extent)?,
            u("weight_pad", self.weight_pad)?,
            self.tag_mode.code(),
            i32::from(self.apply_bias),
        ];
        self.check_extents()?;
        Ok(words)
    }

    /// Decode a device word vector.
    pub fn from_words(words: &[i32]) -> Result<Self> {
        if words.len() != PARAM_WORDS {
            return Err(KernelError::InvalidArguments {
                reason: format!("expected {PARAM_WORDS} parameter words, got {}", words.len()),
            }
            .into());
        }
        let pass = ConvPass::from_code(words[0]).ok_or_else(|| KernelError::InvalidArguments {
            reason: format!("unknown pass code {}", words[0]),
        })?;
        let tag_mode = TagMode::from_code(words[21]).ok_or_else(|| {
            KernelError::InvalidArguments { reason: format!("unknown tag mode {}", words[21]) }
        })?;
        Ok(Self {
            pass,
            groups: unsigned("groups", words[1])?,
            num_images: unsigned("num_images", words[2])?,
            in_y: unsigned("in_y", words[3])?,
            in_x: unsigned("in_x", words[4])?,
            in_channels: unsigned("in_channels", words[5])?,
            in_channels_padded: unsigned("in_channels_padded", words[6])?,
            out_y: unsigned("out_y", words[7])?,
            out_x: unsigned("out_x", words[8])?,
            out_channels: unsigned("out_channels", words[9])?,
            out_channels_padded: unsigned("out_channels_padded", words[10])?,
            ksize: unsigned("ksize", words[11])?,
            stride: unsigned("stride", words[12])?,
            pad: words[13] as isize,
            dilation: unsigned("dilation", words[14])?,
            num_cu: unsigned("num_cu", words[15])?,
            num_pe: unsigned("num_pe", words[16])?,
            burst_oc: unsigned("burst_oc", words[17])?,
            work_per_cu: unsigned("work_per_cu", words[18])?,
            reduce_extent: unsigned("reduce_extent", words[19])?,
            weight_pad: unsigned("weight_pad", words[20])?,
            tag_mode,
            apply_bias: words[22] != 0,
        })
    }
}

impl fmt::Display for KernelParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}x{}x{}(+{})x{} -> {}x{}x{}x{} k={} s={} p={} d={} g={} cu={} pe={} burst={} work/cu={}",
            self.pass,
            self.in_y,
            self.in_x,
            self.in_channels,
            self.weight_pad,
            self.num_images,
            self.out_y,
            self.out_x,
            self.out_channels,
            self.num_images,
            self.ksize,
            self.stride,
            self.pad,
            self.dilation,
            self.groups,
            self.num_cu,
            self.num_pe,
            self.burst_oc,
            self.work_per_cu,
        )
    }
}
