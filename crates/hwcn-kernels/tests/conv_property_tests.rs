//! Property tests for shape arithmetic, weight packing and launch planning.
//!
//! Invariants covered:
//!
//! 1. **Output shape** – `floor((in + 2p - k) / s) + 1`, and rejection when
//!    the kernel is larger than the padded input.
//! 2. **Group split** – succeeds exactly when both channel counts divide.
//! 3. **Weight packing** – pack then unpack restores f16-exact filters
//!    exactly, any f32 filter to within half-precision rounding, and leaves
//!    every pad lane zero.
//! 4. **Spatial flip** – an involution.
//! 5. **Planner** – bursts, padding and work coverage for any topology.
//! 6. **Forward** – the layer agrees with a direct f32 convolution.

mod support;

use hwcn_kernels::convert::{flip_spatial, to_compact_half_weights, to_general_weights};
use hwcn_kernels::{
    AcceleratorTopology, Blob, ConfigError, ConvConfig, ConvGeometry, ConvLayer, HwcnShape,
    KernelPlanner, ReferenceDispatcher, compute_output_shape, split_groups,
};
use proptest::prelude::*;
use support::naive::relu;
use support::{ConvDims, assert_close, pattern};

fn topology_strategy() -> impl Strategy<Value = AcceleratorTopology> {
    (1usize..5, 1usize..9, 0usize..64, 1usize..9).prop_map(|(cu, pe, extra, modulus)| {
        AcceleratorTopology::new(cu, pe, pe + extra, modulus)
    })
}

// ---------------------------------------------------------------------------
// Properties: output shape
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn prop_output_shape_follows_formula(
        in_h in 1usize..40,
        in_w in 1usize..40,
        k in 1usize..8,
        stride in 1usize..5,
        pad in 0usize..4,
    ) {
        let result = compute_output_shape(in_h, in_w, k, stride, pad);
        if in_h + 2 * pad >= k && in_w + 2 * pad >= k {
            let (out_h, out_w) = result.unwrap();
            prop_assert_eq!(out_h, (in_h + 2 * pad - k) / stride + 1);
            prop_assert_eq!(out_w, (in_w + 2 * pad - k) / stride + 1);
            prop_assert!(out_h >= 1 && out_w >= 1);
        } else {
            let is_kernel_error = matches!(result, Err(ConfigError::KernelExceedsInput { .. }));
            prop_assert!(is_kernel_error);
        }
    }
}

// ---------------------------------------------------------------------------
// Properties: group split
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn prop_group_split_requires_divisibility(
        in_c in 1usize..64,
        out_c in 1usize..64,
        groups in 1usize..9,
    ) {
        match split_groups(in_c, out_c, groups) {
            Ok(split) => {
                prop_assert_eq!(split.in_per_group * groups, in_c);
                prop_assert_eq!(split.out_per_group * groups, out_c);
            }
            Err(ConfigError::GroupMismatch { .. }) => {
                prop_assert!(in_c % groups != 0 || out_c % groups != 0);
            }
            Err(other) => prop_assert!(false, "unexpected error {other}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Properties: weight packing
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn prop_pack_then_unpack_restores_filters(
        topology in topology_strategy(),
        out_c in 1usize..10,
        in_c in 1usize..10,
        k in 1usize..4,
        seed in 0usize..17,
    ) {
        let config = ConvConfig::new(out_c, k, 1, 0);
        let geometry = ConvGeometry::resolve(&config, HwcnShape::new(4, 4, in_c, 1)).unwrap();
        let plan = KernelPlanner::new(topology).unwrap().plan(&geometry).unwrap();
        let params = &plan.forward;

        let shape = geometry.weight_shape();
        let weights = pattern(shape.iter().product(), seed, 0.125);
        let packed = to_compact_half_weights(&weights, params).unwrap();
        prop_assert_eq!(packed.len(), params.packed_weight_len());

        let restored = to_general_weights(&packed, &shape, params).unwrap();
        prop_assert_eq!(&restored, &weights);

        for oc in 0..out_c {
            for ky in 0..k {
                for kx in 0..k {
                    for c in in_c..params.in_channels_padded {
                        let lane = packed[params.packed_weight_offset(oc, ky, kx, c)];
                        prop_assert_eq!(lane.to_f32(), 0.0);
                    }
                }
            }
        }
    }

    #[test]
    fn prop_pack_then_unpack_rounds_to_half(
        topology in topology_strategy(),
        out_c in 1usize..9,
        in_c in 1usize..9,
        k in 1usize..4,
        values in prop::collection::vec(
            prop_oneof![-1.0e4f32..1.0e4f32, -1.0e-4f32..1.0e-4f32],
            8 * 8 * 9,
        ),
    ) {
        let config = ConvConfig::new(out_c, k, 1, 0);
        let geometry = ConvGeometry::resolve(&config, HwcnShape::new(4, 4, in_c, 1)).unwrap();
        let plan = KernelPlanner::new(topology).unwrap().plan(&geometry).unwrap();
        let params = &plan.forward;

        let shape = geometry.weight_shape();
        let weights = &values[..shape.iter().product::<usize>()];
        let packed = to_compact_half_weights(weights, params).unwrap();
        let restored = to_general_weights(&packed, &shape, params).unwrap();

        // Round-to-nearest: half an ulp of the 11-bit significand for normal
        // values, half the smallest subnormal step below that.
        let subnormal_step = 2.0f32.powi(-24);
        for (i, (&r, &w)) in restored.iter().zip(weights).enumerate() {
            let bound = w.abs() * 2.0f32.powi(-11) + subnormal_step / 2.0;
            prop_assert!((r - w).abs() <= bound, "w[{}] = {} restored as {}", i, w, r);
        }

        for oc in 0..out_c {
            for ky in 0..k {
                for kx in 0..k {
                    for c in in_c..params.in_channels_padded {
                        let lane = packed[params.packed_weight_offset(oc, ky, kx, c)];
                        prop_assert_eq!(lane.to_f32(), 0.0);
                    }
                }
            }
        }
    }

    #[test]
    fn prop_flip_is_an_involution(
        filters in 1usize..6,
        k in 1usize..6,
        seed in 0usize..17,
    ) {
        let weights = pattern(filters * k * k, seed, 0.5);
        let flipped = flip_spatial(&weights, k);
        prop_assert_eq!(flip_spatial(&flipped, k), weights.clone());
        // The centre tap of an odd kernel stays put.
        if k % 2 == 1 {
            let centre = (k / 2) * k + k / 2;
            prop_assert_eq!(flipped[centre], weights[centre]);
        }
    }
}

// ---------------------------------------------------------------------------
// Properties: planner
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn prop_plan_bursts_padding_and_coverage(
        topology in topology_strategy(),
        (h, w) in (3usize..20, 3usize..20),
        in_c in 1usize..12,
        out_c in 1usize..40,
        num in 1usize..4,
        k in 1usize..4,
        stride in 1usize..3,
    ) {
        let config = ConvConfig::new(out_c, k, stride, k / 2);
        let geometry = ConvGeometry::resolve(&config, HwcnShape::new(h, w, in_c, num)).unwrap();
        let plan = KernelPlanner::new(topology.clone()).unwrap().plan(&geometry).unwrap();
        let pe = topology.processing_elements;
        let burst_cap = (topology.burst_oc_limit / pe * pe).max(pe);

        for params in [&plan.forward, &plan.backward_data] {
            prop_assert_eq!(params.burst_oc % pe, 0);
            prop_assert!(params.burst_oc <= burst_cap);
            prop_assert_eq!(params.out_channels_padded % params.burst_oc, 0);
            prop_assert!(params.out_channels_padded >= params.out_channels);
            prop_assert_eq!(params.in_channels_padded % topology.channel_modulus, 0);
            prop_assert_eq!(params.weight_pad, params.in_channels_padded - params.in_channels);
            prop_assert!(params.num_cu * params.work_per_cu >= params.out_y);
            prop_assert!(params.to_words().is_ok());
        }

        let bias = &plan.backward_bias;
        prop_assert!(bias.num_cu * bias.work_per_cu >= out_c);
        prop_assert_eq!(bias.reduce_extent, geometry.top().spatial() * num);

        let weights = &plan.backward_weights;
        let elements = out_c * k * k * in_c;
        prop_assert!(weights.num_cu * weights.work_per_cu >= elements);
        prop_assert_eq!(weights.packed_weight_len(), plan.forward.packed_weight_len());
    }
}

// ---------------------------------------------------------------------------
// Properties: forward pass
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_forward_matches_direct_convolution(
        topology in topology_strategy(),
        (h, w) in (3usize..8, 3usize..8),
        in_c in 1usize..5,
        out_c in 1usize..6,
        num in 1usize..3,
        k in 1usize..4,
        stride in 1usize..3,
        seed in 0usize..17,
    ) {
        let pad = k / 2;
        let bottom_shape = [h, w, in_c, num];
        let mut layer = ConvLayer::setup(
            ConvConfig::new(out_c, k, stride, pad),
            topology,
            ReferenceDispatcher::new(),
            &bottom_shape,
        )
        .unwrap();
        let count = layer.weights().count();
        layer.weights_mut().data_mut().copy_from_slice(&pattern(count, seed, 0.125));
        layer.bias_mut().unwrap().data_mut().copy_from_slice(&pattern(out_c, seed + 1, 0.25));

        let bottom = Blob::from_data(&bottom_shape, pattern(h * w * in_c * num, seed + 2, 0.25)).unwrap();
        let mut top = Blob::new(&[1]);
        layer.forward(&bottom, &mut top).unwrap();

        let (pre, ys) = ConvDims::new(k, stride, pad).forward(
            bottom.data(),
            bottom.hwcn_shape().unwrap(),
            layer.weights().data(),
            layer.bias().map(|b| b.data()),
            out_c,
        );
        prop_assert_eq!(top.shape().to_vec(), ys.dims());
        assert_close(top.data(), &relu(&pre), "forward");
    }
}
