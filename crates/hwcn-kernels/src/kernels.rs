//! OpenCL C source for the HWCN convolution program.
//!
//! One program holds all three entry points. Every entry takes the same
//! argument list so the dispatcher can bind buffers by position:
//! `(input, filter, bias, output, tags, params, groups)`. The program runs
//! one work item per `(compute unit, processing element)` lane; the global
//! work size is `num_cu * num_pe`. Values are stored as `half` and loaded
//! with `vload_half`, so no `cl_khr_fp16` support is required.

/// OpenCL C source for the convolution program.
pub const CONV_HWCN_SOURCE: &str = r#"
#define P_PASS                0
#define P_GROUPS              1
#define P_NUM                 2
#define P_IN_Y                3
#define P_IN_X                4
#define P_IN_C                5
#define P_IN_CP               6
#define P_OUT_Y               7
#define P_OUT_X               8
#define P_OUT_C               9
#define P_OUT_CP             10
#define P_K                  11
#define P_STRIDE             12
#define P_PAD                13
#define P_DIL                14
#define P_NUM_CU             15
#define P_NUM_PE             16
#define P_BURST_OC           17
#define P_WORK_PER_CU        18
#define P_REDUCE             19
#define P_WEIGHT_PAD         20
#define P_TAG_MODE           21
#define P_APPLY_BIAS         22

#define TAG_IGNORE            0
#define TAG_RECORD            1
#define TAG_MASK_INPUT        2
#define TAG_MASK_FILTER       3

/* Source coordinate, or -1 when the tap falls on padding or a dilation hole. */
inline int source_index(int o, int k, int stride, int pad, int dil, int extent)
{
    int i = o * stride + k - pad;
    if (i < 0 || (i % dil) != 0) return -1;
    i /= dil;
    return i < extent ? i : -1;
}

__kernel void hwcn_correlate(
    __global const half* input,
    __global const half* filter,
    __global const half* bias,
    __global half*       output,
    __global int*        tags,
    __global const int*  p,
    const int            groups)
{
    const int num_pe = p[P_NUM_PE];
    const int cu = get_global_id(0) / num_pe;
    const int pe = get_global_id(0) % num_pe;
    if (cu >= p[P_NUM_CU]) return;

    const int num = p[P_NUM];
    const int in_x = p[P_IN_X], in_y = p[P_IN_Y];
    const int in_c = p[P_IN_C], in_cp = p[P_IN_CP];
    const int out_x = p[P_OUT_X], out_y = p[P_OUT_Y];
    const int out_c = p[P_OUT_C], out_cp = p[P_OUT_CP];
    const int k = p[P_K], burst_oc = p[P_BURST_OC];
    const int mode = p[P_TAG_MODE];
    const int in_total = in_c * groups, out_total = out_c * groups;

    const int row_begin = cu * p[P_WORK_PER_CU];
    const int row_end = min(row_begin + p[P_WORK_PER_CU], out_y);

    for (int oy = row_begin; oy < row_end; ++oy)
    for (int ox = 0; ox < out_x; ++ox)
    for (int g = 0; g < groups; ++g)
    for (int burst = 0; burst < out_cp; burst += burst_oc)
    for (int o = burst + pe; o < burst + burst_oc && o < out_c; o += num_pe) {
        const int oc = g * out_c + o;
        for (int n = 0; n < num; ++n) {
            float acc = p[P_APPLY_BIAS] ? vload_half(oc, bias) : 0.0f;
            for (int ky = 0; ky < k; ++ky) {
                const int iy = source_index(oy, ky, p[P_STRIDE], p[P_PAD], p[P_DIL], in_y);
                if (iy < 0) continue;
                for (int kx = 0; kx < k; ++kx) {
                    const int ix = source_index(ox, kx, p[P_STRIDE], p[P_PAD], p[P_DIL], in_x);
                    if (ix < 0) continue;
                    const int base = ((iy * in_x + ix) * in_total + g * in_c) * num + n;
                    const int wbase = ((oc * k + ky) * k + kx) * in_cp;
                    for (int c = 0; c < in_c; ++c) {
                        const int idx = base + c * num;
                        if (mode == TAG_MASK_INPUT && tags[idx] == 0) continue;
                        acc += vload_half(idx, input) * vload_half(wbase + c, filter);
                    }
                }
            }
            const int out_idx = ((oy * out_x + ox) * out_total + oc) * num + n;
            if (mode == TAG_RECORD) {
                const int open = acc > 0.0f;
                tags[out_idx] = open;
                if (!open) acc = 0.0f;
            }
            vstore_half(acc, out_idx, output);
        }
    }
}

__kernel void hwcn_backward_bias(
    __global const half* input,
    __global const half* filter,
    __global const half* bias,
    __global half*       output,
    __global int*        tags,
    __global const int*  p,
    const int            groups)
{
    const int num_pe = p[P_NUM_PE];
    const int cu = get_global_id(0) / num_pe;
    const int pe = get_global_id(0) % num_pe;
    if (cu >= p[P_NUM_CU]) return;

    const int lanes = p[P_OUT_C];
    const int num = p[P_NUM];
    const int spatial = p[P_IN_Y] * p[P_IN_X];
    const int mode = p[P_TAG_MODE];
    const int begin = min(cu * p[P_WORK_PER_CU], lanes);
    const int end = min(begin + p[P_WORK_PER_CU], lanes);

    for (int lane = begin + pe; lane < end; lane += num_pe) {
        float total = 0.0f;
        for (int n = 0; n < num; ++n) {
            float partial = 0.0f;
            for (int s = 0; s < spatial; ++s) {
                const int idx = (s * p[P_IN_C] + lane) * num + n;
                if (mode == TAG_MASK_INPUT && tags[idx] == 0) continue;
                partial += vload_half(idx, input);
            }
            total += partial;
        }
        vstore_half(total, lane, output);
    }
}

__kernel void hwcn_backward_weights(
    __global const half* input,
    __global const half* filter,
    __global const half* bias,
    __global half*       output,
    __global int*        tags,
    __global const int*  p,
    const int            groups)
{
    const int num_pe = p[P_NUM_PE];
    const int cu = get_global_id(0) / num_pe;
    const int pe = get_global_id(0) % num_pe;
    if (cu >= p[P_NUM_CU]) return;

    const int num = p[P_NUM];
    const int in_x = p[P_IN_X], in_y = p[P_IN_Y];
    const int in_c = p[P_IN_C], in_cp = p[P_IN_CP];
    const int out_x = p[P_OUT_X], out_y = p[P_OUT_Y], out_c = p[P_OUT_C];
    const int k = p[P_K];
    const int mode = p[P_TAG_MODE];
    const int in_total = in_c * groups, out_total = out_c * groups;
    const int elements = out_total * k * k * in_c;
    const int begin = min(cu * p[P_WORK_PER_CU], elements);
    const int end = min(begin + p[P_WORK_PER_CU], elements);

    for (int e = begin + pe; e < end; e += num_pe) {
        const int c = e % in_c;
        const int kx = (e / in_c) % k;
        const int ky = (e / (in_c * k)) % k;
        const int oc = e / (in_c * k * k);
        const int g = oc / out_c;

        float acc = 0.0f;
        for (int n = 0; n < num; ++n)
        for (int oy = 0; oy < out_y; ++oy) {
            const int iy = source_index(oy, ky, p[P_STRIDE], p[P_PAD], p[P_DIL], in_y);
            if (iy < 0) continue;
            for (int ox = 0; ox < out_x; ++ox) {
                const int ix = source_index(ox, kx, p[P_STRIDE], p[P_PAD], p[P_DIL], in_x);
                if (ix < 0) continue;
                const int x_idx = ((iy * in_x + ix) * in_total + g * in_c + c) * num + n;
                const int dy_idx = ((oy * out_x + ox) * out_total + oc) * num + n;
                if (mode == TAG_MASK_INPUT && tags[x_idx] == 0) continue;
                if (mode == TAG_MASK_FILTER && tags[dy_idx] == 0) continue;
                acc += vload_half(x_idx, input) * vload_half(dy_idx, filter);
            }
        }
        const int row = ((oc * k + ky) * k + kx) * in_cp;
        vstore_half(acc, row + c, output);
        if (c == 0) {
            for (int pad_lane = in_c; pad_lane < in_cp; ++pad_lane) {
                vstore_half(0.0f, row + pad_lane, output);
            }
        }
    }
}
"#;

/// All kernel source strings, keyed by name.
pub fn all_kernel_sources() -> Vec<(&'static str, &'static str)> {
    vec![("conv_hwcn", CONV_HWCN_SOURCE)]
}

/// Single program source built from every registered kernel source.
pub fn program_source() -> String {
    all_kernel_sources().into_iter().map(|(_, source)| source).collect::<Vec<_>>().join("\n")
}
