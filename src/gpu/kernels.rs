//! WGSL kernels for each operator family.
//!
//! Shapes and scalars travel in the `info` array, so a kernel's source only
//! depends on the operator variant and the dtypes involved. Launches with
//! different shapes share one compiled pipeline.

use crate::{
    error::KernelError,
    op::{
        broadcast, ActivationKind, ActivationParam, AsStridedParam, ConcatParam, ElewiseKind,
        ElewiseParam, GatherParam, LayerNormParam, MatMulParam, OpParam, RmsNormParam, RopeParam,
        SelfAttentionParam, SoftmaxParam, SplitParam, TransposeParam,
    },
    registry::{KernelLaunch, TensorBinding},
    tensor::{DataType, DeviceSpan, Shape, TensorFormat},
};

use super::kernel::GenericKernel;

pub(crate) struct KernelDispatch {
    pub(crate) kernel: GenericKernel,
    pub(crate) info: Vec<u32>,
    pub(crate) tensors: Vec<DeviceSpan>,
}

type Dispatches = Result<Vec<KernelDispatch>, KernelError>;

/// Turns one launch into the dispatches that implement it.
pub(crate) fn plan(launch: &KernelLaunch<'_>) -> Dispatches {
    if let Some(tiled) = launch
        .inputs
        .iter()
        .chain(&launch.outputs)
        .position(|t| t.desc.format != TensorFormat::RowMajor)
    {
        return Err(unsupported(
            launch,
            format!("tensor {tiled} is tiled, only row major layouts are implemented"),
        ));
    }
    if launch.outputs.iter().all(|output| output.byte_size == 0) {
        return Ok(Vec::new());
    }
    match launch.param {
        OpParam::Elewise(param) => elewise(launch, param),
        OpParam::Activation(param) => activation(launch, param),
        OpParam::LayerNorm(param) => layer_norm(launch, param),
        OpParam::RmsNorm(param) => rms_norm(launch, param),
        OpParam::MatMul(param) => matmul(launch, param),
        OpParam::Softmax(param) => softmax(launch, param),
        OpParam::AsStrided(param) => as_strided(launch, param),
        OpParam::Transpose(param) => transpose(launch, param),
        OpParam::Split(param) => split(launch, param),
        OpParam::Concat(param) => concat(launch, param),
        OpParam::Gather(param) => gather(launch, param),
        OpParam::Rope(param) => rope(launch, param),
        OpParam::SelfAttention(param) => self_attention(launch, param),
        OpParam::TransData(_) => Err(unsupported(
            launch,
            "tiled layouts are not implemented on this device",
        )),
    }
}

fn unsupported(launch: &KernelLaunch<'_>, reason: impl ToString) -> KernelError {
    KernelError::Unsupported {
        op: launch.op.to_string(),
        reason: reason.to_string(),
    }
}

fn expect_f32(launch: &KernelLaunch<'_>) -> Result<(), KernelError> {
    let tensors = launch.inputs.iter().chain(&launch.outputs);
    for tensor in tensors {
        if tensor.desc.dtype != DataType::F32 {
            return Err(unsupported(
                launch,
                format!("{} tensors are not implemented", tensor.desc.dtype),
            ));
        }
    }
    Ok(())
}

fn word(value: i64) -> Result<u32, KernelError> {
    u32::try_from(value).map_err(|_| {
        KernelError::Rejected(format!("{value} does not fit a 32 bit launch parameter"))
    })
}

/// Launch parameters, starting with the thread count.
struct Info(Vec<u32>);

impl Info {
    fn new(threads: i64) -> Result<Self, KernelError> {
        Ok(Self(vec![word(threads)?]))
    }

    fn push(&mut self, value: i64) -> Result<(), KernelError> {
        self.0.push(word(value)?);
        Ok(())
    }

    fn extend(&mut self, values: impl IntoIterator<Item = i64>) -> Result<(), KernelError> {
        values.into_iter().try_for_each(|value| self.push(value))
    }

    fn push_f32(&mut self, value: f32) {
        self.0.push(value.to_bits());
    }
}

fn dispatch(kernel: GenericKernel, info: Info, tensors: &[&TensorBinding]) -> KernelDispatch {
    KernelDispatch {
        kernel,
        info: info.0,
        tensors: tensors.iter().map(|tensor| tensor.span()).collect(),
    }
}

/// Strides that walk `shape` while iterating over `target`, zero on
/// broadcast axes.
fn broadcast_strides(shape: &Shape, target: &Shape) -> Vec<i64> {
    let strides = shape.contiguous_strides();
    let pad = target.rank() - shape.rank();
    (0..target.rank())
        .map(|axis| match axis.checked_sub(pad) {
            Some(i) if shape[i] != 1 => strides[i],
            _ => 0,
        })
        .collect()
}

fn elewise(launch: &KernelLaunch<'_>, param: &ElewiseParam) -> Dispatches {
    let x = &launch.inputs[0];
    let out = &launch.outputs[0];
    let mut kernel = GenericKernel::new();
    let op = match param.kind {
        ElewiseKind::Add => "+",
        ElewiseKind::Sub => "-",
        ElewiseKind::Mul => "*",
        ElewiseKind::RealDiv => "/",
        ElewiseKind::Muls(scale) => {
            expect_f32(launch)?;
            let input = kernel.add_tensor_input(x.desc.dtype)?;
            let output = kernel.add_tensor_input(out.desc.dtype)?;
            kernel.set_body(format!(
                "{output}[index] = {input}[index] * bitcast<f32>(info[1]);"
            ));
            let mut info = Info::new(x.desc.shape.element_count())?;
            info.push_f32(scale);
            return Ok(vec![dispatch(kernel, info, &[x, out])]);
        }
        ElewiseKind::Cast(_) => {
            let input = kernel.add_tensor_input(x.desc.dtype)?;
            let output = kernel.add_tensor_input(out.desc.dtype)?;
            kernel.set_body(format!(
                "{output}[index] = {}({input}[index]);",
                output.wgsl_type()
            ));
            let info = Info::new(x.desc.shape.element_count())?;
            return Ok(vec![dispatch(kernel, info, &[x, out])]);
        }
    };

    let y = &launch.inputs[1];
    let shape = broadcast(&x.desc.shape, &y.desc.shape)
        .map_err(|err| KernelError::Rejected(err.to_string()))?;
    let mut info = Info::new(shape.element_count())?;
    info.push(shape.rank() as i64)?;
    info.extend(shape.iter().copied())?;
    info.extend(broadcast_strides(&x.desc.shape, &shape))?;
    info.extend(broadcast_strides(&y.desc.shape, &shape))?;

    let lhs = kernel.add_tensor_input(x.desc.dtype)?;
    let rhs = kernel.add_tensor_input(y.desc.dtype)?;
    let output = kernel.add_tensor_input(out.desc.dtype)?;
    kernel.set_body(format!(
        "let rank = info[1];
var rem = index;
var lhs_index = 0u;
var rhs_index = 0u;
for (var i = 0u; i < rank; i++) {{
    let axis = rank - 1u - i;
    let coord = rem % info[2u + axis];
    rem = rem / info[2u + axis];
    lhs_index += coord * info[2u + rank + axis];
    rhs_index += coord * info[2u + 2u * rank + axis];
}}
{output}[index] = {lhs}[lhs_index] {op} {rhs}[rhs_index];"
    ));
    Ok(vec![dispatch(kernel, info, &[x, y, out])])
}

fn activation(launch: &KernelLaunch<'_>, param: &ActivationParam) -> Dispatches {
    expect_f32(launch)?;
    let (x, out) = (&launch.inputs[0], &launch.outputs[0]);
    let mut kernel = GenericKernel::new();
    let input = kernel.add_tensor_input(x.desc.dtype)?;
    let output = kernel.add_tensor_input(out.desc.dtype)?;
    let function_body = match param.kind {
        ActivationKind::Relu => "let output = max(x, 0.0);",
        ActivationKind::Gelu => {
            "let output = 0.5 * x * (1.0 + tanh(0.7978845608 * (x + 0.044715 * x * x * x)));"
        }
        ActivationKind::FastGelu => "let output = x / (1.0 + exp(-1.702 * x));",
        ActivationKind::Silu | ActivationKind::Swiglu => "let output = x / (1.0 + exp(-x));",
        ActivationKind::Sigmoid => "let output = 1.0 / (1.0 + exp(-x));",
    };
    let function = kernel.add_function(
        "f32",
        function_body,
        [("x".to_string(), "f32".to_string())],
    );

    if param.kind != ActivationKind::Swiglu {
        kernel.set_body(format!(
            "{output}[index] = {};",
            function.call(&[&format!("{input}[index]")])
        ));
        let info = Info::new(x.desc.shape.element_count())?;
        return Ok(vec![dispatch(kernel, info, &[x, out])]);
    }

    let half = out.desc.shape.last().copied().unwrap_or(1);
    let mut info = Info::new(out.desc.shape.element_count())?;
    info.push(half)?;
    kernel.set_body(format!(
        "let half = info[1];
let base = (index / half) * 2u * half + index % half;
{output}[index] = {} * {input}[base + half];",
        function.call(&[&format!("{input}[base]")])
    ));
    Ok(vec![dispatch(kernel, info, &[x, out])])
}

fn layer_norm(launch: &KernelLaunch<'_>, param: &LayerNormParam) -> Dispatches {
    expect_f32(launch)?;
    let [x, gamma, beta] = [0, 1, 2].map(|i| &launch.inputs[i]);
    let shape = &x.desc.shape;
    let (Some(axis), Some(params_axis)) = (
        shape.axis(param.begin_norm_axis),
        shape.axis(param.begin_params_axis),
    ) else {
        return Err(KernelError::Rejected(format!(
            "normalization axes are out of range for {shape}"
        )));
    };
    if axis != params_axis {
        return Err(unsupported(
            launch,
            "gamma and beta must cover exactly the normalized dimensions",
        ));
    }
    let rows: i64 = shape[..axis].iter().product();
    let cols: i64 = shape[axis..].iter().product();
    let mut info = Info::new(rows)?;
    info.push(cols)?;
    info.push_f32(param.epsilon);

    let mut kernel = GenericKernel::new();
    let [input, weight, bias] = [x, gamma, beta].map(|t| kernel.add_tensor_input(t.desc.dtype));
    let (input, weight, bias) = (input?, weight?, bias?);
    let output = kernel.add_tensor_input(DataType::F32)?;
    let mut body = format!(
        "let cols = info[1];
let eps = bitcast<f32>(info[2]);
let base = index * cols;
var acc = 0.0;
for (var c = 0u; c < cols; c++) {{ acc += {input}[base + c]; }}
let mean = acc / f32(cols);
var sq = 0.0;
for (var c = 0u; c < cols; c++) {{
    let d = {input}[base + c] - mean;
    sq += d * d;
}}
let rstd = inverseSqrt(sq / f32(cols) + eps);
for (var c = 0u; c < cols; c++) {{
    {output}[base + c] = ({input}[base + c] - mean) * rstd * {weight}[c] + {bias}[c];
}}"
    );
    let mut tensors = vec![x, gamma, beta, &launch.outputs[0]];
    if param.with_stats {
        let mean = kernel.add_tensor_input(DataType::F32)?;
        let rstd = kernel.add_tensor_input(DataType::F32)?;
        body.push_str(&format!("\n{mean}[index] = mean;\n{rstd}[index] = rstd;"));
        tensors.extend([&launch.outputs[1], &launch.outputs[2]]);
    }
    kernel.set_body(body);
    Ok(vec![dispatch(kernel, info, &tensors)])
}

fn rms_norm(launch: &KernelLaunch<'_>, param: &RmsNormParam) -> Dispatches {
    expect_f32(launch)?;
    let (x, gamma, out) = (&launch.inputs[0], &launch.inputs[1], &launch.outputs[0]);
    let cols = x.desc.shape.last().copied().unwrap_or(1);
    let mut info = Info::new(x.desc.shape.element_count() / cols.max(1))?;
    info.push(cols)?;
    info.push_f32(param.epsilon);

    let mut kernel = GenericKernel::new();
    let input = kernel.add_tensor_input(DataType::F32)?;
    let weight = kernel.add_tensor_input(DataType::F32)?;
    let output = kernel.add_tensor_input(DataType::F32)?;
    kernel.set_body(format!(
        "let cols = info[1];
let base = index * cols;
var sq = 0.0;
for (var c = 0u; c < cols; c++) {{ sq += {input}[base + c] * {input}[base + c]; }}
let scale = inverseSqrt(sq / f32(cols) + bitcast<f32>(info[2]));
for (var c = 0u; c < cols; c++) {{
    {output}[base + c] = {input}[base + c] * scale * {weight}[c];
}}"
    ));
    Ok(vec![dispatch(kernel, info, &[x, gamma, out])])
}

fn matmul(launch: &KernelLaunch<'_>, param: &MatMulParam) -> Dispatches {
    expect_f32(launch)?;
    let (a, b) = (&launch.inputs[0], &launch.inputs[1]);
    let extents = param
        .extents
        .or_else(|| param.extents_for(&a.desc.shape, &b.desc.shape))
        .ok_or_else(|| KernelError::Rejected("matmul operands are not 2d".to_string()))?;
    let mut info = Info::new(extents.m * extents.n)?;
    info.extend([extents.m, extents.n, extents.k])?;

    let mut kernel = GenericKernel::new();
    let lhs = kernel.add_tensor_input(DataType::F32)?;
    let rhs = kernel.add_tensor_input(DataType::F32)?;
    let mut tensors = vec![a, b];
    let bias = if param.has_bias {
        tensors.push(&launch.inputs[2]);
        let bias = kernel.add_tensor_input(DataType::F32)?;
        format!("acc += {bias}[col];")
    } else {
        String::new()
    };
    let output = kernel.add_tensor_input(DataType::F32)?;
    tensors.push(&launch.outputs[0]);

    let lhs_index = if param.transpose_a {
        "i * m + row"
    } else {
        "row * k + i"
    };
    let rhs_index = if param.transpose_b {
        "col * k + i"
    } else {
        "i * n + col"
    };
    kernel.set_body(format!(
        "let m = info[1];
let n = info[2];
let k = info[3];
let row = index / n;
let col = index % n;
var acc = 0.0;
for (var i = 0u; i < k; i++) {{
    acc += {lhs}[{lhs_index}] * {rhs}[{rhs_index}];
}}
{bias}
{output}[index] = acc;"
    ));
    Ok(vec![dispatch(kernel, info, &tensors)])
}

fn softmax(launch: &KernelLaunch<'_>, param: &SoftmaxParam) -> Dispatches {
    expect_f32(launch)?;
    let (x, out) = (&launch.inputs[0], &launch.outputs[0]);
    let shape = &x.desc.shape;
    if shape.axis(param.axis) != shape.rank().checked_sub(1) {
        return Err(unsupported(launch, "only the last axis is implemented"));
    }
    let cols = shape.last().copied().unwrap_or(1);
    let mut info = Info::new(shape.element_count() / cols.max(1))?;
    info.push(cols)?;

    let mut kernel = GenericKernel::new();
    let input = kernel.add_tensor_input(DataType::F32)?;
    let output = kernel.add_tensor_input(DataType::F32)?;
    kernel.set_body(format!(
        "let cols = info[1];
let base = index * cols;
var peak = {input}[base];
for (var c = 1u; c < cols; c++) {{ peak = max(peak, {input}[base + c]); }}
var total = 0.0;
for (var c = 0u; c < cols; c++) {{
    let e = exp({input}[base + c] - peak);
    {output}[base + c] = e;
    total += e;
}}
for (var c = 0u; c < cols; c++) {{ {output}[base + c] = {output}[base + c] / total; }}"
    ));
    Ok(vec![dispatch(kernel, info, &[x, out])])
}

/// One element-wise copy between two strided views, in elements.
struct StridedCopy {
    shape: Vec<i64>,
    src_offset: i64,
    src_strides: Vec<i64>,
    dst_offset: i64,
    dst_strides: Vec<i64>,
}

impl StridedCopy {
    /// Reads `shape` contiguously and writes it contiguously.
    fn contiguous(shape: &Shape) -> Self {
        let strides = shape.contiguous_strides().to_vec();
        Self {
            shape: shape.to_vec(),
            src_offset: 0,
            src_strides: strides.clone(),
            dst_offset: 0,
            dst_strides: strides,
        }
    }

    fn dispatch(self, src: &TensorBinding, dst: &TensorBinding) -> Result<KernelDispatch, KernelError> {
        let mut info = Info::new(self.shape.iter().product())?;
        info.push(self.shape.len() as i64)?;
        info.extend([self.src_offset, self.dst_offset])?;
        info.extend(self.shape)?;
        info.extend(self.src_strides)?;
        info.extend(self.dst_strides)?;

        let mut kernel = GenericKernel::new();
        let input = kernel.add_tensor_input(src.desc.dtype)?;
        let output = kernel.add_tensor_input(dst.desc.dtype)?;
        kernel.set_body(format!(
            "let rank = info[1];
var rem = index;
var src = info[2];
var dst = info[3];
for (var i = 0u; i < rank; i++) {{
    let axis = rank - 1u - i;
    let coord = rem % info[4u + axis];
    rem = rem / info[4u + axis];
    src += coord * info[4u + rank + axis];
    dst += coord * info[4u + 2u * rank + axis];
}}
{output}[dst] = {input}[src];"
        ));
        Ok(dispatch(kernel, info, &[src, dst]))
    }
}

fn as_strided(launch: &KernelLaunch<'_>, param: &AsStridedParam) -> Dispatches {
    let size = Shape::from(param.size.clone());
    let copy = StridedCopy {
        src_offset: param.offset,
        src_strides: param.stride.clone(),
        ..StridedCopy::contiguous(&size)
    };
    Ok(vec![copy.dispatch(&launch.inputs[0], &launch.outputs[0])?])
}

fn transpose(launch: &KernelLaunch<'_>, param: &TransposeParam) -> Dispatches {
    let x = &launch.inputs[0];
    let strides = x.desc.shape.contiguous_strides();
    let shape: Shape = param.perm.iter().map(|axis| x.desc.shape[*axis]).collect();
    let copy = StridedCopy {
        src_strides: param.perm.iter().map(|axis| strides[*axis]).collect(),
        ..StridedCopy::contiguous(&shape)
    };
    Ok(vec![copy.dispatch(x, &launch.outputs[0])?])
}

fn split(launch: &KernelLaunch<'_>, param: &SplitParam) -> Dispatches {
    let x = &launch.inputs[0];
    let axis = x
        .desc
        .shape
        .axis(param.axis)
        .ok_or_else(|| KernelError::Rejected(format!("split axis {} out of range", param.axis)))?;
    let strides = x.desc.shape.contiguous_strides();
    let chunk = x.desc.shape[axis] / param.count.max(1) as i64;
    let part: Shape = x
        .desc
        .shape
        .iter()
        .enumerate()
        .map(|(i, dim)| if i == axis { chunk } else { *dim })
        .collect();
    launch
        .outputs
        .iter()
        .enumerate()
        .map(|(j, out)| {
            let copy = StridedCopy {
                src_offset: j as i64 * chunk * strides[axis],
                src_strides: strides.to_vec(),
                ..StridedCopy::contiguous(&part)
            };
            copy.dispatch(x, out)
        })
        .collect()
}

fn concat(launch: &KernelLaunch<'_>, param: &ConcatParam) -> Dispatches {
    let (a, b, out) = (&launch.inputs[0], &launch.inputs[1], &launch.outputs[0]);
    let axis = a
        .desc
        .shape
        .axis(param.axis)
        .ok_or_else(|| KernelError::Rejected(format!("concat axis {} out of range", param.axis)))?;
    let joined: Shape = a
        .desc
        .shape
        .iter()
        .zip(b.desc.shape.iter())
        .enumerate()
        .map(|(i, (x, y))| if i == axis { x + y } else { *x })
        .collect();
    let out_strides = joined.contiguous_strides().to_vec();
    let into_out = |src: &TensorBinding, dst_offset: i64| {
        StridedCopy {
            dst_offset,
            dst_strides: out_strides.clone(),
            ..StridedCopy::contiguous(&src.desc.shape)
        }
        .dispatch(src, out)
    };
    Ok(vec![
        into_out(a, 0)?,
        into_out(b, a.desc.shape[axis] * out_strides[axis])?,
    ])
}

fn gather(launch: &KernelLaunch<'_>, param: &GatherParam) -> Dispatches {
    let (table, indices, out) = (&launch.inputs[0], &launch.inputs[1], &launch.outputs[0]);
    if indices.desc.dtype != DataType::I32 {
        return Err(unsupported(launch, "only i32 indices are implemented"));
    }
    let shape = &table.desc.shape;
    let axis = shape
        .axis(param.axis)
        .ok_or_else(|| KernelError::Rejected(format!("gather axis {} out of range", param.axis)))?;
    let outer: i64 = shape[..axis].iter().product();
    let inner: i64 = shape[axis + 1..].iter().product();
    let picks = indices.desc.shape.element_count();
    let mut info = Info::new(outer * picks * inner)?;
    info.extend([shape[axis], inner, picks])?;

    let mut kernel = GenericKernel::new();
    let rows = kernel.add_tensor_input(table.desc.dtype)?;
    let index_input = kernel.add_tensor_input(DataType::I32)?;
    let output = kernel.add_tensor_input(out.desc.dtype)?;
    let ty = output.wgsl_type();
    kernel.set_body(format!(
        "let n = info[1];
let inner = info[2];
let picks = info[3];
let col = index % inner;
let rest = index / inner;
let row = {index_input}[rest % picks];
if (row < 0 || u32(row) >= n) {{
    {output}[index] = {ty}(0);
    return;
}}
{output}[index] = {rows}[((rest / picks) * n + u32(row)) * inner + col];"
    ));
    Ok(vec![dispatch(kernel, info, &[table, indices, out])])
}

fn rope(launch: &KernelLaunch<'_>, param: &RopeParam) -> Dispatches {
    expect_f32(launch)?;
    let [q, k, cos, sin] = [0, 1, 2, 3].map(|i| &launch.inputs[i]);
    let head_dim = cos.desc.shape[1];
    if param.rotary_coeff % 2 != 0 {
        return Err(unsupported(
            launch,
            format!("rotary coefficient {} is odd", param.rotary_coeff),
        ));
    }
    let chunk = head_dim / param.rotary_coeff;

    [(q, &launch.outputs[0]), (k, &launch.outputs[1])]
        .into_iter()
        .map(|(x, out)| {
            let (tokens, hidden) = (x.desc.shape[0], x.desc.shape[1]);
            let heads = hidden / head_dim;
            let mut info = Info::new(tokens * heads * (head_dim / 2))?;
            info.extend([heads, head_dim, chunk])?;

            let mut kernel = GenericKernel::new();
            let input = kernel.add_tensor_input(DataType::F32)?;
            let cos_input = kernel.add_tensor_input(DataType::F32)?;
            let sin_input = kernel.add_tensor_input(DataType::F32)?;
            let output = kernel.add_tensor_input(DataType::F32)?;
            kernel.set_body(format!(
                "let heads = info[1];
let head_dim = info[2];
let chunk = info[3];
let half = head_dim / 2u;
let token = index / (heads * half);
let rem = index % (heads * half);
let j = rem % half;
let a_pos = (j / chunk) * 2u * chunk + j % chunk;
let b_pos = a_pos + chunk;
let base = token * heads * head_dim + (rem / half) * head_dim;
let trig = token * head_dim;
let a = {input}[base + a_pos];
let b = {input}[base + b_pos];
{output}[base + a_pos] = a * {cos_input}[trig + a_pos] - b * {sin_input}[trig + a_pos];
{output}[base + b_pos] = b * {cos_input}[trig + b_pos] + a * {sin_input}[trig + b_pos];"
            ));
            Ok(dispatch(kernel, info, &[x, cos, sin, out]))
        })
        .collect()
}

fn self_attention(launch: &KernelLaunch<'_>, param: &SelfAttentionParam) -> Dispatches {
    expect_f32(launch)?;
    let [q, k, v] = [0, 1, 2].map(|i| &launch.inputs[i]);
    let out = &launch.outputs[0];
    let Some(scratch) = launch.scratch else {
        return Err(KernelError::Rejected(
            "self attention needs scratch for its scores".to_string(),
        ));
    };
    let head_dim = q.desc.shape[1] / param.head_num;
    let mut info = Info::new(param.tokens() * param.head_num)?;
    info.extend([
        param.head_num,
        param.kv_head_num,
        head_dim,
        param.batch() as i64,
        param.max_kv_len(),
    ])?;
    info.push_f32(param.qk_scale);
    info.extend(param.token_offset.iter().map(|offset| *offset as i64))?;
    info.extend(param.seq_len.iter().map(|len| *len as i64))?;

    let mut kernel = GenericKernel::new();
    let query = kernel.add_tensor_input(DataType::F32)?;
    let key = kernel.add_tensor_input(DataType::F32)?;
    let value = kernel.add_tensor_input(DataType::F32)?;
    let output = kernel.add_tensor_input(DataType::F32)?;
    let scores = kernel.add_tensor_input(DataType::F32)?;
    kernel.set_body(format!(
        "let heads = info[1];
let kv_heads = info[2];
let head_dim = info[3];
let batch = info[4];
let max_kv = info[5];
let scale = bitcast<f32>(info[6]);
let token = index / heads;
let head = index % heads;
let kv_head = head / (heads / kv_heads);
var q_start = 0u;
var kv_start = 0u;
var visible = 0u;
for (var b = 0u; b < batch; b++) {{
    let cached = info[7u + b];
    let fresh = info[7u + batch + b];
    if (token < q_start + fresh) {{
        visible = cached + (token - q_start) + 1u;
        break;
    }}
    q_start += fresh;
    kv_start += cached + fresh;
}}
let q_row = token * heads * head_dim + head * head_dim;
let kv_width = kv_heads * head_dim;
let row = index * max_kv;
var peak = -3.4e38;
for (var j = 0u; j < visible; j++) {{
    let k_row = (kv_start + j) * kv_width + kv_head * head_dim;
    var score = 0.0;
    for (var e = 0u; e < head_dim; e++) {{ score += {query}[q_row + e] * {key}[k_row + e]; }}
    score *= scale;
    {scores}[row + j] = score;
    peak = max(peak, score);
}}
var total = 0.0;
for (var j = 0u; j < visible; j++) {{
    let p = exp({scores}[row + j] - peak);
    {scores}[row + j] = p;
    total += p;
}}
for (var e = 0u; e < head_dim; e++) {{
    var acc = 0.0;
    for (var j = 0u; j < visible; j++) {{
        acc += {scores}[row + j] * {value}[(kv_start + j) * kv_width + kv_head * head_dim + e];
    }}
    {output}[q_row + e] = acc / total;
}}"
    ));
    let mut attention = dispatch(kernel, info, &[q, k, v, out]);
    attention.tensors.push(scratch);
    Ok(vec![attention])
}
