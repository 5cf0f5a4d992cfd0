use std::{collections::HashMap, num::NonZeroU64, sync::Arc};

use log::{debug, trace};
use parking_lot::Mutex;

use crate::{
    error::{DeviceError, KernelError},
    registry::{KernelLaunch, KernelRegistry},
};

use super::{
    kernel::{CompiledKernel, GenericKernel},
    kernels, Device, DeviceMemory, WgpuStream,
};

/// Runs operator launches as WGSL compute kernels.
///
/// Compiled pipelines are cached by kernel source for the lifetime of the
/// registry.
pub struct WgpuRegistry {
    memory: DeviceMemory,
    pipelines: Mutex<HashMap<String, Arc<CompiledKernel>>>,
}

impl WgpuRegistry {
    pub fn new(memory: DeviceMemory) -> Self {
        Self {
            memory,
            pipelines: Default::default(),
        }
    }

    pub fn memory(&self) -> &DeviceMemory {
        &self.memory
    }

    pub fn device(&self) -> &Device {
        self.memory.device()
    }

    /// A stream on this registry's device.
    pub fn stream(&self) -> WgpuStream {
        WgpuStream::new(self.device())
    }

    pub fn cached_pipelines(&self) -> usize {
        self.pipelines.lock().len()
    }

    fn pipeline(&self, kernel: &GenericKernel) -> Arc<CompiledKernel> {
        let source = kernel.source();
        let mut pipelines = self.pipelines.lock();
        if let Some(pipeline) = pipelines.get(&source) {
            return pipeline.clone();
        }
        debug!(
            "compiling kernel with {} tensor bindings:\n{source}",
            kernel.tensor_count()
        );
        let pipeline = Arc::new(kernel.compile(self.device()));
        pipelines.insert(source, pipeline.clone());
        pipeline
    }
}

impl KernelRegistry for WgpuRegistry {
    type Stream = WgpuStream;

    fn launch(
        &self,
        launch: &KernelLaunch<'_>,
        stream: &mut WgpuStream,
    ) -> Result<(), KernelError> {
        let alignment = self.device().storage_alignment();
        for dispatch in kernels::plan(launch)? {
            if dispatch.info[0] == 0 {
                continue;
            }
            let buffers = dispatch
                .tensors
                .iter()
                .map(|span| {
                    let (buffer, offset) = self.memory.resolve(*span)?;
                    if offset % alignment != 0 {
                        return Err(DeviceError::Misaligned {
                            ptr: span.ptr,
                            offset,
                            alignment,
                        });
                    }
                    Ok((buffer, offset, span.len))
                })
                .collect::<Result<Vec<_>, DeviceError>>()?;
            let bindings: Vec<wgpu::BufferBinding<'_>> = buffers
                .iter()
                .map(|(buffer, offset, len)| wgpu::BufferBinding {
                    buffer,
                    offset: *offset,
                    size: NonZeroU64::new(*len),
                })
                .collect();

            let pipeline = self.pipeline(&dispatch.kernel);
            trace!(
                "dispatching `{}` over {} threads",
                launch.node,
                dispatch.info[0]
            );
            pipeline.run(self.device(), stream.encoder(), &dispatch.info, &bindings);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ndarray::{Array, Array1, Array2, Axis};
    use rand::Rng;

    use super::*;
    use crate::{
        config::EngineConfig,
        context::Context,
        graph::{KernelGraph, KernelGraphNode},
        graphs::{self, AddNorm, AddNormParam, Attention, AttentionParam, Mlp, MlpParam},
        op::{
            ActivationKind, ConcatParam, GatherParam, OpParam, RopeParam, SoftmaxParam,
            SplitParam, TransposeParam,
        },
        pool::RunnerPool,
        runner::Runner,
        tensor::{DataType, DeviceSpan, Shape, Tensor, TensorDesc},
        variant_pack::VariantPack,
    };

    async fn registry() -> Option<WgpuRegistry> {
        match Device::new().await {
            Ok(device) => Some(WgpuRegistry::new(DeviceMemory::new(&device))),
            Err(err) => {
                eprintln!("skipping gpu test: {err}");
                None
            }
        }
    }

    fn random(len: usize) -> Vec<f32> {
        let mut rng = rand::rng();
        (0..len).map(|_| rng.random_range(-1.0..1.0)).collect()
    }

    fn assert_close(actual: &[f32], expected: &[f32]) {
        assert_eq!(actual.len(), expected.len());
        for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
            assert!((a - e).abs() < 1e-3, "element {i}: {a} != {e}");
        }
    }

    /// Uploads f32 host data and describes it.
    fn upload(registry: &WgpuRegistry, shape: &[i64], data: &[f32]) -> Tensor {
        let span = registry.memory().alloc_from(data).unwrap();
        Tensor::external(TensorDesc::new(DataType::F32, shape), span.ptr)
    }

    fn empty(registry: &WgpuRegistry, dtype: DataType, shape: &[i64]) -> Tensor {
        let desc = TensorDesc::new(dtype, shape);
        let span = registry.memory().alloc(desc.byte_size().unwrap());
        Tensor::external(desc, span.ptr)
    }

    async fn download(registry: &WgpuRegistry, tensor: &Tensor) -> Vec<f32> {
        let crate::tensor::Memory::External(ptr) = tensor.memory else {
            panic!("not an external tensor");
        };
        let span = DeviceSpan::new(ptr, tensor.byte_size().unwrap());
        registry.memory().download(span).await.unwrap()
    }

    /// Runs `pack` through a runner, providing the workspace it asks for.
    fn execute(registry: &WgpuRegistry, runner: &mut Runner, pack: VariantPack) {
        let size = runner.setup(&pack).unwrap();
        let pack = if size > 0 {
            pack.with_workspace(registry.memory().alloc(size))
        } else {
            pack
        };
        let mut stream = registry.stream();
        runner.execute(registry, &mut stream, &pack).unwrap();
        stream.synchronize();
    }

    fn single_node(param: impl Into<OpParam>) -> KernelGraph {
        let param = param.into();
        let mut graph = KernelGraph::new("single");
        let inputs: Vec<_> = (0..param.input_count())
            .map(|i| graph.create_input(format!("x{i}")))
            .collect();
        let outputs: Vec<_> = (0..param.output_count())
            .map(|i| graph.create_output(format!("y{i}")))
            .collect();
        graph.add_node(KernelGraphNode::new("op", param).inputs(inputs).outputs(outputs));
        graph
    }

    fn runner(graph: KernelGraph) -> Runner {
        Runner::new(graph, &EngineConfig::default()).unwrap()
    }

    fn layer_norm_reference(x: &Array2<f32>, gamma: &[f32], beta: &[f32]) -> Array2<f32> {
        let mut out = x.clone();
        for mut row in out.axis_iter_mut(Axis(0)) {
            let mean = row.mean().unwrap();
            let var = row.mapv(|v| (v - mean).powi(2)).mean().unwrap();
            let rstd = 1.0 / (var + 1e-5).sqrt();
            for (i, v) in row.iter_mut().enumerate() {
                *v = (*v - mean) * rstd * gamma[i] + beta[i];
            }
        }
        out
    }

    #[tokio::test]
    async fn test_add_norm_matches_reference() {
        let Some(registry) = registry().await else {
            return;
        };
        let (rows, cols) = (5, 32);
        let x = random(rows * cols);
        let residual = random(rows * cols);
        let gamma = random(cols);
        let beta = random(cols);

        let pool = graphs::register(RunnerPool::builder()).build().unwrap();
        let context = Context::new(registry, Arc::new(pool));
        let registry = context.registry();
        let shape = [rows as i64, cols as i64];
        let out = empty(registry, DataType::F32, &shape);
        let pack = VariantPack::new(
            vec![
                upload(registry, &shape, &x),
                upload(registry, &shape, &residual),
                upload(registry, &[cols as i64], &gamma),
                upload(registry, &[cols as i64], &beta),
            ],
            vec![out.clone()],
        );
        let (mut runner, size) = context
            .setup::<AddNorm>(&AddNormParam::default(), &pack)
            .unwrap();
        let pack = pack.with_workspace(registry.memory().alloc(size));
        let mut stream = registry.stream();
        context.execute(&mut runner, &mut stream, &pack).unwrap();
        stream.synchronize();

        let sum = Array::from_shape_vec((rows, cols), x).unwrap()
            + Array::from_shape_vec((rows, cols), residual).unwrap();
        let expected = layer_norm_reference(&sum, &gamma, &beta);
        assert_close(&download(registry, &out).await, expected.as_slice().unwrap());
    }

    #[tokio::test]
    async fn test_mlp_swiglu_matches_reference() {
        let Some(registry) = registry().await else {
            return;
        };
        let (tokens, hidden, inter) = (6, 16, 24);
        let x = random(tokens * hidden);
        let gamma = random(hidden);
        let beta = random(hidden);
        let w_up = random(2 * inter * hidden);
        let w_down = random(hidden * inter);

        let y = empty(&registry, DataType::F32, &[2, 3, hidden as i64]);
        let pack = VariantPack::new(
            vec![
                upload(&registry, &[2, 3, hidden as i64], &x),
                upload(&registry, &[hidden as i64], &gamma),
                upload(&registry, &[hidden as i64], &beta),
                upload(&registry, &[2 * inter as i64, hidden as i64], &w_up),
                upload(&registry, &[hidden as i64, inter as i64], &w_down),
            ],
            vec![y.clone()],
        );
        let param = MlpParam {
            activation: ActivationKind::Swiglu,
            ..Default::default()
        };
        let mut runner = runner(<Mlp as crate::pool::GraphOperation>::build(&param).unwrap());
        execute(&registry, &mut runner, pack);

        let x = Array::from_shape_vec((tokens, hidden), x).unwrap();
        let normed = layer_norm_reference(&x, &gamma, &beta);
        let up = normed.dot(&Array::from_shape_vec((2 * inter, hidden), w_up).unwrap().t());
        let silu = |v: f32| v / (1.0 + (-v).exp());
        let act = Array2::from_shape_fn((tokens, inter), |(t, i)| {
            silu(up[[t, i]]) * up[[t, inter + i]]
        });
        let expected = act.dot(&Array::from_shape_vec((hidden, inter), w_down).unwrap().t());
        assert_close(&download(&registry, &y).await, expected.as_slice().unwrap());
    }

    /// Causal attention over a packed batch with a cached prefix per entry.
    fn attention_reference(
        param: &AttentionParam,
        q: &Array2<f32>,
        k: &Array2<f32>,
        v: &Array2<f32>,
    ) -> Array2<f32> {
        let d = param.head_dim as usize;
        let group = (param.head_num / param.kv_head_num) as usize;
        let scale = 1.0 / (d as f32).sqrt();
        let mut out = Array2::zeros(q.raw_dim());
        let (mut q_start, mut kv_start) = (0, 0);
        for (offset, len) in param.token_offset.iter().zip(&param.seq_len) {
            let (offset, len) = (*offset as usize, *len as usize);
            for i in 0..len {
                let t = q_start + i;
                for h in 0..param.head_num as usize {
                    let kvh = h / group;
                    let qh = q.row(t).slice(ndarray::s![h * d..(h + 1) * d]).to_owned();
                    let scores: Array1<f32> = (0..=offset + i)
                        .map(|j| {
                            let kh = k.row(kv_start + j);
                            qh.dot(&kh.slice(ndarray::s![kvh * d..(kvh + 1) * d])) * scale
                        })
                        .collect();
                    let peak = scores.fold(f32::MIN, |a, b| a.max(*b));
                    let weights = scores.mapv(|s| (s - peak).exp());
                    let total = weights.sum();
                    for (j, w) in weights.iter().enumerate() {
                        let vh = v.row(kv_start + j);
                        let vh = vh.slice(ndarray::s![kvh * d..(kvh + 1) * d]);
                        let mut dst = out.row_mut(t);
                        let mut dst = dst.slice_mut(ndarray::s![h * d..(h + 1) * d]);
                        dst.scaled_add(w / total, &vh);
                    }
                }
            }
            q_start += len;
            kv_start += offset + len;
        }
        out
    }

    #[tokio::test]
    async fn test_attention_decode_steps() {
        let Some(registry) = registry().await else {
            return;
        };
        let pool = graphs::register(RunnerPool::builder()).build().unwrap();
        let context = Context::new(registry, Arc::new(pool));
        let registry = context.registry();
        let (heads, kv_heads, head_dim) = (4, 2, 8);
        let hidden = heads * head_dim;
        let wq = random(hidden * hidden);
        let wo = random(hidden * hidden);

        for (token_offset, seq_len) in [(vec![3, 0], vec![1, 2]), (vec![4, 2], vec![1, 1])] {
            let param = AttentionParam {
                head_num: heads as i64,
                kv_head_num: kv_heads as i64,
                head_dim: head_dim as i64,
                token_offset,
                seq_len,
            };
            let tokens: usize = param.seq_len.iter().map(|len| *len as usize).sum();
            let kv_tokens: usize = param
                .token_offset
                .iter()
                .zip(&param.seq_len)
                .map(|(o, l)| (o + l) as usize)
                .sum();
            let kv_width = kv_heads * head_dim;
            let x = random(tokens * hidden);
            let k = random(kv_tokens * kv_width);
            let v = random(kv_tokens * kv_width);

            let out = empty(registry, DataType::F32, &[tokens as i64, hidden as i64]);
            let pack = VariantPack::new(
                vec![
                    upload(registry, &[tokens as i64, hidden as i64], &x),
                    upload(registry, &[hidden as i64, hidden as i64], &wq),
                    upload(registry, &[kv_tokens as i64, kv_width as i64], &k),
                    upload(registry, &[kv_tokens as i64, kv_width as i64], &v),
                    upload(registry, &[hidden as i64, hidden as i64], &wo),
                ],
                vec![out.clone()],
            );
            let (mut runner, size) = context.setup::<Attention>(&param, &pack).unwrap();
            let pack = pack.with_workspace(registry.memory().alloc(size));
            let mut stream = registry.stream();
            context.execute(&mut runner, &mut stream, &pack).unwrap();
            stream.synchronize();

            let x = Array::from_shape_vec((tokens, hidden), x).unwrap();
            let wq = Array::from_shape_vec((hidden, hidden), wq.clone()).unwrap();
            let wo = Array::from_shape_vec((hidden, hidden), wo.clone()).unwrap();
            let k = Array::from_shape_vec((kv_tokens, kv_width), k).unwrap();
            let v = Array::from_shape_vec((kv_tokens, kv_width), v).unwrap();
            let q = x.dot(&wq.t());
            let expected = attention_reference(&param, &q, &k, &v).dot(&wo.t());
            assert_close(&download(registry, &out).await, expected.as_slice().unwrap());
        }
        assert_eq!(context.pool().stats().builds, 1);
    }

    #[tokio::test]
    async fn test_layout_kernels() {
        let Some(registry) = registry().await else {
            return;
        };
        let data: Vec<f32> = (0..24).map(|i| i as f32).collect();
        let x = Array::from_shape_vec((2, 3, 4), data.clone()).unwrap();

        // transpose
        let out = empty(&registry, DataType::F32, &[3, 2, 4]);
        let mut transpose = runner(single_node(TransposeParam { perm: vec![1, 0, 2] }));
        execute(
            &registry,
            &mut transpose,
            VariantPack::new(vec![upload(&registry, &[2, 3, 4], &data)], vec![out.clone()]),
        );
        let expected = x.view().permuted_axes([1, 0, 2]).to_owned();
        assert_eq!(download(&registry, &out).await, expected.iter().copied().collect::<Vec<_>>());

        // split then concat back together
        let halves = [
            empty(&registry, DataType::F32, &[2, 3, 2]),
            empty(&registry, DataType::F32, &[2, 3, 2]),
        ];
        let mut split = runner(single_node(SplitParam { axis: -1, count: 2 }));
        execute(
            &registry,
            &mut split,
            VariantPack::new(vec![upload(&registry, &[2, 3, 4], &data)], halves.to_vec()),
        );
        let first = x.slice(ndarray::s![.., .., 0..2]).iter().copied().collect::<Vec<_>>();
        assert_eq!(download(&registry, &halves[0]).await, first);

        let joined = empty(&registry, DataType::F32, &[2, 3, 4]);
        let mut concat = runner(single_node(ConcatParam { axis: 2 }));
        execute(
            &registry,
            &mut concat,
            VariantPack::new(halves.to_vec(), vec![joined.clone()]),
        );
        assert_eq!(download(&registry, &joined).await, data);

        // gather rows 2 and 0 of a [3, 8] table, plus one out of range pick
        let table: Vec<f32> = (0..24).map(|i| i as f32).collect();
        let indices = registry.memory().alloc_from(&[2i32, 0, 7]).unwrap();
        let picked = empty(&registry, DataType::F32, &[3, 8]);
        let mut gather = runner(single_node(GatherParam { axis: 0 }));
        execute(
            &registry,
            &mut gather,
            VariantPack::new(
                vec![
                    upload(&registry, &[3, 8], &table),
                    Tensor::external(TensorDesc::new(DataType::I32, [3]), indices.ptr),
                ],
                vec![picked.clone()],
            ),
        );
        let mut expected = table[16..24].to_vec();
        expected.extend_from_slice(&table[0..8]);
        expected.extend([0.0; 8]);
        assert_eq!(download(&registry, &picked).await, expected);
    }

    #[tokio::test]
    async fn test_softmax_and_rope() {
        let Some(registry) = registry().await else {
            return;
        };
        let data = random(4 * 10);
        let out = empty(&registry, DataType::F32, &[4, 10]);
        let mut softmax = runner(single_node(SoftmaxParam::default()));
        execute(
            &registry,
            &mut softmax,
            VariantPack::new(vec![upload(&registry, &[4, 10], &data)], vec![out.clone()]),
        );
        let x = Array::from_shape_vec((4, 10), data).unwrap();
        let mut expected = x.mapv(f32::exp);
        for mut row in expected.axis_iter_mut(Axis(0)) {
            let total = row.sum();
            row.mapv_inplace(|v| v / total);
        }
        assert_close(&download(&registry, &out).await, expected.as_slice().unwrap());

        // rotate-half rope on 2 query heads and 1 key head
        let (tokens, head_dim) = (3, 4);
        let q = random(tokens * 2 * head_dim);
        let k = random(tokens * head_dim);
        let cos = random(tokens * head_dim);
        let sin = random(tokens * head_dim);
        let outputs = [
            empty(&registry, DataType::F32, &[tokens as i64, 8]),
            empty(&registry, DataType::F32, &[tokens as i64, 4]),
        ];
        let mut rope = runner(single_node(RopeParam::default()));
        execute(
            &registry,
            &mut rope,
            VariantPack::new(
                vec![
                    upload(&registry, &[tokens as i64, 8], &q),
                    upload(&registry, &[tokens as i64, 4], &k),
                    upload(&registry, &[tokens as i64, 4], &cos),
                    upload(&registry, &[tokens as i64, 4], &sin),
                ],
                outputs.to_vec(),
            ),
        );
        let rotate = |x: &[f32], heads: usize| {
            let mut out = x.to_vec();
            for t in 0..tokens {
                for h in 0..heads {
                    let base = (t * heads + h) * head_dim;
                    for j in 0..head_dim / 2 {
                        let (a, b) = (base + j, base + j + head_dim / 2);
                        let (ta, tb) = (t * head_dim + j, t * head_dim + j + head_dim / 2);
                        out[a] = x[a] * cos[ta] - x[b] * sin[ta];
                        out[b] = x[b] * cos[tb] + x[a] * sin[tb];
                    }
                }
            }
            out
        };
        assert_close(&download(&registry, &outputs[0]).await, &rotate(&q, 2));
        assert_close(&download(&registry, &outputs[1]).await, &rotate(&k, 1));
    }

    #[tokio::test]
    async fn test_pipelines_are_reused_across_shapes() {
        let Some(registry) = registry().await else {
            return;
        };
        for rows in [2, 7] {
            let data = random(rows * 4);
            let out = empty(&registry, DataType::F32, &[rows as i64, 4]);
            let mut softmax = runner(single_node(SoftmaxParam::default()));
            execute(
                &registry,
                &mut softmax,
                VariantPack::new(vec![upload(&registry, &[rows as i64, 4], &data)], vec![out]),
            );
        }
        assert_eq!(registry.cached_pipelines(), 1);
    }

    #[tokio::test]
    async fn test_misaligned_binding_is_rejected() {
        let Some(registry) = registry().await else {
            return;
        };
        let span = registry.memory().alloc(1024);
        let x = Tensor::external(TensorDesc::new(DataType::F32, Shape::from([4])), span.ptr.offset(4));
        let out = empty(&registry, DataType::F32, &[4]);
        let mut softmax = runner(single_node(SoftmaxParam::default()));
        let pack = VariantPack::new(vec![x], vec![out]);
        softmax.setup(&pack).unwrap();
        let mut stream = registry.stream();
        let err = softmax.execute(&registry, &mut stream, &pack).unwrap_err();
        assert!(err.to_string().contains("not a multiple of"), "{err}");
    }
}
