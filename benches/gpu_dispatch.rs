use std::sync::Arc;
use std::time::Instant;

use criterion::async_executor::FuturesExecutor;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use futures::executor::block_on;
use wgpu_kernel_graph::{
    gpu::{Device, DeviceMemory, WgpuRegistry},
    graphs::{self, AddNorm, AddNormParam},
    Context, DataType, RunnerPool, Tensor, TensorDesc, VariantPack,
};

const ROWS: [i64; 4] = [1, 64, 1024, 8192];
const HIDDEN: i64 = 1024;

fn tensor(registry: &WgpuRegistry, shape: &[i64]) -> Tensor {
    let desc = TensorDesc::new(DataType::F32, shape);
    let span = registry.memory().alloc(desc.byte_size().unwrap());
    Tensor::external(desc, span.ptr)
}

fn add_norm(c: &mut Criterion) {
    env_logger::init();

    let device = match block_on(Device::new()) {
        Ok(device) => device,
        Err(err) => {
            eprintln!("skipping gpu benchmarks: {err}");
            return;
        }
    };
    let pool = graphs::register(RunnerPool::builder()).build().unwrap();
    let context = Context::new(WgpuRegistry::new(DeviceMemory::new(&device)), Arc::new(pool));
    let registry = context.registry();

    let mut group = c.benchmark_group("add-norm-wgpu");
    for rows in ROWS {
        let pack = VariantPack::new(
            vec![
                tensor(registry, &[rows, HIDDEN]),
                tensor(registry, &[rows, HIDDEN]),
                tensor(registry, &[HIDDEN]),
                tensor(registry, &[HIDDEN]),
            ],
            vec![tensor(registry, &[rows, HIDDEN])],
        );
        let (runner, workspace) = context
            .setup::<AddNorm>(&AddNormParam::default(), &pack)
            .unwrap();
        drop(runner);
        let pack = pack.with_workspace(registry.memory().alloc(workspace));

        group.bench_with_input(BenchmarkId::new("add-norm-wgpu", rows), &pack, |b, pack| {
            b.to_async(FuturesExecutor).iter_custom(|iters| {
                let context = &context;
                async move {
                    let mut stream = context.registry().stream();
                    let start = Instant::now();
                    for _ in 0..iters {
                        context
                            .run::<AddNorm>(&AddNormParam::default(), pack, &mut stream)
                            .unwrap();
                    }
                    stream.synchronize();
                    start.elapsed()
                }
            })
        });
    }
    group.finish();
}

criterion_group!(benches, add_norm);
criterion_main!(benches);
