use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use dnn_layers::{
    engine::HostEngine,
    factory::LayerFactory,
    layer::{Conv2dParams, Convolution2D},
};
use layer_benches::LeNet5;
use num_format::{Locale, ToFormattedString};
use std::sync::Arc;

fn factory(blocked: bool) -> LayerFactory {
    let engine = HostEngine::builder().blocked(blocked).build().unwrap();
    LayerFactory::with_engine(Arc::new(engine))
}

pub fn criterion_benchmark(c: &mut Criterion) {
    {
        let batch_size = 100;
        let mut g = c.benchmark_group(format!(
            "LeNet5(training, batch_size = {})",
            batch_size.to_formatted_string(&Locale::en)
        ));
        let model = LeNet5::new(batch_size);
        for blocked in [false, true] {
            let name = if blocked { "blocked" } else { "plain" };
            g.bench_function(BenchmarkId::new("cached", name), |b| {
                let factory = factory(blocked);
                b.iter(|| model.train(&factory).unwrap());
            });
        }
        g.bench_function(BenchmarkId::new("uncached", "blocked"), |b| {
            b.iter(|| model.train(&factory(true)).unwrap());
        });
    }
    {
        let mut g = c.benchmark_group("conv2d(64, 32x32, 3x3)");
        let params = Conv2dParams::new([16, 64, 32, 32], [64, 64, 3, 3])
            .with_bias(Some(64))
            .with_padding([1, 1], [1, 1]);
        let x = vec![0.5f32; 16 * 64 * 32 * 32];
        let w = vec![0.01f32; 64 * 64 * 9];
        let bias = vec![0f32; 64];
        let mut y = vec![0f32; x.len()];
        for blocked in [false, true] {
            let name = if blocked { "blocked" } else { "plain" };
            let factory = factory(blocked);
            g.bench_function(BenchmarkId::new("forward", name), |b| {
                b.iter(|| {
                    Convolution2D::do_forward(&factory, &params, &x, &w, Some(bias.as_slice()), &mut y)
                        .unwrap();
                });
            });
        }
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
