use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use vole::{Device, DeviceConfig, Tensor};

fn bench_matmul(c: &mut Criterion, name: &str, device: &Device) {
    let mut group = c.benchmark_group(name);
    for n in [64usize, 128, 256] {
        let a = Tensor::random((n, n), Some(1), device).unwrap();
        let b = Tensor::random((n, n), Some(2), device).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |bencher, _| {
            bencher.iter(|| black_box(a.matmul(&b).unwrap().to_vec().unwrap()));
        });
    }
    group.finish();
}

fn bench_cpu_matmul(c: &mut Criterion) {
    bench_matmul(c, "cpu_matmul", &Device::Cpu);
}

fn bench_device_matmul(c: &mut Criterion) {
    let device = Device::open(&DeviceConfig::default()).unwrap();
    bench_matmul(c, "device_matmul", &device);
}

fn bench_cpu_batched_matmul(c: &mut Criterion) {
    let a = Tensor::random((16, 64, 64), Some(3), &Device::Cpu).unwrap();
    let b = Tensor::random((64, 64), Some(4), &Device::Cpu).unwrap();
    c.bench_function("cpu_batched_matmul_16x64x64", |bencher| {
        bencher.iter(|| black_box(a.matmul(&b).unwrap()));
    });
}

fn bench_cpu_matmul_backward(c: &mut Criterion) {
    let x = Tensor::random((128, 128), Some(5), &Device::Cpu).unwrap();
    let w = Tensor::random((128, 128), Some(6), &Device::Cpu)
        .unwrap()
        .with_grad();
    c.bench_function("cpu_matmul_backward_128", |bencher| {
        bencher.iter(|| {
            w.zero_grad();
            x.matmul(&w).unwrap().sum_all().unwrap().backward().unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_cpu_matmul,
    bench_device_matmul,
    bench_cpu_batched_matmul,
    bench_cpu_matmul_backward
);
criterion_main!(benches);
