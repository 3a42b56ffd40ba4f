// Device backend tests — queues, fences, buffer lifecycle, failures, and
// parity of the tiled kernels against the CPU backend.

use std::sync::{mpsc, Arc, Barrier, Mutex};
use std::time::Duration;

use vole_core::{Backend, Error, Layout, MatmulDims, Shape};
use vole_cpu::{CpuBackend, CpuDevice};
use vole_device::{DeviceBackend, DeviceConfig, DeviceContext, Grid, Kernel, Queue};

fn context() -> DeviceContext {
    DeviceContext::open(&DeviceConfig::default()).unwrap()
}

fn queue() -> Queue {
    context().queue().unwrap()
}

fn lcg(n: usize, seed: u32) -> Vec<f32> {
    let mut state = seed;
    (0..n)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 8) as f32 / (1u32 << 24) as f32 - 0.5
        })
        .collect()
}

fn logging_kernel(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>, delay: u64) -> Kernel {
    let log = Arc::clone(log);
    Kernel::new(name, Grid::linear(1, 1), move || {
        std::thread::sleep(Duration::from_millis(delay));
        log.lock().unwrap().push(name);
        Ok(())
    })
}

// ─────────────────────────────────────────────────────────────────────────
// Ordering
// ─────────────────────────────────────────────────────────────────────────

#[test]
fn test_launches_on_one_queue_run_in_order() {
    let q = queue();
    let buf = q.alloc(4).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    q.launch(logging_kernel("first", &log, 30), &[], &[&buf]).unwrap();
    q.launch(logging_kernel("second", &log, 0), &[&buf], &[]).unwrap();
    q.launch(logging_kernel("third", &log, 0), &[], &[]).unwrap();
    q.finish().unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
}

#[test]
fn test_cross_queue_fence_orders_shared_buffer() {
    let ctx = context();
    let q1 = ctx.queue().unwrap();
    let q2 = ctx.queue().unwrap();
    assert!(!q1.same_queue(&q2));

    let buf = q1.alloc(16).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    q1.launch(logging_kernel("write", &log, 50), &[], &[&buf]).unwrap();
    q2.launch(logging_kernel("read", &log, 0), &[&buf], &[]).unwrap();
    q2.finish().unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["write", "read"]);
}

#[test]
fn test_opposite_buffer_orders_on_two_queues_do_not_deadlock() {
    let ctx = context();
    let q1 = ctx.queue().unwrap();
    let q2 = ctx.queue().unwrap();
    let x = q1.alloc(4).unwrap();
    let y = q1.alloc(4).unwrap();
    let barrier = Arc::new(Barrier::new(2));
    let (tx, rx) = mpsc::channel();

    let workers: Vec<_> = [(q1, [Arc::clone(&x), Arc::clone(&y)]), (q2, [y, x])]
        .into_iter()
        .map(|(q, [first, second])| {
            let barrier = Arc::clone(&barrier);
            let tx = tx.clone();
            std::thread::spawn(move || {
                for _ in 0..300 {
                    barrier.wait();
                    let k = Kernel::new("touch", Grid::linear(1, 1), || Ok(()));
                    q.launch(k, &[&first], &[&second]).unwrap();
                }
                q.finish().unwrap();
                tx.send(()).unwrap();
            })
        })
        .collect();

    for _ in 0..2 {
        rx.recv_timeout(Duration::from_secs(20))
            .expect("queues stalled on each other");
    }
    for w in workers {
        w.join().unwrap();
    }
}

#[test]
fn test_buffer_named_as_read_and_write_is_registered_once() {
    let q = queue();
    let buf = q.alloc(2).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    q.launch(logging_kernel("inplace", &log, 0), &[&buf], &[&buf])
        .unwrap();
    q.finish().unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["inplace"]);
}

#[test]
fn test_recorded_event_completes() {
    let q = queue();
    let log = Arc::new(Mutex::new(Vec::new()));
    q.launch(logging_kernel("work", &log, 10), &[], &[]).unwrap();
    let event = q.record().unwrap();
    event.wait();
    assert!(event.is_complete());
    assert_eq!(event.queue_id(), q.id());
    assert_eq!(log.lock().unwrap().len(), 1);
}

// ─────────────────────────────────────────────────────────────────────────
// Buffer lifecycle
// ─────────────────────────────────────────────────────────────────────────

#[test]
fn test_release_is_idempotent_and_use_after_release_fails() {
    let q = queue();
    let s = DeviceBackend::from_vec(vec![1.0, 2.0, 3.0], &q).unwrap();
    s.release();
    s.release();
    assert!(s.is_released());
    let err = DeviceBackend::to_vec(&s, &Layout::contiguous(3usize)).unwrap_err();
    assert!(matches!(err, Error::BufferReleased { .. }), "{err}");
}

#[test]
fn test_rejected_launch_keeps_pending_use_of_other_buffers() {
    let ctx = context();
    let q1 = ctx.queue().unwrap();
    let q2 = ctx.queue().unwrap();
    let a = q1.alloc(4).unwrap();
    let gone = q1.alloc(4).unwrap();
    gone.release();

    let log = Arc::new(Mutex::new(Vec::new()));
    q1.launch(logging_kernel("slow", &log, 100), &[], &[&a])
        .unwrap();
    let err = q2
        .launch(logging_kernel("never", &log, 0), &[&a, &gone], &[])
        .unwrap_err();
    assert!(matches!(err, Error::BufferReleased { .. }), "{err}");

    // release still waits for the slow writer
    a.release();
    assert_eq!(*log.lock().unwrap(), vec!["slow"]);
}

#[test]
fn test_released_buffers_are_reused() {
    let ctx = context();
    let q = ctx.queue().unwrap();
    let a = DeviceBackend::zeros(&Shape::from(256usize), &q).unwrap();
    a.release();
    let stats = ctx.memory_stats();
    assert_eq!(stats.cached_buffers, 1);
    assert_eq!(stats.cached_bytes, 256 * 4);

    let b = DeviceBackend::zeros(&Shape::from(256usize), &q).unwrap();
    let after = ctx.memory_stats();
    assert_eq!(after.hits, stats.hits + 1);
    assert_eq!(after.cached_buffers, 0);
    assert_eq!(
        DeviceBackend::to_vec(&b, &Layout::contiguous(256usize)).unwrap(),
        vec![0.0; 256]
    );

    b.release();
    ctx.empty_cache();
    assert_eq!(ctx.memory_stats().cached_bytes, 0);
}

#[test]
fn test_allocation_over_budget_is_out_of_memory() {
    let ctx = DeviceContext::open(&DeviceConfig {
        memory_limit: 64,
        ..DeviceConfig::default()
    })
    .unwrap();
    let q = ctx.queue().unwrap();
    let err = DeviceBackend::zeros(&Shape::from(32usize), &q).unwrap_err();
    match err {
        Error::DeviceOutOfMemory {
            requested,
            available,
        } => {
            assert_eq!(requested, 128);
            assert_eq!(available, 64);
        }
        other => panic!("expected DeviceOutOfMemory, got {other}"),
    }
    assert!(DeviceBackend::zeros(&Shape::from(16usize), &q).is_ok());
}

// ─────────────────────────────────────────────────────────────────────────
// Failures
// ─────────────────────────────────────────────────────────────────────────

#[test]
fn test_disabled_device_is_unavailable() {
    let err = DeviceContext::open(&DeviceConfig {
        enabled: false,
        ..DeviceConfig::default()
    })
    .unwrap_err();
    assert!(matches!(err, Error::DeviceUnavailable(_)));
}

#[test]
fn test_kernel_failure_poisons_its_output() {
    let q = queue();
    let buf = q.alloc(8).unwrap();
    let boom = Kernel::new("boom", Grid::linear(1, 1), || {
        Err(Error::msg("synthetic fault"))
    });
    q.launch(boom, &[], &[&buf]).unwrap();
    q.finish().unwrap();

    let next = Kernel::new("next", Grid::linear(1, 1), || Ok(()));
    match q.launch(next, &[&buf], &[]).unwrap_err() {
        Error::DeviceKernelFailure { kernel, reason } => {
            assert_eq!(kernel, "boom");
            assert!(reason.contains("synthetic fault"), "{reason}");
        }
        other => panic!("expected DeviceKernelFailure, got {other}"),
    }
}

#[test]
fn test_panicking_kernel_is_reported() {
    let q = queue();
    let buf = q.alloc(1).unwrap();
    let bad = Kernel::new("bad", Grid::linear(1, 1), || panic!("index out of range"));
    q.launch(bad, &[], &[&buf]).unwrap();
    q.finish().unwrap();
    let err = q
        .launch(Kernel::new("after", Grid::linear(1, 1), || Ok(())), &[], &[&buf])
        .unwrap_err();
    assert!(err.to_string().contains("bad"), "{err}");
}

// ─────────────────────────────────────────────────────────────────────────
// Parity with the CPU backend
// ─────────────────────────────────────────────────────────────────────────

fn assert_close(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() <= tol, "index {i}: {a} != {e} (tol={tol})");
    }
}

#[test]
fn test_tiled_matmul_matches_cpu() {
    let q = queue();
    for (lhs_dims, rhs_dims) in [
        (vec![37, 53], vec![53, 29]),
        (vec![3, 16, 16], vec![3, 16, 16]),
        (vec![4, 5, 7], vec![7, 9]),
        (vec![1, 33], vec![33, 1]),
    ] {
        let lhs_shape = Shape::new(lhs_dims);
        let rhs_shape = Shape::new(rhs_dims);
        let (dims, out_shape) = MatmulDims::from_shapes(&lhs_shape, &rhs_shape).unwrap();
        let a = lcg(lhs_shape.elem_count(), 7);
        let b = lcg(rhs_shape.elem_count(), 11);
        let la = Layout::contiguous(lhs_shape.clone());
        let lb = Layout::contiguous(rhs_shape.clone());
        let out_layout = Layout::contiguous(out_shape.clone());

        let cpu = {
            let sa = CpuBackend::from_vec(a.clone(), &CpuDevice).unwrap();
            let sb = CpuBackend::from_vec(b.clone(), &CpuDevice).unwrap();
            let out = CpuBackend::matmul(&sa, &la, &sb, &lb, &dims).unwrap();
            CpuBackend::to_vec(&out, &out_layout).unwrap()
        };
        let dev = {
            let sa = DeviceBackend::from_vec(a, &q).unwrap();
            let sb = DeviceBackend::from_vec(b, &q).unwrap();
            let out = DeviceBackend::matmul(&sa, &la, &sb, &lb, &dims).unwrap();
            DeviceBackend::to_vec(&out, &out_layout).unwrap()
        };
        assert_close(&dev, &cpu, 1e-3);
    }
}

#[test]
fn test_transposed_operand_matches_cpu() {
    let q = queue();
    let a = lcg(6 * 4, 3);
    let b = lcg(6 * 5, 5);
    // a is stored [6, 4] and read as its transpose [4, 6]
    let la = Layout::contiguous((6, 4)).transpose(0, 1).unwrap();
    let lb = Layout::contiguous((6, 5));
    let (dims, out_shape) = MatmulDims::from_shapes(la.shape(), lb.shape()).unwrap();
    let out_layout = Layout::contiguous(out_shape);

    let sa = CpuBackend::from_vec(a.clone(), &CpuDevice).unwrap();
    let sb = CpuBackend::from_vec(b.clone(), &CpuDevice).unwrap();
    let cpu = CpuBackend::to_vec(
        &CpuBackend::matmul(&sa, &la, &sb, &lb, &dims).unwrap(),
        &out_layout,
    )
    .unwrap();

    let da = DeviceBackend::from_vec(a, &q).unwrap();
    let db = DeviceBackend::from_vec(b, &q).unwrap();
    let dev = DeviceBackend::to_vec(
        &DeviceBackend::matmul(&da, &la, &db, &lb, &dims).unwrap(),
        &out_layout,
    )
    .unwrap();
    assert_close(&dev, &cpu, 1e-4);
}

#[test]
fn test_softmax_matches_cpu() {
    let q = queue();
    let data = lcg(3 * 17, 13)
        .into_iter()
        .map(|x| x * 40.0)
        .collect::<Vec<_>>();
    let layout = Layout::contiguous((3, 17));

    let cpu = {
        let s = CpuBackend::from_vec(data.clone(), &CpuDevice).unwrap();
        let out = CpuBackend::softmax_last_dim(&s, &layout, 0.5).unwrap();
        CpuBackend::to_vec(&out, &layout).unwrap()
    };
    let dev = {
        let s = DeviceBackend::from_vec(data, &q).unwrap();
        let out = DeviceBackend::softmax_last_dim(&s, &layout, 0.5).unwrap();
        DeviceBackend::to_vec(&out, &layout).unwrap()
    };
    assert_close(&dev, &cpu, 1e-5);
    for row in dev.chunks(17) {
        assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }
}
