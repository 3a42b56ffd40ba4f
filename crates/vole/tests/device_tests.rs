// Integration tests for the device backend through the tensor façade:
// parity with the CPU, transfers, mixed-backend errors, buffer release and
// autograd on device tensors.

use vole::prelude::*;
use vole::DeviceConfig;

fn device() -> Device {
    Device::open(&DeviceConfig::default()).unwrap()
}

fn assert_close(a: &Tensor, b: &Tensor, tol: f32) {
    assert_eq!(a.dims(), b.dims());
    let (a, b) = (a.to_vec().unwrap(), b.to_vec().unwrap());
    for (i, (x, y)) in a.iter().zip(&b).enumerate() {
        assert!((x - y).abs() <= tol, "index {i}: {x} vs {y}");
    }
}

#[test]
fn test_best_available_falls_back_to_cpu() {
    let mut config = Config::default();
    config.device.enabled = false;
    assert!(Device::best_available(&config).is_cpu());
    config.device.enabled = true;
    assert_eq!(Device::best_available(&config).kind(), BackendKind::Device);
}

#[test]
fn test_transfer_round_trip() -> vole::Result<()> {
    let dev = device();
    let x = Tensor::randn((3, 5), Some(9), &Device::Cpu)?;
    let d = x.to(&dev)?;
    assert_eq!(d.kind(), BackendKind::Device);
    let back = d.to(&Device::Cpu)?;
    assert_eq!(back.to_vec()?, x.to_vec()?);

    // same device is a cheap handle copy
    assert!(d.to(&dev)?.shares_storage(&d));
    Ok(())
}

#[test]
fn test_transfer_of_strided_view() -> vole::Result<()> {
    let x = Tensor::from_data((0..6).map(|i| i as f32).collect(), (2, 3), &Device::Cpu)?;
    let d = x.t()?.to(&device())?;
    assert!(d.is_contiguous());
    assert_eq!(d.to_vec()?, vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    Ok(())
}

#[test]
fn test_mixed_backends_fail_fast() -> vole::Result<()> {
    let a = Tensor::ones((2, 2), &Device::Cpu)?;
    let b = Tensor::ones((2, 2), &device())?;
    let err = a.add(&b).unwrap_err();
    assert!(matches!(err, Error::BackendMismatch { .. }), "{err}");
    assert!(a.matmul(&b).is_err());
    assert!(Tensor::cat(&[&a, &b], 0).is_err());
    Ok(())
}

#[test]
fn test_ops_match_cpu() -> vole::Result<()> {
    let dev = device();
    let a = Tensor::randn((4, 6, 5), Some(1), &Device::Cpu)?;
    let b = Tensor::randn((5, 7), Some(2), &Device::Cpu)?;
    let bias = Tensor::randn([7], Some(3), &Device::Cpu)?;
    let (da, db, dbias) = (a.to(&dev)?, b.to(&dev)?, bias.to(&dev)?);

    let cpu = a.matmul(&b)?.add(&bias)?.gelu()?.softmax()?;
    let gpu = da.matmul(&db)?.add(&dbias)?.gelu()?.softmax()?;
    assert_close(&gpu, &cpu, 1e-5);

    assert_close(&da.sum(1, false)?, &a.sum(1, false)?, 1e-4);
    assert_close(&da.max(2, true)?, &a.max(2, true)?, 0.0);
    assert_close(&da.argmin_dim(0, false)?, &a.argmin_dim(0, false)?, 0.0);
    assert_close(&da.transpose(0, 2)?.exp()?, &a.transpose(0, 2)?.exp()?, 1e-5);
    assert_close(
        &da.slice(&[SliceRange::from(1..3)])?,
        &a.slice(&[SliceRange::from(1..3)])?,
        0.0,
    );
    Ok(())
}

#[test]
fn test_conv2d_matches_cpu() -> vole::Result<()> {
    let dev = device();
    let x = Tensor::randn((2, 3, 8, 8), Some(4), &Device::Cpu)?;
    let w = Tensor::randn((4, 3, 3, 3), Some(5), &Device::Cpu)?;
    let cpu = x.conv2d(&w, None, [2, 2], [1, 1])?;
    let gpu = x.to(&dev)?.conv2d(&w.to(&dev)?, None, [2, 2], [1, 1])?;
    assert_close(&gpu, &cpu, 1e-4);
    Ok(())
}

#[test]
fn test_gradients_match_cpu() -> vole::Result<()> {
    let dev = device();
    let x = Tensor::randn((3, 4), Some(6), &Device::Cpu)?;
    let w = Tensor::randn((4, 2), Some(7), &Device::Cpu)?;

    let run = |x: &Tensor, w: &Tensor| -> vole::Result<(Tensor, Tensor)> {
        let x = x.clone().with_grad();
        let w = w.clone().with_grad();
        x.matmul(&w)?.tanh()?.powf(2.0)?.sum_all()?.backward()?;
        Ok((x.grad().unwrap(), w.grad().unwrap()))
    };
    let (gx, gw) = run(&x, &w)?;
    let (dgx, dgw) = run(&x.to(&dev)?, &w.to(&dev)?)?;
    assert_eq!(dgx.kind(), BackendKind::Device);
    assert_close(&dgx, &gx, 1e-4);
    assert_close(&dgw, &gw, 1e-4);
    Ok(())
}

#[test]
fn test_in_place_on_device_view() -> vole::Result<()> {
    let t = Tensor::zeros((3, 3), &device())?;
    t.narrow(1, 0, 1)?.fill_(1.0)?;
    t.set(&[2, 2], 5.0)?;
    assert_eq!(t.get(&[2, 2])?, 5.0);
    assert_eq!(
        t.to_vec()?,
        vec![1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 5.0]
    );
    Ok(())
}

#[test]
fn test_release_then_use_fails() -> vole::Result<()> {
    let t = Tensor::ones((4, 4), &device())?;
    let view = t.t()?;
    t.release();
    t.release();
    assert!(t.is_released() && view.is_released());
    assert!(matches!(view.to_vec(), Err(Error::BufferReleased { .. })));
    assert!(t.add_scalar(1.0).is_err());

    // release on the cpu is a no-op
    let c = Tensor::ones([2], &Device::Cpu)?;
    c.release();
    assert!(!c.is_released());
    assert_eq!(c.to_vec()?, vec![1.0, 1.0]);
    Ok(())
}

#[test]
fn test_device_out_of_memory() {
    let dev = Device::open(&DeviceConfig {
        memory_limit: 1024,
        ..DeviceConfig::default()
    })
    .unwrap();
    let err = Tensor::zeros((32, 32), &dev).unwrap_err();
    assert!(matches!(err, Error::DeviceOutOfMemory { .. }), "{err}");
    assert!(!err.is_recoverable());
}
