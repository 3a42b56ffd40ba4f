// Integration tests for tensor serialization.

use std::path::PathBuf;

use vole::prelude::*;
use vole::DeviceConfig;

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("vole-{}-{name}.bin", std::process::id()))
}

#[test]
fn test_save_load_round_trip() -> vole::Result<()> {
    let t = Tensor::randn((2, 3, 4), Some(17), &Device::Cpu)?;
    let path = temp_path("round-trip");
    t.save(&path)?;
    let back = Tensor::load(&path, &Device::Cpu)?;
    std::fs::remove_file(&path)?;

    assert_eq!(back.dims(), t.dims());
    assert_eq!(back.to_vec()?, t.to_vec()?);
    assert!(!back.requires_grad());
    Ok(())
}

#[test]
fn test_saved_view_is_written_row_major() -> vole::Result<()> {
    let t = Tensor::from_data((0..6).map(|i| i as f32).collect(), (2, 3), &Device::Cpu)?;
    let mut bytes = Vec::new();
    t.t()?.write_to(&mut bytes)?;
    let back = Tensor::read_from(&mut bytes.as_slice(), &Device::Cpu)?;
    assert_eq!(back.dims(), &[3, 2]);
    assert_eq!(back.to_vec()?, vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    Ok(())
}

#[test]
fn test_scalar_and_special_values() -> vole::Result<()> {
    let t = Tensor::from_data(vec![f32::INFINITY, -0.0, f32::MIN_POSITIVE], [3], &Device::Cpu)?;
    let mut bytes = Vec::new();
    t.write_to(&mut bytes)?;
    let back = Tensor::read_from(&mut bytes.as_slice(), &Device::Cpu)?.to_vec()?;
    assert_eq!(back[0], f32::INFINITY);
    assert!(back[1] == 0.0 && back[1].is_sign_negative());
    assert_eq!(back[2], f32::MIN_POSITIVE);

    let s = Tensor::scalar(7.5, &Device::Cpu)?;
    let mut bytes = Vec::new();
    s.write_to(&mut bytes)?;
    assert_eq!(bytes.len(), 4 + 4 + 4);
    assert_eq!(Tensor::read_from(&mut bytes.as_slice(), &Device::Cpu)?.to_scalar()?, 7.5);
    Ok(())
}

#[test]
fn test_load_onto_device() -> vole::Result<()> {
    let dev = Device::open(&DeviceConfig::default())?;
    let t = Tensor::randn((4, 4), Some(18), &dev)?;
    let mut bytes = Vec::new();
    t.write_to(&mut bytes)?;
    let back = Tensor::read_from(&mut bytes.as_slice(), &dev)?;
    assert_eq!(back.kind(), BackendKind::Device);
    assert_eq!(back.to_vec()?, t.to_vec()?);
    Ok(())
}

#[test]
fn test_corrupt_headers_are_rejected() {
    let mut huge_rank = b"VOLE".to_vec();
    huge_rank.extend_from_slice(&1000u32.to_le_bytes());
    assert!(matches!(
        Tensor::read_from(&mut huge_rank.as_slice(), &Device::Cpu),
        Err(Error::Format(_))
    ));

    let mut zero_dim = b"VOLE".to_vec();
    zero_dim.extend_from_slice(&1u32.to_le_bytes());
    zero_dim.extend_from_slice(&0u64.to_le_bytes());
    assert!(matches!(
        Tensor::read_from(&mut zero_dim.as_slice(), &Device::Cpu),
        Err(Error::Format(_))
    ));

    assert!(matches!(
        Tensor::load(temp_path("missing"), &Device::Cpu),
        Err(Error::Io(_))
    ));
}

fn header(dims: &[u64]) -> Vec<u8> {
    let mut bytes = b"VOLE".to_vec();
    bytes.extend_from_slice(&(dims.len() as u32).to_le_bytes());
    for d in dims {
        bytes.extend_from_slice(&d.to_le_bytes());
    }
    bytes
}

#[test]
fn test_oversized_header_fails_without_allocating() {
    let overflowing = header(&[1 << 31, 1 << 31]);
    let err = Tensor::read_from(&mut overflowing.as_slice(), &Device::Cpu).unwrap_err();
    assert!(matches!(err, Error::Format(_)), "{err}");

    // representable but far larger than the payload that follows
    let mut huge = header(&[1 << 20, 1 << 20]);
    huge.extend_from_slice(&1.0f32.to_le_bytes());
    let err = Tensor::read_from(&mut huge.as_slice(), &Device::Cpu).unwrap_err();
    assert!(matches!(err, Error::Io(_)), "{err}");
}

#[test]
fn test_payload_spanning_several_chunks_round_trips() -> vole::Result<()> {
    let t = Tensor::randn((300, 500), Some(9), &Device::Cpu)?;
    let mut bytes = Vec::new();
    t.write_to(&mut bytes)?;
    let back = Tensor::read_from(&mut bytes.as_slice(), &Device::Cpu)?;
    assert_eq!(back.dims(), &[300, 500]);
    assert_eq!(back.to_vec()?, t.to_vec()?);
    Ok(())
}
