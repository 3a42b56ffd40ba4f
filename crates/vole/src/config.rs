use std::str::FromStr;

use vole_core::{Error, Result};
use vole_cpu::CpuConfig;
use vole_device::DeviceConfig;

/// Runtime configuration for both backends.
///
/// ```ignore
/// let config = vole::Config::from_env()?;
/// vole::init(&config);
/// let device = vole::Device::best_available(&config);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub cpu: CpuConfig,
    pub device: DeviceConfig,
}

impl Config {
    /// Defaults overridden by environment variables:
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `VOLE_NUM_THREADS` | `cpu.num_threads` |
    /// | `VOLE_MATMUL_THRESHOLD` | `cpu.matmul_threshold` |
    /// | `VOLE_DEVICE` (`on`/`off`) | `device.enabled` |
    /// | `VOLE_DEVICE_MEMORY` (bytes) | `device.memory_limit` |
    /// | `VOLE_DEVICE_COMPUTE_UNITS` | `device.compute_units` |
    /// | `VOLE_DEVICE_TILE` | `device.tile` |
    pub fn from_env() -> Result<Config> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config> {
        let mut config = Config::default();
        if let Some(n) = parse(&lookup, "VOLE_NUM_THREADS")? {
            config.cpu.num_threads = Some(n);
        }
        if let Some(t) = parse(&lookup, "VOLE_MATMUL_THRESHOLD")? {
            config.cpu.matmul_threshold = t;
        }
        if let Some(v) = lookup("VOLE_DEVICE") {
            config.device.enabled = match v.trim().to_ascii_lowercase().as_str() {
                "1" | "on" | "true" | "yes" => true,
                "0" | "off" | "false" | "no" => false,
                other => {
                    return Err(Error::msg(format!(
                        "VOLE_DEVICE: expected on/off, got `{other}`"
                    )))
                }
            };
        }
        if let Some(bytes) = parse(&lookup, "VOLE_DEVICE_MEMORY")? {
            config.device.memory_limit = bytes;
        }
        if let Some(units) = parse(&lookup, "VOLE_DEVICE_COMPUTE_UNITS")? {
            config.device.compute_units = Some(units);
        }
        if let Some(tile) = parse(&lookup, "VOLE_DEVICE_TILE")? {
            config.device.tile = tile;
        }
        Ok(config)
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::msg(format!("{name}: cannot parse `{raw}`: {e}"))),
    }
}

/// Apply the CPU side of `config`. Call before the first operation for the
/// thread count to take effect.
pub fn init(config: &Config) {
    vole_cpu::configure(&config.cpu);
    log::debug!(
        "vole initialised: cpu threads {:?}, matmul threshold {}, device {}",
        config.cpu.num_threads,
        config.cpu.matmul_threshold,
        if config.device.enabled { "enabled" } else { "disabled" }
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("VOLE_NUM_THREADS", "3"),
            ("VOLE_DEVICE", "off"),
            ("VOLE_DEVICE_TILE", " 8 "),
        ]))
        .unwrap();
        assert_eq!(config.cpu.num_threads, Some(3));
        assert!(!config.device.enabled);
        assert_eq!(config.device.tile, 8);
    }

    #[test]
    fn test_bad_value_names_variable() {
        let err = Config::from_lookup(lookup(&[("VOLE_DEVICE_MEMORY", "lots")])).unwrap_err();
        assert!(err.to_string().contains("VOLE_DEVICE_MEMORY"));
    }
}
