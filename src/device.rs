// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! Device selection.
//!
//! Tensors live in host memory, so every requested accelerator resolves to the CPU.
//! The CUDA variant is still parsed so that existing command lines keep working.
use std::fmt;
use std::str::FromStr;

/// Hardware device requested for training or analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    /// CPU (Central Processing Unit).
    Cpu,
    /// CUDA (Compute Unified Device Architecture) for NVIDIA GPUs.
    /// The argument specifies the device index (e.g., 0 for the first GPU).
    Cuda(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(i) => write!(f, "cuda:{i}"),
        }
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.to_lowercase();
        if s == "cpu" {
            return Ok(Self::Cpu);
        }
        // Bare indices ("0", "1") select a GPU
        if let Ok(index) = s.parse::<usize>() {
            return Ok(Self::Cuda(index));
        }
        s.strip_prefix("cuda").map_or_else(
            || Err(format!("Unknown device: {s}")),
            |rest| Ok(Self::Cuda(parse_device_index(rest).unwrap_or(0))),
        )
    }
}

impl Device {
    /// Resolve the device that will actually run the computation.
    ///
    /// `use_cpu` forces the CPU. A CUDA request falls back to the CPU; the returned
    /// flag tells the caller whether a fallback happened so it can warn.
    #[must_use]
    pub const fn resolve(requested: Option<Self>, use_cpu: bool) -> (Self, bool) {
        match requested {
            _ if use_cpu => (Self::Cpu, false),
            Some(Self::Cuda(_)) => (Self::Cpu, true),
            _ => (Self::Cpu, false),
        }
    }
}

/// Helper to parse device index from string (e.g. ":0")
fn parse_device_index(s: &str) -> Option<usize> {
    if s.is_empty() {
        return None;
    }
    s.strip_prefix(':')
        .and_then(|index_str| index_str.parse::<usize>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device() {
        assert_eq!(Device::from_str("cpu").unwrap(), Device::Cpu);
        assert_eq!(Device::from_str("CPU").unwrap(), Device::Cpu);
        assert_eq!(Device::from_str("cuda").unwrap(), Device::Cuda(0));
        assert_eq!(Device::from_str("cuda:1").unwrap(), Device::Cuda(1));
        assert_eq!(Device::from_str("0").unwrap(), Device::Cuda(0));
        assert!(Device::from_str("tpu").is_err());
    }

    #[test]
    fn test_resolve_falls_back_to_cpu() {
        assert_eq!(Device::resolve(None, false), (Device::Cpu, false));
        assert_eq!(Device::resolve(Some(Device::Cuda(0)), false), (Device::Cpu, true));
        assert_eq!(Device::resolve(Some(Device::Cuda(0)), true), (Device::Cpu, false));
        assert_eq!(Device::to_string(&Device::Cuda(2)), "cuda:2");
    }
}
