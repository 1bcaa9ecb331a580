//! Accelerator detection.
//!
//! Some backend configurations require a GPU; absence is a hard
//! precondition failure, never a silent slowdown. Detection sits behind a
//! trait so the pipeline and the backends can be tested with a simulated
//! accelerator (or the lack of one).

use std::process::Command;
use std::sync::OnceLock;

/// A detected accelerator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accelerator {
    pub name: String,
}

/// Capability for probing accelerator hardware.
pub trait AcceleratorProbe: Send + Sync {
    fn detect(&self) -> Option<Accelerator>;
}

/// Default probe: CUDA availability as candle sees it, with the device name
/// resolved through `nvidia-smi` when that tool is present.
pub struct CudaProbe {
    cached: OnceLock<Option<Accelerator>>,
}

impl CudaProbe {
    pub fn new() -> Self {
        Self {
            cached: OnceLock::new(),
        }
    }
}

impl Default for CudaProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl AcceleratorProbe for CudaProbe {
    fn detect(&self) -> Option<Accelerator> {
        self.cached
            .get_or_init(|| {
                if !candle_core::utils::cuda_is_available() {
                    return None;
                }
                Some(Accelerator {
                    name: nvidia_device_name()
                        .unwrap_or_else(|| "cuda:0".to_string()),
                })
            })
            .clone()
    }
}

/// First device name reported by `nvidia-smi`, if the tool exists.
fn nvidia_device_name() -> Option<String> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=name", "--format=csv,noheader"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let name = stdout.lines().next()?.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Probe with a fixed answer, for pipeline and backend tests.
    pub struct FixedProbe(pub Option<Accelerator>);

    impl AcceleratorProbe for FixedProbe {
        fn detect(&self) -> Option<Accelerator> {
            self.0.clone()
        }
    }

    impl FixedProbe {
        pub fn absent() -> Self {
            Self(None)
        }

        pub fn present(name: &str) -> Self {
            Self(Some(Accelerator {
                name: name.to_string(),
            }))
        }
    }
}
