//! Process health sampling for dispatch backpressure.

use std::sync::Mutex;

use sysinfo::{Pid, System};
use tracing::warn;

/// One reading of process resource usage.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HealthSample {
    /// Resident memory in megabytes.
    pub memory_mb: f64,
    /// CPU usage in percent of one core.
    pub cpu_percent: f32,
}

/// Source of health samples consulted before every dispatch cycle.
pub trait HealthProbe: Send + Sync {
    /// Take a fresh sample.
    fn sample(&self) -> HealthSample;
}

/// Samples the current process through `sysinfo`.
pub struct SysinfoProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SysinfoProbe {
    /// Create a probe bound to the current process.
    #[must_use]
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(err) => {
                warn!(err, "cannot resolve current pid; health probe reports zero usage");
                None
            }
        };
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthProbe for SysinfoProbe {
    #[allow(clippy::cast_precision_loss)] // Memory in MB fits comfortably in f64.
    fn sample(&self) -> HealthSample {
        let Some(pid) = self.pid else {
            return HealthSample::default();
        };
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !system.refresh_process(pid) {
            return HealthSample::default();
        }
        system
            .process(pid)
            .map_or_else(HealthSample::default, |process| HealthSample {
                memory_mb: process.memory() as f64 / (1024.0 * 1024.0),
                cpu_percent: process.cpu_usage(),
            })
    }
}

/// A probe that always reports the same sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticProbe(pub HealthSample);

impl HealthProbe for StaticProbe {
    fn sample(&self) -> HealthSample {
        self.0
    }
}
