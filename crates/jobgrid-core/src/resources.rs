//! Resource accounting types.
//!
//! `Resources` is the unit every capacity decision is made in: CPU cores,
//! memory and disk bytes, and a GPU count with optional per-GPU
//! descriptors. Arithmetic never goes negative; removing more than is held
//! is reported as [`CoreError::ResourceUnderflow`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::quantity;

/// Tolerance for floating point CPU comparisons.
const CPU_EPSILON: f64 = 1e-9;

/// GPU vendor as reported by discovery tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    #[default]
    Unknown,
}

/// A single physical GPU.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gpu {
    /// Device index on the host.
    pub index: u64,
    pub name: String,
    pub vendor: GpuVendor,
    /// Device memory in bytes.
    pub memory: u64,
}

/// A bundle of compute resources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    /// CPU cores (fractional).
    pub cpu: f64,
    /// Memory in bytes.
    pub memory: u64,
    /// Disk in bytes.
    pub disk: u64,
    /// Number of GPUs.
    pub gpu: u64,
    /// Specific GPUs, ordered by index. May be empty when only a count is known.
    #[serde(default)]
    pub gpus: Vec<Gpu>,
}

impl Resources {
    pub fn new(cpu: f64, memory: u64, disk: u64, gpu: u64) -> Self {
        Self {
            cpu,
            memory,
            disk,
            gpu,
            gpus: Vec::new(),
        }
    }

    pub fn with_gpus(mut self, gpus: Vec<Gpu>) -> Self {
        self.gpu = gpus.len() as u64;
        self.gpus = gpus;
        self.gpus.sort_by_key(|g| g.index);
        self
    }

    /// Component-wise sum.
    pub fn add(&self, other: &Resources) -> Resources {
        let mut gpus = self.gpus.clone();
        for gpu in &other.gpus {
            if !gpus.iter().any(|g| g.index == gpu.index) {
                gpus.push(gpu.clone());
            }
        }
        gpus.sort_by_key(|g| g.index);

        Resources {
            cpu: self.cpu + other.cpu,
            memory: self.memory.saturating_add(other.memory),
            disk: self.disk.saturating_add(other.disk),
            gpu: self.gpu.saturating_add(other.gpu),
            gpus,
        }
    }

    /// Component-wise difference; fails if any dimension would go negative.
    pub fn checked_sub(&self, other: &Resources) -> CoreResult<Resources> {
        if other.cpu > self.cpu + CPU_EPSILON
            || other.memory > self.memory
            || other.disk > self.disk
            || other.gpu > self.gpu
        {
            return Err(CoreError::ResourceUnderflow {
                available: self.to_string(),
                remove: other.to_string(),
            });
        }

        let gpus = self
            .gpus
            .iter()
            .filter(|g| !other.gpus.iter().any(|o| o.index == g.index))
            .cloned()
            .collect();

        Ok(Resources {
            cpu: (self.cpu - other.cpu).max(0.0),
            memory: self.memory - other.memory,
            disk: self.disk - other.disk,
            gpu: self.gpu - other.gpu,
            gpus,
        })
    }

    /// True if every dimension of `self` fits within `other`.
    pub fn less_than_eq(&self, other: &Resources) -> bool {
        self.cpu <= other.cpu + CPU_EPSILON
            && self.memory <= other.memory
            && self.disk <= other.disk
            && self.gpu <= other.gpu
    }

    pub fn is_zero(&self) -> bool {
        self.cpu.abs() < CPU_EPSILON && self.memory == 0 && self.disk == 0 && self.gpu == 0
    }

    /// Component-wise maximum. GPU descriptors follow the larger GPU count.
    pub fn max(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu.max(other.cpu),
            memory: self.memory.max(other.memory),
            disk: self.disk.max(other.disk),
            gpu: self.gpu.max(other.gpu),
            gpus: if other.gpu > self.gpu {
                other.gpus.clone()
            } else {
                self.gpus.clone()
            },
        }
    }

    /// Keep `self`'s value only in the dimensions that are non-zero in `other`.
    pub fn intersect(&self, other: &Resources) -> Resources {
        Resources {
            cpu: if other.cpu.abs() < CPU_EPSILON { 0.0 } else { self.cpu },
            memory: if other.memory == 0 { 0 } else { self.memory },
            disk: if other.disk == 0 { 0 } else { self.disk },
            gpu: if other.gpu == 0 { 0 } else { self.gpu },
            gpus: if other.gpu == 0 { Vec::new() } else { self.gpus.clone() },
        }
    }

    /// Fill the zero dimensions of `self` from `defaults`.
    pub fn merge(&self, defaults: &Resources) -> Resources {
        let use_default_gpu = self.gpu == 0;
        Resources {
            cpu: if self.cpu.abs() < CPU_EPSILON { defaults.cpu } else { self.cpu },
            memory: if self.memory == 0 { defaults.memory } else { self.memory },
            disk: if self.disk == 0 { defaults.disk } else { self.disk },
            gpu: if use_default_gpu { defaults.gpu } else { self.gpu },
            gpus: if use_default_gpu {
                defaults.gpus.clone()
            } else {
                self.gpus.clone()
            },
        }
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{cpu: {}, memory: {}, disk: {}, gpu: {}}}",
            self.cpu,
            quantity::format_bytes(self.memory),
            quantity::format_bytes(self.disk),
            self.gpu
        )
    }
}

/// Resource quantities as written in job specs and config files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    /// CPU cores, e.g. `"2"` or `"500m"`.
    pub cpu: Option<String>,
    /// Memory, e.g. `"512Mi"`.
    pub memory: Option<String>,
    /// Disk, e.g. `"10Gi"`.
    pub disk: Option<String>,
    /// GPU count, e.g. `"1"`.
    pub gpu: Option<String>,
}

impl ResourcesConfig {
    pub fn to_resources(&self) -> CoreResult<Resources> {
        Ok(Resources {
            cpu: quantity::parse_cpu(self.cpu.as_deref().unwrap_or_default())?,
            memory: quantity::parse_bytes(self.memory.as_deref().unwrap_or_default())?,
            disk: quantity::parse_bytes(self.disk.as_deref().unwrap_or_default())?,
            gpu: quantity::parse_gpu(self.gpu.as_deref().unwrap_or_default())?,
            gpus: Vec::new(),
        })
    }

    /// Convenience constructor used by tests and the devstack.
    pub fn new(cpu: &str, memory: &str) -> Self {
        Self {
            cpu: Some(cpu.to_string()),
            memory: Some(memory.to_string()),
            disk: None,
            gpu: None,
        }
    }
}
