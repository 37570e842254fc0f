//! Engine configuration with builder pattern

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::{OperatingSystem, PoolKey, Region};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub circuit: CircuitConfig,
    pub retry: RetryConfig,
    pub lifecycle: LifecycleConfig,
    pub pools: PoolsConfig,
    pub monitor: MonitorConfig,
    pub provisioning: ProvisioningConfig,
    pub directory: DirectoryConfig,
    pub regions: RegionsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before allowing trial calls
    pub open_timeout_secs: u64,
    /// Consecutive half-open successes that close the circuit
    pub success_threshold: u32,
    /// Concurrent trial calls admitted while half-open
    pub half_open_max_calls: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout_secs: 30,
            success_threshold: 2,
            half_open_max_calls: 2,
        }
    }
}

impl CircuitConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 16_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub sweep_interval_secs: u64,
    pub default_auto_stop_minutes: u32,
    pub stale_after_days: u32,
    pub stale_grace_days: u32,
    pub default_max_lifetime_days: u32,
    /// Permanent customization failures tolerated before a pending workspace is terminated
    pub max_customization_failures: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 300,
            default_auto_stop_minutes: 60,
            stale_after_days: 30,
            stale_grace_days: 7,
            default_max_lifetime_days: 365,
            max_customization_failures: 3,
        }
    }
}

/// Target band for one (template, OS) pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSpec {
    pub template_id: String,
    pub os: OperatingSystem,
    pub min: usize,
    pub max: usize,
    /// Absolute upper bound for demand-driven growth of `max`
    pub ceiling: usize,
}

impl PoolSpec {
    pub fn new(template_id: impl Into<String>, os: OperatingSystem) -> Self {
        Self {
            template_id: template_id.into(),
            os,
            min: 2,
            max: 10,
            ceiling: 50,
        }
    }

    pub fn min(mut self, n: usize) -> Self {
        self.min = n;
        self
    }

    pub fn max(mut self, n: usize) -> Self {
        self.max = n;
        self
    }

    pub fn ceiling(mut self, n: usize) -> Self {
        self.ceiling = n;
        self
    }

    pub fn key(&self) -> PoolKey {
        PoolKey::new(self.template_id.clone(), self.os)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolsConfig {
    pub pools: Vec<PoolSpec>,
    pub sweep_interval_secs: u64,
    /// Trailing window for the assignment-rate measurement
    pub demand_window_minutes: u32,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            pools: Vec::new(),
            sweep_interval_secs: 60,
            demand_window_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub sla_threshold_secs: u64,
    /// Number of most recent samples kept for percentiles
    pub sample_window: usize,
    pub emit_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sla_threshold_secs: 300,
            sample_window: 1_000,
            emit_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    pub poll_interval_ms: u64,
    pub ready_timeout_secs: u64,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            ready_timeout_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub max_attempts: u32,
    pub poll_interval_ms: u64,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            poll_interval_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionsConfig {
    pub default_region: String,
    /// Serving regions; the built-in catalog is used when empty
    pub catalog: Vec<Region>,
}

impl Default for RegionsConfig {
    fn default() -> Self {
        Self {
            default_region: "us-east-1".into(),
            catalog: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file; missing sections take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn pool(mut self, spec: PoolSpec) -> Self {
        self.pools.pools.push(spec);
        self
    }

    pub fn circuit(mut self, circuit: CircuitConfig) -> Self {
        self.circuit = circuit;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn lifecycle(mut self, lifecycle: LifecycleConfig) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn default_region(mut self, region: impl Into<String>) -> Self {
        self.regions.default_region = region.into();
        self
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.circuit.failure_threshold == 0 {
            return Err(crate::Error::Config("circuit.failure_threshold must be at least 1".into()));
        }
        if self.circuit.success_threshold == 0 {
            return Err(crate::Error::Config("circuit.success_threshold must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(crate::Error::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(crate::Error::Config("retry.base_delay_ms exceeds retry.max_delay_ms".into()));
        }
        for spec in &self.pools.pools {
            if spec.min > spec.max {
                return Err(crate::Error::Config(format!(
                    "pool {}: min ({}) exceeds max ({})",
                    spec.key(),
                    spec.min,
                    spec.max
                )));
            }
            if spec.max > spec.ceiling {
                return Err(crate::Error::Config(format!(
                    "pool {}: max ({}) exceeds ceiling ({})",
                    spec.key(),
                    spec.max,
                    spec.ceiling
                )));
            }
        }
        if self.regions.default_region.is_empty() {
            return Err(crate::Error::Config("regions.default_region cannot be empty".into()));
        }
        Ok(())
    }
}
