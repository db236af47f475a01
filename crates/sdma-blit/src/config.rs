use thiserror::Error;

use sdma_protocol::HdpFlushRegisters;

use crate::memory::PAGE_SIZE;
use crate::queue::{QueueKind, QueuePriority};

pub const HDP_FLUSH_ENV: &str = "HSA_ENABLE_SDMA_HDP_FLUSH";
pub const WAIT_IDLE_ENV: &str = "HSA_SDMA_WAIT_IDLE";

pub const DEFAULT_RING_SIZE: u64 = 1024 * 1024;
pub const MIN_RING_SIZE: u64 = 4096;
pub const DEFAULT_FENCE_POOL_SIZE: u32 = 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for env var {var}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("ring size {0} must be a power of two of at least 4 KiB")]
    InvalidRingSize(u64),
    #[error("fence pool size {0} must be a non-zero power of two")]
    InvalidFencePoolSize(u32),
}

/// Which side of the PCIe bus the data moves across; decides where the HDP
/// flush goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopyDirection {
    /// Host writes must be flushed out of HDP before the engine reads them.
    HostToDevice,
    /// The engine's writes must be flushed before the host reads them.
    DeviceToHost,
    #[default]
    DeviceToDevice,
}

impl CopyDirection {
    pub fn flush_before(self) -> bool {
        matches!(self, Self::HostToDevice)
    }

    pub fn flush_after(self) -> bool {
        matches!(self, Self::DeviceToHost)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlitConfig {
    pub ring_size: u64,
    pub fence_pool_size: u32,
    pub node_id: u32,
    pub queue_kind: QueueKind,
    pub priority: QueuePriority,
    pub direction: CopyDirection,
    pub hdp_flush: bool,
    /// Flush request/done registers; without them no flush is emitted.
    pub hdp_registers: Option<HdpFlushRegisters>,
    /// Wait for the engine to drain up to a range's start before moving the
    /// write pointer past it.
    pub wait_idle_before_wptr_update: bool,
    /// Use the engine's 64-bit atomic to decrement completion signals.
    pub platform_atomics: bool,
    pub profiling: bool,
}

impl Default for BlitConfig {
    fn default() -> Self {
        Self {
            ring_size: DEFAULT_RING_SIZE,
            fence_pool_size: DEFAULT_FENCE_POOL_SIZE,
            node_id: 0,
            queue_kind: QueueKind::Sdma,
            priority: QueuePriority::NORMAL,
            direction: CopyDirection::DeviceToDevice,
            hdp_flush: true,
            hdp_registers: None,
            wait_idle_before_wptr_update: false,
            platform_atomics: true,
            profiling: false,
        }
    }
}

impl BlitConfig {
    /// Defaults with the environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any key/value source (the process environment in
    /// production, a map in tests).
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(v) = parse_bool_var(HDP_FLUSH_ENV, lookup(HDP_FLUSH_ENV))? {
            self.hdp_flush = v;
        }
        if let Some(v) = parse_bool_var(WAIT_IDLE_ENV, lookup(WAIT_IDLE_ENV))? {
            self.wait_idle_before_wptr_update = v;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.ring_size.is_power_of_two()
            || self.ring_size < MIN_RING_SIZE
            || self.ring_size % PAGE_SIZE != 0
        {
            return Err(ConfigError::InvalidRingSize(self.ring_size));
        }
        if !self.fence_pool_size.is_power_of_two() {
            return Err(ConfigError::InvalidFencePoolSize(self.fence_pool_size));
        }
        Ok(())
    }

    /// Flush registers, if HDP flushes are enabled and available.
    pub(crate) fn active_hdp_registers(&self) -> Option<HdpFlushRegisters> {
        self.hdp_registers.filter(|_| self.hdp_flush)
    }
}

fn parse_bool_var(var: &'static str, raw: Option<String>) -> Result<Option<bool>, ConfigError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let v = raw.trim();
    if v == "1" || ["true", "yes", "on"].iter().any(|t| v.eq_ignore_ascii_case(t)) {
        Ok(Some(true))
    } else if v == "0" || ["false", "no", "off"].iter().any(|f| v.eq_ignore_ascii_case(f)) {
        Ok(Some(false))
    } else {
        Err(ConfigError::InvalidEnv {
            var,
            value: raw,
        })
    }
}
