//! Layer configuration
//!
//! Everything a [`Context`](crate::Context) needs at bring-up except the
//! shared regions themselves, whose base and size arrive out-of-band
//! through `Context::register_region`.

use crate::gate::ProtectionLevel;
use crate::multiproc::{get_default_config, MultiProcConfig};
use crate::platform::Timeout;

/// Default cache line size for shared records
pub const DEFAULT_CACHE_LINE_SIZE: usize = 128;

/// Gate defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateConfig {
    /// Local protection nested inside shared gates
    pub default_local: ProtectionLevel,
    /// Timeout used by `Gate::enter`
    pub enter_timeout: Timeout,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            default_local: ProtectionLevel::Task,
            enter_timeout: Timeout::Forever,
        }
    }
}

/// Complete layer configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcConfig {
    pub multiproc: MultiProcConfig,
    /// Alignment of records placed in shared regions; must be a power of two
    pub cache_line_size: usize,
    pub gate: GateConfig,
    /// Bound on every broker round trip
    pub channel_timeout: Timeout,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            multiproc: get_default_config(),
            cache_line_size: DEFAULT_CACHE_LINE_SIZE,
            gate: GateConfig::default(),
            channel_timeout: Timeout::Forever,
        }
    }
}

impl IpcConfig {
    pub fn new(multiproc: MultiProcConfig) -> Self {
        Self {
            multiproc,
            ..Self::default()
        }
    }

    pub fn with_cache_line_size(mut self, size: usize) -> Self {
        self.cache_line_size = size;
        self
    }

    pub fn with_gate(mut self, gate: GateConfig) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_channel_timeout(mut self, timeout: Timeout) -> Self {
        self.channel_timeout = timeout;
        self
    }
}
