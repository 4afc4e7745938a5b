//! Runtime Configuration
//!
//! Configuration can be set programmatically or loaded from environment
//! variables. Zero-valued fields mean "pick the default"; [`RuntimeConfig::resolve`]
//! fills them in from the machine the runtime boots on.
//!
//! # Environment Variables
//!
//! All environment variables use the `WEFT_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `WEFT_THREADS` | Number of worker threads | CPU count |
//! | `WEFT_FIBERS` | Number of fibers | 96 + 4 × threads |
//! | `WEFT_FIBER_STACK_SIZE` | Fiber stack size in bytes | 262144 (256KB) |
//! | `WEFT_MEMORY_BUDGET` | Arena reservation in bytes | physical RAM |
//! | `WEFT_TAGGED_HEAPS` | Heaps available to dynamic tags | 16 |
//! | `WEFT_JOB_QUEUE_LOG2` | log2 of the job queue capacity | 16 |
//! | `WEFT_ALLOC_QUEUE_LOG2` | log2 of the allocation descriptor count | 12 |
//! | `WEFT_PIN_THREADS` | Pin workers to cores ("true"/"false") | false |
//! | `WEFT_APP_NAME` | Application name | weft |
//!
//! # Example
//!
//! ```rust,ignore
//! use weft_runtime::config::RuntimeConfig;
//!
//! // Load from environment with defaults
//! let config = RuntimeConfig::from_env();
//!
//! // Or use the builder pattern
//! let config = RuntimeConfig::builder()
//!     .thread_count(4)
//!     .memory_budget(1024 * 1024 * 1024) // 1GB
//!     .build()?;
//! ```

use std::env;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::vm::{round_to_blocks, BLOCK_SIZE};

/// Default fiber stack size (256 KiB).
pub const DEFAULT_FIBER_STACK_SIZE: usize = 256 * 1024;
/// Smallest accepted fiber stack size.
pub const MIN_FIBER_STACK_SIZE: usize = 16 * 1024;
/// Default number of dynamic tagged heaps.
pub const DEFAULT_TAGGED_HEAP_COUNT: usize = 16;
/// Default log2 capacity of the job queue.
pub const DEFAULT_JOB_QUEUE_LOG2: u32 = 16;
/// Default log2 count of allocation descriptors.
pub const DEFAULT_ALLOCATION_QUEUE_LOG2: u32 = 12;
/// Largest accepted log2 queue capacity.
pub const MAX_QUEUE_LOG2: u32 = 24;
/// Fibers allotted regardless of thread count.
pub const BASE_FIBER_COUNT: usize = 96;
/// Additional fibers per worker thread.
pub const FIBERS_PER_THREAD: usize = 4;

/// Complete runtime configuration.
///
/// Use `RuntimeConfig::default()` to take every default, or
/// `RuntimeConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Bytes of address space reserved for the arena.
    /// 0 = physical RAM, rounded up to whole blocks.
    pub memory_budget: usize,

    /// Stack size of every fiber in bytes.
    /// 0 = 256KB.
    pub fiber_stack_size: usize,

    /// Number of fibers.
    /// 0 = 96 + 4 × thread_count.
    pub fiber_count: usize,

    /// Number of worker threads, the calling thread included.
    /// 0 = number of available CPUs.
    pub thread_count: usize,

    /// Heaps available to dynamic tags.
    /// 0 = 16.
    pub tagged_heap_count: usize,

    /// log2 of the job queue capacity.
    /// 0 = 16.
    pub job_queue_log2_capacity: u32,

    /// log2 of the number of allocation descriptors.
    /// 0 = 12.
    pub allocation_queue_log2_capacity: u32,

    /// Pin worker `i` to core `i` (modulo the core count).
    pub pin_threads: bool,

    /// Name of the hosting application, used in thread names and logs.
    pub application_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            memory_budget: 0,
            fiber_stack_size: 0,
            fiber_count: 0,
            thread_count: 0,
            tagged_heap_count: 0,
            job_queue_log2_capacity: 0,
            allocation_queue_log2_capacity: 0,
            pin_threads: false,
            application_name: "weft".into(),
        }
    }
}

impl RuntimeConfig {
    /// Create a new builder for RuntimeConfig.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are not set keep their default. Values that fail to
    /// parse are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_number(&lookup, "WEFT_THREADS") {
            config.thread_count = val;
        }
        if let Some(val) = parse_number(&lookup, "WEFT_FIBERS") {
            config.fiber_count = val;
        }
        if let Some(val) = parse_number(&lookup, "WEFT_FIBER_STACK_SIZE") {
            config.fiber_stack_size = val;
        }
        if let Some(val) = parse_number(&lookup, "WEFT_MEMORY_BUDGET") {
            config.memory_budget = val;
        }
        if let Some(val) = parse_number(&lookup, "WEFT_TAGGED_HEAPS") {
            config.tagged_heap_count = val;
        }
        if let Some(val) = parse_number(&lookup, "WEFT_JOB_QUEUE_LOG2") {
            config.job_queue_log2_capacity = val;
        }
        if let Some(val) = parse_number(&lookup, "WEFT_ALLOC_QUEUE_LOG2") {
            config.allocation_queue_log2_capacity = val;
        }
        if let Some(val) = parse_bool(&lookup, "WEFT_PIN_THREADS") {
            config.pin_threads = val;
        }
        if let Some(name) = lookup("WEFT_APP_NAME").filter(|name| !name.is_empty()) {
            config.application_name = name;
        }

        config
    }

    /// Fill every zero-valued field with its default.
    pub fn resolve(&self) -> RuntimeConfig {
        let thread_count = if self.thread_count == 0 {
            num_cpus()
        } else {
            self.thread_count
        };

        RuntimeConfig {
            memory_budget: if self.memory_budget == 0 {
                round_to_blocks(physical_memory())
            } else {
                round_to_blocks(self.memory_budget)
            },
            fiber_stack_size: nonzero_or(self.fiber_stack_size, DEFAULT_FIBER_STACK_SIZE),
            fiber_count: nonzero_or(
                self.fiber_count,
                BASE_FIBER_COUNT + FIBERS_PER_THREAD * thread_count,
            ),
            thread_count,
            tagged_heap_count: nonzero_or(self.tagged_heap_count, DEFAULT_TAGGED_HEAP_COUNT),
            job_queue_log2_capacity: nonzero_or(
                self.job_queue_log2_capacity,
                DEFAULT_JOB_QUEUE_LOG2,
            ),
            allocation_queue_log2_capacity: nonzero_or(
                self.allocation_queue_log2_capacity,
                DEFAULT_ALLOCATION_QUEUE_LOG2,
            ),
            pin_threads: self.pin_threads,
            application_name: self.application_name.clone(),
        }
    }

    /// Validate the configuration and return any errors.
    ///
    /// Zero-valued fields are always valid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory_budget != 0 && self.memory_budget < 2 * BLOCK_SIZE {
            return Err(ConfigError::InvalidValue {
                field: "memory_budget",
                message: format!("must be at least {} bytes", 2 * BLOCK_SIZE),
            });
        }

        if self.fiber_stack_size != 0 && self.fiber_stack_size < MIN_FIBER_STACK_SIZE {
            return Err(ConfigError::InvalidValue {
                field: "fiber_stack_size",
                message: format!("must be at least {} bytes", MIN_FIBER_STACK_SIZE),
            });
        }

        if self.fiber_count >= u32::MAX as usize {
            return Err(ConfigError::InvalidValue {
                field: "fiber_count",
                message: "must fit a 32-bit fiber index".into(),
            });
        }

        if self.thread_count >= u32::MAX as usize {
            return Err(ConfigError::InvalidValue {
                field: "thread_count",
                message: "must fit a 32-bit thread index".into(),
            });
        }

        for (field, log2) in [
            ("job_queue_log2_capacity", self.job_queue_log2_capacity),
            (
                "allocation_queue_log2_capacity",
                self.allocation_queue_log2_capacity,
            ),
        ] {
            if log2 > MAX_QUEUE_LOG2 {
                return Err(ConfigError::InvalidValue {
                    field,
                    message: format!("must be at most {}", MAX_QUEUE_LOG2),
                });
            }
        }

        if self.application_name.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "application_name",
                message: "must not be empty".into(),
            });
        }

        Ok(())
    }

    /// Number of job queue slots.
    pub fn job_queue_capacity(&self) -> usize {
        1usize << self.job_queue_log2_capacity
    }
}

impl fmt::Display for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "application:      {}", self.application_name)?;
        writeln!(f, "threads:          {}", self.thread_count)?;
        writeln!(f, "fibers:           {}", self.fiber_count)?;
        writeln!(f, "fiber stack:      {} KiB", self.fiber_stack_size >> 10)?;
        writeln!(f, "memory budget:    {} MiB", self.memory_budget >> 20)?;
        writeln!(f, "tagged heaps:     {}", self.tagged_heap_count)?;
        writeln!(f, "job queue:        2^{}", self.job_queue_log2_capacity)?;
        writeln!(f, "descriptors:      2^{}", self.allocation_queue_log2_capacity)?;
        write!(f, "pin threads:      {}", self.pin_threads)
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: &'static str,
        /// Error message.
        message: String,
    },
}

/// Builder for RuntimeConfig.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the arena reservation in bytes (0 = physical RAM).
    pub fn memory_budget(mut self, bytes: usize) -> Self {
        self.config.memory_budget = bytes;
        self
    }

    /// Set the fiber stack size in bytes.
    pub fn fiber_stack_size(mut self, size: usize) -> Self {
        self.config.fiber_stack_size = size;
        self
    }

    /// Set the number of fibers.
    pub fn fiber_count(mut self, n: usize) -> Self {
        self.config.fiber_count = n;
        self
    }

    /// Set the number of worker threads.
    pub fn thread_count(mut self, n: usize) -> Self {
        self.config.thread_count = n;
        self
    }

    /// Set the number of heaps available to dynamic tags.
    pub fn tagged_heap_count(mut self, n: usize) -> Self {
        self.config.tagged_heap_count = n;
        self
    }

    /// Set log2 of the job queue capacity.
    pub fn job_queue_log2_capacity(mut self, log2: u32) -> Self {
        self.config.job_queue_log2_capacity = log2;
        self
    }

    /// Set log2 of the allocation descriptor count.
    pub fn allocation_queue_log2_capacity(mut self, log2: u32) -> Self {
        self.config.allocation_queue_log2_capacity = log2;
        self
    }

    /// Enable or disable pinning workers to cores.
    pub fn pin_threads(mut self, enabled: bool) -> Self {
        self.config.pin_threads = enabled;
        self
    }

    /// Set the application name.
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.config.application_name = name.into();
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    ///
    /// `start` validates again before booting.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

fn nonzero_or<T: Default + PartialEq>(value: T, default: T) -> T {
    if value == T::default() {
        default
    } else {
        value
    }
}

/// Parse a variable as a number.
fn parse_number<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(val) => Some(val),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparsable configuration variable");
            None
        }
    }
}

/// Parse a variable as bool.
fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<bool> {
    let raw = lookup(name)?;
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!(var = name, value = %raw, "ignoring unparsable configuration variable");
            None
        }
    }
}

/// Get the number of available CPUs.
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Installed physical memory in bytes.
#[cfg(unix)]
fn physical_memory() -> usize {
    // Safety: sysconf has no preconditions.
    let (pages, page_size) =
        unsafe { (libc::sysconf(libc::_SC_PHYS_PAGES), libc::sysconf(libc::_SC_PAGESIZE)) };
    if pages <= 0 || page_size <= 0 {
        return FALLBACK_PHYSICAL_MEMORY;
    }
    (pages as usize).saturating_mul(page_size as usize)
}

#[cfg(not(unix))]
fn physical_memory() -> usize {
    FALLBACK_PHYSICAL_MEMORY
}

/// Budget used when physical memory cannot be queried (4 GiB).
const FALLBACK_PHYSICAL_MEMORY: usize = 4 << 30;
