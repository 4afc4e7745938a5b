//! # Weft Runtime Library
//!
//! The weft runtime provides:
//!
//! - **Fiber Job Scheduler**: N worker threads multiplexing a fixed pool of
//!   stackful fibers over one lock-free job queue
//! - **Chains**: countdown handles for fork/join over batches of jobs
//! - **Tagged Arena**: lifetime-tagged bump allocation over a reserved
//!   virtual address range, freed a whole tag at a time
//! - **Block Allocator**: 2 MiB blocks tracked by an atomic bitmap with
//!   on-demand commit and advisory shrinking
//!
//! ## Technical Standards
//!
//! Implementation follows these standards:
//!
//! - **Job Queue**: bounded MPMC queue per
//!   [Vyukov](https://www.1024cores.net/home/lock-free-algorithms/queues/bounded-mpmc-queue)
//! - **Fibers**: stackful coroutines per [corosensei](https://docs.rs/corosensei)
//! - **Scheduling model**: per
//!   [Parallelizing the Naughty Dog engine using fibers](https://www.gdcvault.com/play/1022186)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         WEFT RUNTIME                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │  Scheduler   │  │    Fibers    │  │    Chains    │          │
//! │  │(scheduler.rs)│  │  (fiber.rs)  │  │  (chain.rs)  │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                 │                 │                   │
//! │         └──────────── runtime.rs ───────────┘                   │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │ Tagged Heaps │  │    Blocks    │  │   Virtual    │          │
//! │  │ (tagged.rs)  │──│ (blocks.rs)  │──│ Memory(vm.rs)│          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use weft_runtime::{start, Job, RuntimeConfig, Tag};
//!
//! let code = start(RuntimeConfig::from_env(), |rt| {
//!     let frame = Tag::new(42);
//!     let jobs = (0..64)
//!         .map(|_| Job::new("fill", move |rt| {
//!             let _scratch = rt.alloc(frame, 4096, 16);
//!         }))
//!         .collect();
//!     let chain = rt.split_work(jobs);
//!     rt.unchain(chain);
//!     rt.free(frame);
//!     0
//! })?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod bitmap;
pub mod blocks;
pub mod chain;
pub mod config;
pub mod fiber;
pub mod registry;
pub mod ring;
pub mod runtime;
pub mod scheduler;
pub mod stats;
pub mod sync;
pub mod tagged;
pub mod vm;

// Re-exports
pub use blocks::{BlockAllocator, BlockError};
pub use chain::{Chain, ChainPool, ChainWait, SpinWait};
pub use config::{ConfigError, RuntimeConfig, RuntimeConfigBuilder};
pub use ring::RingBuffer;
pub use runtime::{start, start_with_memory, BootError, Runtime, PANIC_EXIT_CODE};
pub use scheduler::Job;
pub use stats::RuntimeStats;
pub use tagged::{Tag, TaggedAllocator};
pub use vm::{HeapMemory, OsMemory, VirtualMemory, VmError, BLOCK_SIZE};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
