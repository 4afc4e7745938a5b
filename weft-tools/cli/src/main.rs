//! Weft Runtime Driver
//!
//! Run with: `weft [OPTIONS] <COMMAND>`

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use weft_runtime::{start, Job, Runtime, RuntimeConfig, Tag};

#[derive(Parser)]
#[command(name = "weft")]
#[command(about = "Drive the weft fiber job runtime")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    runtime: RuntimeArgs,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Overrides applied on top of the `WEFT_*` environment.
#[derive(Args)]
struct RuntimeArgs {
    /// Worker threads (default: core count)
    #[arg(short, long, global = true)]
    threads: Option<usize>,

    /// Fibers in the pool (default: 96 + 4 per thread)
    #[arg(short, long, global = true)]
    fibers: Option<usize>,

    /// Arena reservation in MiB (default: physical memory)
    #[arg(long, global = true)]
    budget_mb: Option<usize>,

    /// Fiber stack size in KiB
    #[arg(long, global = true)]
    stack_kb: Option<usize>,

    /// Heaps available to dynamic tags
    #[arg(long, global = true)]
    heaps: Option<usize>,

    /// Pin worker threads to cores
    #[arg(long, global = true, env = "WEFT_PIN_THREADS")]
    pin: bool,
}

impl RuntimeArgs {
    fn config(&self) -> Result<RuntimeConfig> {
        let mut config = RuntimeConfig::from_env();
        if let Some(threads) = self.threads {
            config.thread_count = threads;
        }
        if let Some(fibers) = self.fibers {
            config.fiber_count = fibers;
        }
        if let Some(budget) = self.budget_mb {
            config.memory_budget = budget << 20;
        }
        if let Some(stack) = self.stack_kb {
            config.fiber_stack_size = stack << 10;
        }
        if let Some(heaps) = self.heaps {
            config.tagged_heap_count = heaps;
        }
        config.pin_threads |= self.pin;
        config.validate().context("invalid runtime configuration")?;
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Increment a shared counter from batches of jobs
    Counter {
        /// Jobs per batch
        #[arg(short, long, default_value_t = 1000)]
        jobs: usize,

        /// Number of batches
        #[arg(short, long, default_value_t = 1)]
        batches: usize,
    },

    /// Allocate under a tag from every worker, then free the tag
    Alloc {
        /// Tag to allocate under (1 = per-thread drifter heaps)
        #[arg(long, default_value_t = 2)]
        tag: u64,

        /// Number of allocations
        #[arg(short, long, default_value_t = 10_000)]
        count: usize,

        /// Bytes per allocation
        #[arg(short, long, default_value_t = 256)]
        size: usize,
    },

    /// Print the resolved configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let config = cli.runtime.config()?;

    let code = match cli.command {
        Commands::Counter { jobs, batches } => cmd_counter(config, jobs, batches)?,
        Commands::Alloc { tag, count, size } => cmd_alloc(config, Tag::new(tag), count, size)?,
        Commands::Config => cmd_config(&config),
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn cmd_counter(config: RuntimeConfig, jobs: usize, batches: usize) -> Result<i32> {
    info!(jobs, batches, "running counter");
    let started = Instant::now();

    let code = start(config, move |rt| {
        let counter = Arc::new(AtomicUsize::new(0));
        let capacity = rt.config().job_queue_capacity();

        for _ in 0..batches {
            let mut remaining = jobs;
            while remaining > 0 {
                let n = remaining.min(capacity);
                let batch = (0..n)
                    .map(|_| {
                        let counter = counter.clone();
                        Job::new("increment", move |_| {
                            counter.fetch_add(1, Ordering::Relaxed);
                        })
                    })
                    .collect();
                let chain = rt.split_work(batch);
                rt.unchain(chain);
                remaining -= n;
            }
        }

        let total = counter.load(Ordering::Relaxed);
        let expected = jobs * batches;
        println!("counter:             {} (expected {})", total, expected);
        println!("{}", rt.stats());
        if total == expected {
            0
        } else {
            1
        }
    })
    .context("failed to boot runtime")?;

    println!("elapsed:             {:?}", started.elapsed());
    Ok(code)
}

fn cmd_alloc(config: RuntimeConfig, tag: Tag, count: usize, size: usize) -> Result<i32> {
    info!(%tag, count, size, "running allocation");

    let code = start(config, move |rt| {
        let failed = Arc::new(AtomicUsize::new(0));
        let workers = rt.thread_count();
        let batch = (0..workers)
            .map(|worker| {
                let failed = failed.clone();
                let share = count / workers + usize::from(worker < count % workers);
                Job::new("allocate", move |rt| {
                    for _ in 0..share {
                        if rt.alloc(tag, size, 16).is_none() {
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        let chain = rt.split_work(batch);
        rt.unchain(chain);

        report_arena(rt, tag);
        let released = rt.free(tag);
        println!("released:            {} descriptors", released);

        let failed = failed.load(Ordering::Relaxed);
        if failed > 0 {
            println!("failed:              {} of {}", failed, count);
            1
        } else {
            0
        }
    })
    .context("failed to boot runtime")?;

    Ok(code)
}

fn report_arena(rt: &Runtime, tag: Tag) {
    let tagged = rt.tagged();
    println!("tag:                 {}", tag);
    println!("descriptors:         {}", tagged.live_allocations(tag));
    println!("blocks in use:       {}", tagged.live_blocks());
    match tagged.verify_bitmap() {
        Ok(()) => println!("bitmap audit:        ok"),
        Err(err) => println!("bitmap audit:        {}", err),
    }
    println!("{}", rt.stats());
}

fn cmd_config(config: &RuntimeConfig) -> i32 {
    println!("{}", config.resolve());
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_flags_override_config() {
        let cli = Cli::try_parse_from([
            "weft", "counter", "--jobs", "5", "--threads", "2", "--budget-mb", "64", "--stack-kb",
            "128",
        ])
        .unwrap();
        let config = cli.runtime.config().unwrap();
        assert_eq!(config.thread_count, 2);
        assert_eq!(config.memory_budget, 64 << 20);
        assert_eq!(config.fiber_stack_size, 128 << 10);
        assert!(matches!(cli.command, Commands::Counter { jobs: 5, batches: 1 }));
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let cli = Cli::try_parse_from(["weft", "--stack-kb", "1", "config"]).unwrap();
        assert!(cli.runtime.config().is_err());
    }

    #[test]
    fn test_alloc_defaults() {
        let cli = Cli::try_parse_from(["weft", "alloc"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Alloc { tag: 2, count: 10_000, size: 256 }
        ));
    }
}
