use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::{KvError, Result};
use crate::ops::{Completion, MAX_VALUE_SIZE};
use clap::{Parser, Subcommand, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "nvmekv")]
#[command(about = "Key-value engine over NVMe KV devices (runs on the built-in emulator)", long_about = None)]
pub struct Command {
    /// Device path
    #[arg(short, long, global = true, default_value = "/dev/kvemul")]
    pub device: String,

    /// Async worker threads (0 disables async operations)
    #[arg(short, long, global = true, default_value = "4")]
    pub workers: u32,

    /// Arena size in MB
    #[arg(long, global = true, default_value = "16")]
    pub arena_mb: usize,

    /// Engine configuration file (JSON); replaces the options above
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write an engine configuration file
    Init {
        /// Output path
        #[arg(short, long, default_value = "nvmekv.json")]
        path: PathBuf,

        /// I/O queue depth hint
        #[arg(short, long, default_value = "128")]
        queue_depth: u32,
    },

    /// Store, retrieve, check and delete a single pair
    StoreDemo,

    /// Populate keys, read them back and report the hit rate
    Cache {
        /// Number of entries
        #[arg(short = 'n', long, default_value = "1000")]
        entries: u64,
    },

    /// Async stores followed by async deletes
    AsyncDemo {
        /// Number of operations per phase
        #[arg(short = 'n', long, default_value = "10")]
        ops: u32,
    },

    /// Write then read throughput benchmark
    Bench {
        /// Operations per phase
        #[arg(short = 'n', long, default_value = "100000")]
        ops: u64,

        /// Value size in bytes
        #[arg(short = 's', long, default_value = "4096")]
        value_size: usize,

        /// Submission mode
        #[arg(short, long, value_enum, default_value = "sync")]
        mode: BenchMode,

        /// Read keys in random order
        #[arg(long)]
        random: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BenchMode {
    Sync,
    Async,
}

pub async fn execute_command(cmd: Command) -> Result<()> {
    let config = build_config(&cmd)?;

    match cmd.command {
        Commands::Init { path, queue_depth } => {
            execute_init_command(config.with_queue_depth(queue_depth), path)
        }
        Commands::StoreDemo => execute_store_demo_command(config),
        Commands::Cache { entries } => execute_cache_command(config, entries),
        Commands::AsyncDemo { ops } => execute_async_demo_command(config, ops).await,
        Commands::Bench {
            ops,
            value_size,
            mode,
            random,
        } => execute_bench_command(config, ops, value_size, mode, random).await,
    }
}

fn build_config(cmd: &Command) -> Result<EngineConfig> {
    let config = match &cmd.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::new(cmd.device.clone())
            .with_worker_threads(cmd.workers)
            .with_arena_capacity(cmd.arena_mb * 1024 * 1024),
    };
    config.validate()?;
    Ok(config)
}

fn execute_init_command(config: EngineConfig, path: PathBuf) -> Result<()> {
    config.validate()?;
    config.save(&path)?;

    println!("✓ Created configuration file: {}", path.display());
    println!("\nConfiguration:");
    println!("  Device: {}", config.device_path);
    println!("  Keyspace: {}", config.keyspace_name);
    println!("  Arena: {} MB", config.effective_arena_capacity() / (1024 * 1024));
    println!("  Queue depth: {}", config.queue_depth);
    println!("  Worker threads: {}", config.worker_threads);

    Ok(())
}

fn execute_store_demo_command(config: EngineConfig) -> Result<()> {
    let engine = Engine::init(config)?;
    println!("✓ Engine initialized on {}", engine.config().device_path);

    let key = b"user:12345";
    let value = b"John Doe, Software Engineer, San Francisco";

    engine.store(key, value)?;
    println!("✓ Stored: {}", String::from_utf8_lossy(key));

    let retrieved = engine.retrieve(key)?;
    println!(
        "✓ Retrieved: {} ({} bytes)",
        String::from_utf8_lossy(&retrieved),
        retrieved.len()
    );
    if retrieved != value {
        return Err(KvError::Io("retrieved value differs from stored value".to_string()));
    }

    println!("✓ Exists: {}", engine.exists(key)?);

    engine.delete(key)?;
    println!("✓ Deleted: {}", String::from_utf8_lossy(key));
    println!("✓ Exists after delete: {}", engine.exists(key)?);

    print_stats(&engine);
    engine.cleanup();

    Ok(())
}

fn execute_cache_command(config: EngineConfig, entries: u64) -> Result<()> {
    let engine = Engine::init(config)?;

    println!("Running cache workload with {} entries...", entries);

    let start = Instant::now();
    for i in 0..entries {
        let key = format!("cache_key_{:06}", i);
        let value = format!("cache_value_{:06}_data", i);
        engine.store(key.as_bytes(), value.as_bytes())?;
    }
    let write_time = start.elapsed().as_secs_f64();
    println!("✓ Write phase: {:.2} s, {:.0} ops/sec", write_time, rate(entries, write_time));

    let start = Instant::now();
    let mut hits = 0u64;
    for i in 0..entries {
        let key = format!("cache_key_{:06}", i);
        match engine.retrieve(key.as_bytes()) {
            Ok(_) => hits += 1,
            Err(KvError::KeyNotFound) => {}
            Err(e) => return Err(e),
        }
    }
    let read_time = start.elapsed().as_secs_f64();
    println!("✓ Read phase: {:.2} s, {:.0} ops/sec", read_time, rate(entries, read_time));

    let hit_rate = if entries == 0 {
        0.0
    } else {
        hits as f64 * 100.0 / entries as f64
    };
    println!("Cache hit rate: {:.2}%", hit_rate);

    print_stats(&engine);
    engine.cleanup();

    Ok(())
}

async fn execute_async_demo_command(config: EngineConfig, ops: u32) -> Result<()> {
    if !config.async_enabled() {
        return Err(KvError::Config(
            "async demo needs at least one worker thread".to_string(),
        ));
    }
    let engine = Engine::init(config)?;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    println!("Submitting {} async store operations...", ops);
    for i in 0..ops {
        let key = format!("async_key_{}", i);
        let value = format!("async_value_{}_data", i);
        let tx = tx.clone();
        engine.store_async(key.as_bytes(), value.as_bytes(), move |result| {
            let _ = tx.send(("store", i, result));
        })?;
    }
    await_completions(&mut rx, ops).await?;
    println!("✓ All store operations completed");

    println!("Submitting {} async delete operations...", ops);
    for i in 0..ops {
        let key = format!("async_key_{}", i);
        let tx = tx.clone();
        engine.delete_async(key.as_bytes(), move |result| {
            let _ = tx.send(("delete", i, result));
        })?;
    }
    await_completions(&mut rx, ops).await?;
    println!("✓ All delete operations completed");

    print_stats(&engine);
    engine.cleanup();

    Ok(())
}

async fn await_completions(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<(&'static str, u32, Result<()>)>,
    count: u32,
) -> Result<()> {
    for _ in 0..count {
        match rx.recv().await {
            Some((op, id, result)) => {
                let code = crate::error::result_code(&result);
                println!("  Async {} {} completed with result: {}", op, id, code.as_i32());
            }
            None => return Err(KvError::NotInitialized),
        }
    }
    Ok(())
}

async fn execute_bench_command(
    config: EngineConfig,
    ops: u64,
    value_size: usize,
    mode: BenchMode,
    random: bool,
) -> Result<()> {
    if value_size > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: value_size,
            limit: MAX_VALUE_SIZE,
        });
    }
    if mode == BenchMode::Async && !config.async_enabled() {
        return Err(KvError::Config(
            "async benchmark needs at least one worker thread".to_string(),
        ));
    }

    println!("=== nvmekv Throughput Benchmark ===");
    println!("Device: {}", config.device_path);
    println!("Operations: {}", ops);
    println!("Key size: 16 bytes");
    println!("Value size: {} bytes", value_size);
    println!("Mode: {:?}", mode);
    println!("Read order: {}", if random { "random" } else { "sequential" });
    println!();

    let window = config.queue_depth as usize;
    let engine = Engine::init(config)?;
    let value = vec![b'X'; value_size];

    // Write phase
    println!("Running WRITE benchmark...");
    engine.reset_stats();
    let start = Instant::now();
    match mode {
        BenchMode::Sync => {
            for i in 0..ops {
                engine.store(bench_key(i).as_bytes(), &value)?;
            }
        }
        BenchMode::Async => {
            let mut pending = Vec::with_capacity(window);
            for i in 0..ops {
                let key = bench_key(i);
                submit_windowed(&mut pending, window, || {
                    engine.store_deferred(key.as_bytes(), &value)
                })
                .await?;
            }
            drain_window(&mut pending).await?;
        }
    }
    print_phase(&engine, ops, value_size, start.elapsed().as_secs_f64());

    // Read phase
    println!("\nRunning READ benchmark...");
    let mut rng = StdRng::from_entropy();
    let mut read_key = |i: u64| {
        if random {
            bench_key(rng.gen_range(0..ops))
        } else {
            bench_key(i)
        }
    };
    engine.reset_stats();
    let start = Instant::now();
    match mode {
        BenchMode::Sync => {
            for i in 0..ops {
                engine.retrieve(read_key(i).as_bytes())?;
            }
        }
        BenchMode::Async => {
            let mut pending = Vec::with_capacity(window);
            for i in 0..ops {
                let key = read_key(i);
                submit_windowed(&mut pending, window, || engine.retrieve_deferred(key.as_bytes()))
                    .await?;
            }
            drain_window(&mut pending).await?;
        }
    }
    print_phase(&engine, ops, value_size, start.elapsed().as_secs_f64());

    engine.cleanup();

    Ok(())
}

/// Submits one operation, keeping at most `window` in flight.
///
/// The arena only recycles once every staged copy is released, so a
/// `NoMemory` from a full arena is retried once after the window drains.
async fn submit_windowed<T, F>(
    pending: &mut Vec<Completion<T>>,
    window: usize,
    mut submit: F,
) -> Result<()>
where
    F: FnMut() -> Result<Completion<T>>,
{
    let completion = match submit() {
        Err(KvError::NoMemory(_)) if !pending.is_empty() => {
            drain_window(pending).await?;
            submit()?
        }
        other => other?,
    };
    pending.push(completion);

    if pending.len() >= window {
        drain_window(pending).await?;
    }
    Ok(())
}

async fn drain_window<T>(pending: &mut Vec<Completion<T>>) -> Result<()> {
    for completion in pending.drain(..) {
        completion.await?;
    }
    Ok(())
}

fn bench_key(i: u64) -> String {
    format!("key{:013}", i)
}

fn rate(ops: u64, secs: f64) -> f64 {
    if secs > 0.0 {
        ops as f64 / secs
    } else {
        0.0
    }
}

fn print_phase<B: crate::backend::StorageBackend>(
    engine: &Engine<B>,
    ops: u64,
    value_size: usize,
    secs: f64,
) {
    let bandwidth = rate(ops, secs) * value_size as f64 / (1024.0 * 1024.0);

    println!("  Duration: {:.2} seconds", secs);
    println!("  Throughput: {:.2} ops/sec", rate(ops, secs));
    println!("  Bandwidth: {:.2} MB/s", bandwidth);

    let report = engine.latency_report();
    let mut operations: Vec<_> = report.iter().collect();
    operations.sort_by_key(|(op, _)| **op);
    for (op, p) in operations {
        println!(
            "  {} latency: p50 {:.0} µs, p95 {:.0} µs, p99 {:.0} µs, mean {:.2} µs",
            op, p.p50, p.p95, p.p99, p.mean
        );
    }
}

fn print_stats<B: crate::backend::StorageBackend>(engine: &Engine<B>) {
    let stats = engine.get_stats();

    println!("\n=== Final Statistics ===");
    println!("Total operations: {}", stats.total_ops);
    println!(
        "Write ops: {} ({:.2} MB)",
        stats.write_ops,
        stats.bytes_written as f64 / (1024.0 * 1024.0)
    );
    println!(
        "Read ops: {} ({:.2} MB)",
        stats.read_ops,
        stats.bytes_read as f64 / (1024.0 * 1024.0)
    );
    println!("Delete ops: {}", stats.delete_ops);
    println!("Failed ops: {}", stats.failed_ops);
    println!("Average latency: {:.2} µs", stats.avg_latency_us);
}
