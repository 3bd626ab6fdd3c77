use std::path::PathBuf;

use candle_core::Device;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use paged_kv::{BlockManager, CacheConfig, PreparedBatch, Result, Sequence};

#[derive(Parser, Debug)]
#[command(name = "paged-kv")]
#[command(about = "Run a synthetic prefill/decode trace through the KV block allocator")]
struct Args {
    /// JSON cache configuration (overrides --block-size/--num-blocks)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Tokens per block
    #[arg(long, default_value = "256")]
    block_size: usize,

    /// Blocks in the pool
    #[arg(long, default_value = "64")]
    num_blocks: usize,

    /// Number of concurrent sequences
    #[arg(long, default_value = "8")]
    num_seqs: usize,

    /// Prompt length per sequence
    #[arg(long, default_value = "600")]
    prompt_len: usize,

    /// Leading prompt tokens shared by every sequence
    #[arg(long, default_value = "512")]
    shared_prefix: usize,

    /// Decode steps to simulate
    #[arg(long, default_value = "512")]
    decode_steps: usize,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => CacheConfig::from_json_file(path)?,
        None => CacheConfig::new(args.block_size, args.num_blocks)?,
    };
    info!(block_size = config.block_size, num_blocks = config.num_blocks, "starting trace");

    let mut manager = BlockManager::from_config(&config)?;
    let shared = args.shared_prefix.min(args.prompt_len);
    let mut seqs: Vec<Sequence> = (0..args.num_seqs)
        .map(|i| {
            let prompt = (0..shared as u32)
                .chain((shared..args.prompt_len).map(|p| (p * (i + 1)) as u32 + 100_000))
                .collect();
            Sequence::new(prompt, config.block_size)
        })
        .collect();

    let mut cached_tokens = 0;
    for seq in seqs.iter_mut() {
        if !manager.can_allocate(seq) {
            warn!(seq_id = seq.seq_id(), "not enough blocks, sequence stays waiting");
            continue;
        }
        manager.allocate(seq)?;
        seq.set_running()?;
        cached_tokens += seq.num_cached_tokens();
    }
    {
        let running: Vec<&Sequence> = seqs.iter().filter(|s| !s.block_table().is_empty()).collect();
        if !running.is_empty() {
            let batch = PreparedBatch::prefill(&running, &Device::Cpu)?;
            info!(
                num_seqs = running.len(),
                num_input_tokens = batch.input_ids.dims1()?,
                cached_tokens,
                "prefill batch"
            );
        }
    }

    let mut preempted = 0;
    for step in 0..args.decode_steps {
        for seq in seqs.iter_mut().filter(|s| !s.block_table().is_empty()) {
            seq.append_token((step % 50_000) as u32);
            if manager.can_append(seq) {
                manager.may_append(seq)?;
            } else {
                manager.deallocate(seq)?;
                seq.set_waiting()?;
                preempted += 1;
            }
        }
        let running: Vec<&Sequence> = seqs.iter().filter(|s| !s.block_table().is_empty()).collect();
        if running.is_empty() {
            break;
        }
        PreparedBatch::decode(&running, &Device::Cpu)?;
    }

    info!(
        free = manager.num_free_blocks(),
        used = manager.num_used_blocks(),
        cached_hashes = manager.num_cached_hashes(),
        preempted,
        "decode finished"
    );

    for seq in seqs.iter_mut() {
        manager.deallocate(seq)?;
        seq.set_finished();
    }
    manager.check_invariants()?;

    println!(
        "blocks: {} total, {} free after teardown; \
         prefix cache saved {} prefill tokens; {} preemptions",
        manager.num_blocks(),
        manager.num_free_blocks(),
        cached_tokens,
        preempted
    );
    Ok(())
}
