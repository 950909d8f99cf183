//! Multi-copy upload against an in-memory provider network
//!
//! Run with: cargo run --example multi_copy_upload -- --providers 4 --copies 3

use clap::Parser;
use rand::RngCore;
use synapse_client::{Config, ManagerUploadOptions, Synapse};
use synapse_storage::memory::MemoryNetwork;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "multi-copy-upload")]
#[command(about = "Store one piece on several in-memory providers and read it back")]
struct Args {
    /// Providers registered in the network
    #[arg(short, long, default_value = "4")]
    providers: usize,

    /// Copies to store
    #[arg(short, long, default_value = "2", env = "SYNAPSE_COPIES")]
    copies: usize,

    /// Payload size in bytes
    #[arg(short, long, default_value = "4096")]
    size: usize,

    /// Provider id whose pulls fail, to show replacement
    #[arg(long)]
    fail_pull: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

const PAYER: &str = "0x00000000000000000000000000000000000000aa";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| format!("synapse_storage={},synapse_client={}", log_level, log_level).into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let network = MemoryNetwork::new();
    for i in 0..args.providers {
        let provider = network.add_provider(&format!("provider-{}", i + 1));
        println!("registered {} (id {}) at {}", provider.name, provider.id, provider.pdp.service_url);
    }
    if let Some(id) = args.fail_pull {
        network.fail_pull(id, true);
        println!("pulls to provider {} will fail", id);
    }

    let synapse = Synapse::new(
        Config::default().with_copies(args.copies),
        network.chain(),
        network.signer(PAYER),
        network.connector(),
    )?;

    let mut data = vec![0u8; args.size];
    rand::thread_rng().fill_bytes(&mut data);

    println!("\n=== Uploading {} bytes ===", args.size);
    let result = synapse.upload(data.clone(), ManagerUploadOptions::default()).await?;
    println!("piece: {}", result.piece_cid);
    for copy in &result.copies {
        println!(
            "  {:?} provider {} -> data set {} piece {}{}",
            copy.role,
            copy.provider_id,
            copy.data_set_id,
            copy.piece_id,
            if copy.is_new_data_set { " (new data set)" } else { "" }
        );
    }
    for failure in &result.failures {
        println!("  failed: provider {} ({:?}): {}", failure.provider_id, failure.role, failure.reason);
    }

    println!("\n=== Downloading ===");
    let bytes = synapse.download(result.piece_cid).await?;
    anyhow::ensure!(bytes.as_ref() == data.as_slice(), "downloaded bytes differ");
    println!("verified {} bytes", bytes.len());

    println!("\n=== Data sets ===");
    for data_set in synapse.storage().find_data_sets(None).await? {
        println!(
            "  data set {} on provider {}: {} pieces",
            data_set.data_set_id(),
            data_set.provider_id(),
            data_set.active_piece_count
        );
    }

    Ok(())
}
