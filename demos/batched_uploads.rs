//! Concurrent uploads on one context are committed in shared batches
//!
//! Run with: cargo run --example batched_uploads -- --uploads 10 --batch-size 4

use bytes::Bytes;
use clap::Parser;
use futures::future::join_all;
use synapse_storage::memory::MemoryNetwork;
use synapse_storage::{StorageContext, StorageOptions, UploadOptions, UploadSettings};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "batched-uploads")]
#[command(about = "Upload many pieces at once and count the add-pieces calls")]
struct Args {
    /// Concurrent uploads
    #[arg(short, long, default_value = "10")]
    uploads: usize,

    /// Pieces per add-pieces call
    #[arg(short, long, default_value = "4", env = "SYNAPSE_UPLOAD_BATCH_SIZE")]
    batch_size: usize,
}

const PAYER: &str = "0x00000000000000000000000000000000000000aa";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "synapse_storage=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let network = MemoryNetwork::new();
    let provider = network.add_provider("solo");
    let services = network
        .services(PAYER)
        .with_settings(UploadSettings::default().with_batch_size(args.batch_size));

    let options = synapse_storage::resolve_effective_options(
        &StorageOptions::default().with_count(1),
        &StorageOptions::default(),
    );
    let context = StorageContext::create(&services, &options).await?;

    let uploads = (0..args.uploads).map(|i| {
        let context = context.clone();
        let data = Bytes::from(format!("piece number {} ", i).repeat(16));
        async move { context.upload(data, UploadOptions::default()).await }
    });

    for result in join_all(uploads).await {
        let uploaded = result?;
        println!(
            "{} -> data set {} piece {}",
            uploaded.piece_cid, uploaded.data_set_id, uploaded.piece_id
        );
    }
    println!(
        "\n{} uploads committed in {} add-pieces calls",
        args.uploads,
        network.add_pieces_calls(provider.id)
    );

    Ok(())
}
