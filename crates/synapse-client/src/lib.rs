//! # Synapse Client SDK
//!
//! A client SDK for storing data on PDP storage providers with several
//! verified copies.
//!
//! ## Features
//!
//! - **Multi-copy**: one upload is stored on a primary provider and pulled
//!   by secondaries, each committed to its own data set
//! - **Data set reuse**: existing data sets with matching metadata are found
//!   and extended instead of creating new ones
//! - **Verified retrieval**: downloads are checked against the piece CID,
//!   whether they come from a CDN or a provider
//!
//! ## Example
//!
//! ```rust,ignore
//! use synapse_client::{Config, Synapse};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let synapse = Synapse::new(Config::from_env()?, chain, signer, connector)?;
//!
//!     let result = synapse.upload(b"Hello, World!".repeat(20), Default::default()).await?;
//!     println!("{} stored {} times", result.piece_cid, result.copies.len());
//!
//!     let data = synapse.download(result.piece_cid).await?;
//!     println!("Content: {}", String::from_utf8_lossy(&data));
//!
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod error;

pub use client::Synapse;
pub use config::{Config, CONFIG_FILE_ENV, ENV_PREFIX};
pub use error::{ClientError, Result};

pub use synapse_storage::{
    DownloadOptions, ManagerUploadOptions, MultiCopyResult, PieceCid, StorageContext,
    StorageOptions, UploadSettings,
};
