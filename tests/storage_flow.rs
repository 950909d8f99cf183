//! End-to-end tests for the Synapse SDK
//!
//! These tests drive the public client against the in-memory network.

use bytes::Bytes;
use futures::future::join_all;
use synapse_client::{ClientError, Config, ManagerUploadOptions, StorageOptions, Synapse};
use synapse_piece::MAX_UPLOAD_SIZE;
use synapse_storage::memory::{DataSetSeed, MemoryNetwork};
use synapse_storage::{CopyRole, StorageError, UploadOptions, UploadSettings};
use test_log::test;

const PAYER: &str = "0x00000000000000000000000000000000000000aa";

fn synapse(network: &MemoryNetwork, config: Config) -> Synapse {
    Synapse::new(config, network.chain(), network.signer(PAYER), network.connector()).unwrap()
}

fn network(providers: usize) -> MemoryNetwork {
    let network = MemoryNetwork::new();
    for i in 0..providers {
        network.add_provider(&format!("sp-{}", i));
    }
    network
}

fn data(len: usize, seed: u8) -> Bytes {
    Bytes::from((0..len).map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed)).collect::<Vec<u8>>())
}

/// Upload then download returns the same bytes
#[test(tokio::test)]
async fn test_round_trip() {
    let network = network(3);
    let client = synapse(&network, Config::default());

    let payload = data(2048, 1);
    let result = client.upload(payload.clone(), ManagerUploadOptions::default()).await.unwrap();
    assert_eq!(result.copies.len(), 2);
    assert_eq!(result.copies.iter().filter(|c| c.role == CopyRole::Primary).count(), 1);

    assert_eq!(client.download(result.piece_cid).await.unwrap(), payload);
}

/// Sizes outside the accepted window never reach a provider
#[test(tokio::test)]
async fn test_size_bounds_checked_before_network() {
    let network = network(2);
    let client = synapse(&network, Config::default());

    let err = client.upload(data(126, 2), ManagerUploadOptions::default()).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Storage(StorageError::SizeOutOfBounds { size: 126, .. })
    ));

    let context = client.create_context(&StorageOptions::default()).await.unwrap();
    assert!(!context.preflight(MAX_UPLOAD_SIZE + 1).size_ok);
    assert!(context.preflight(127).size_ok);
    assert_eq!(network.total_upload_calls(), 0);
}

/// Five concurrent uploads on one context share a single add-pieces call
#[test(tokio::test)]
async fn test_concurrent_uploads_batch() {
    let network = network(1);
    let client = synapse(&network, Config::default().with_copies(1));
    let context = client.create_context(&StorageOptions::default()).await.unwrap();

    let uploads = (0..5u8).map(|i| {
        let context = context.clone();
        async move { context.upload(data(300, i), UploadOptions::default()).await }
    });
    let results: Vec<_> = join_all(uploads).await.into_iter().map(Result::unwrap).collect();

    let mut ids: Vec<u64> = results.iter().map(|r| r.piece_id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    assert!(results.iter().all(|r| Some(r.data_set_id) == context.data_set_id()));
    assert_eq!(network.total_add_pieces_calls(), 1);
}

/// With batch size B, N > B uploads take ceil(N / B) calls
#[test(tokio::test)]
async fn test_batch_size_caps_calls() {
    let network = network(1);
    let config = Config::default()
        .with_copies(1)
        .with_upload_settings(UploadSettings::default().with_batch_size(3));
    let client = synapse(&network, config);
    let context = client.create_context(&StorageOptions::default()).await.unwrap();

    let uploads = (0..7u8).map(|i| {
        let context = context.clone();
        async move { context.upload(data(200, i), UploadOptions::default()).await }
    });
    for result in join_all(uploads).await {
        result.unwrap();
    }
    assert_eq!(network.total_add_pieces_calls(), 3);
}

/// Explicit data sets are checked for existence and ownership
#[test(tokio::test)]
async fn test_explicit_data_set_checks() {
    let network = network(1);
    let foreign = network.seed_data_set(DataSetSeed::new("0x00000000000000000000000000000000000000bb", 1));
    let client = synapse(&network, Config::default());

    let err = client
        .create_context(&StorageOptions::default().with_data_set_ids([foreign]))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Storage(StorageError::NotOwner { .. })));

    let err = client
        .create_context(&StorageOptions::default().with_data_set_ids([0]))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Storage(StorageError::DataSetNotFound(0))));
    assert!(err.is_not_found());
}

/// Terminated data sets are never picked for reuse
#[test(tokio::test)]
async fn test_terminated_data_sets_not_reused() {
    let network = network(1);
    let terminated = network.seed_data_set(DataSetSeed::new(PAYER, 1).with_pieces(2).terminated());
    let client = synapse(&network, Config::default().with_copies(1));

    let context = client.create_context(&StorageOptions::default()).await.unwrap();
    assert_eq!(context.data_set_id(), None);

    let err = client
        .create_context(&StorageOptions::default().with_data_set_ids([terminated]))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Storage(StorageError::DataSetTerminated(_))));
}

/// A primary is drawn from endorsed providers when any exist
#[test(tokio::test)]
async fn test_endorsed_primary() {
    let network = network(5);
    network.set_endorsed([4]);
    let client = synapse(&network, Config::default());

    for i in 0..3u8 {
        client.storage().invalidate_default_contexts();
        let result = client.upload(data(400, i), ManagerUploadOptions::default()).await.unwrap();
        assert_eq!(result.copies[0].role, CopyRole::Primary);
        assert_eq!(result.copies[0].provider_id, 4);
        assert_ne!(result.copies[1].provider_id, 4);
    }
}

/// Losing every commit is an error even though the piece was stored
#[test(tokio::test)]
async fn test_all_commits_fail() {
    let network = network(2);
    network.fail_add_pieces(1, true);
    network.fail_add_pieces(2, true);
    let client = synapse(&network, Config::default());

    let payload = data(512, 9);
    let err = client.upload(payload.clone(), ManagerUploadOptions::default()).await.unwrap_err();
    let failures = match err {
        ClientError::Storage(StorageError::Commit { failures }) => failures,
        other => panic!("expected commit failure, got {other}"),
    };
    assert_eq!(failures.len(), 2);

    let piece = synapse_piece::calculate(&payload);
    assert!(network.is_parked(1, &piece) && network.is_parked(2, &piece));
}
