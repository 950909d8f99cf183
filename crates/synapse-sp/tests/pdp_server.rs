//! PdpServer against a mock provider endpoint

use serde_json::json;
use std::time::Duration;
use synapse_piece::PieceCid;
use synapse_sp::{
    ExtraData, PdpServer, PdpServerConfig, ProviderClient, PullPiece, PullRequest, PullState,
    RetryPolicy, SpError, TxHash,
};
use test_log::test;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn server_for(mock: &MockServer) -> PdpServer {
    let config = PdpServerConfig::new(mock.uri())
        .with_timeout(Duration::from_secs(5))
        .with_request_retry(RetryPolicy::none())
        .with_status_poll(RetryPolicy::polling(Duration::from_millis(10), Duration::from_secs(5)));
    PdpServer::new(config).unwrap()
}

fn piece(seed: u8) -> PieceCid {
    synapse_piece::calculate(&[seed; 256])
}

fn extra() -> ExtraData {
    ExtraData::from_bytes(b"signed")
}

#[test(tokio::test)]
async fn test_ping() {
    let mock = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pdp/ping"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock)
        .await;

    server_for(&mock).ping().await.unwrap();
}

#[test(tokio::test)]
async fn test_ping_server_error_is_retryable() {
    let mock = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pdp/ping"))
        .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
        .mount(&mock)
        .await;

    let err = server_for(&mock).ping().await.unwrap_err();
    match &err {
        SpError::Status { status, body, .. } => {
            assert_eq!(*status, 503);
            assert_eq!(body, "busy");
        }
        other => panic!("expected status error, got {other}"),
    }
    assert!(err.is_retryable());
}

#[test(tokio::test)]
async fn test_create_data_set_and_wait() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pdp/data-sets"))
        .and(body_partial_json(json!({ "recordKeeper": "0xrk" })))
        .respond_with(
            ResponseTemplate::new(201).insert_header("Location", "/pdp/data-sets/created/0xabc"),
        )
        .mount(&mock)
        .await;
    Mock::given(method("GET"))
        .and(path("/pdp/data-sets/created/0xabc"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "txStatus": "pending", "dataSetCreated": false })),
        )
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&mock)
        .await;
    Mock::given(method("GET"))
        .and(path("/pdp/data-sets/created/0xabc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "txStatus": "confirmed",
            "dataSetCreated": true,
            "ok": true,
            "dataSetId": 7
        })))
        .with_priority(2)
        .mount(&mock)
        .await;

    let server = server_for(&mock);
    let handle = server.create_data_set("0xrk", &extra()).await.unwrap();
    assert_eq!(handle.tx_hash, TxHash("0xabc".to_string()));
    assert_eq!(handle.status_url, format!("{}/pdp/data-sets/created/0xabc", mock.uri()));

    let created = server.wait_for_data_set_creation(&handle).await.unwrap();
    assert_eq!(created.data_set_id, 7);
    assert_eq!(created.tx_hash, TxHash("0xabc".to_string()));
}

#[test(tokio::test)]
async fn test_rejected_creation() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pdp/data-sets/create-and-add"))
        .respond_with(
            ResponseTemplate::new(201).insert_header("Location", "/pdp/data-sets/created/0xbad"),
        )
        .mount(&mock)
        .await;
    Mock::given(method("GET"))
        .and(path("/pdp/data-sets/created/0xbad"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "txStatus": "rejected", "dataSetCreated": false })),
        )
        .mount(&mock)
        .await;

    let server = server_for(&mock);
    let handle = server
        .create_and_add_pieces("0xrk", &[piece(1)], &extra())
        .await
        .unwrap();
    let err = server.wait_for_data_set_creation(&handle).await.unwrap_err();
    assert!(matches!(err, SpError::Rejected { ref tx_hash, .. } if tx_hash == "0xbad"));
}

#[test(tokio::test)]
async fn test_missing_location_header() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pdp/data-sets"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&mock)
        .await;

    let err = server_for(&mock).create_data_set("0xrk", &extra()).await.unwrap_err();
    assert!(matches!(err, SpError::InvalidResponse(_)));
}

#[test(tokio::test)]
async fn test_add_pieces_waits_for_record() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pdp/data-sets/7/pieces"))
        .respond_with(
            ResponseTemplate::new(201).insert_header("Location", "/pdp/data-sets/7/pieces/added/0xdef"),
        )
        .mount(&mock)
        .await;
    // Not yet seen by the provider
    Mock::given(method("GET"))
        .and(path("/pdp/data-sets/7/pieces/added/0xdef"))
        .respond_with(ResponseTemplate::new(404))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&mock)
        .await;
    Mock::given(method("GET"))
        .and(path("/pdp/data-sets/7/pieces/added/0xdef"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "txStatus": "confirmed",
            "addMessageOk": true,
            "confirmedPieceIds": [3, 4]
        })))
        .with_priority(2)
        .mount(&mock)
        .await;

    let server = server_for(&mock);
    let handle = server.add_pieces(7, &[piece(1), piece(2)], &extra()).await.unwrap();
    let added = server.wait_for_pieces_added(7, &handle.tx_hash).await.unwrap();
    assert_eq!(added.data_set_id, 7);
    assert_eq!(added.piece_ids, vec![3, 4]);
}

#[test(tokio::test)]
async fn test_upload_piece_two_steps() {
    let mock = MockServer::start().await;
    let cid = piece(5);
    Mock::given(method("POST"))
        .and(path("/pdp/piece"))
        .and(body_partial_json(json!({ "pieceCid": cid.to_string(), "size": 256 })))
        .respond_with(ResponseTemplate::new(201).insert_header("Location", "/pdp/piece/upload/u1"))
        .mount(&mock)
        .await;
    Mock::given(method("PUT"))
        .and(path("/pdp/piece/upload/u1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&mock)
        .await;

    let uploaded = server_for(&mock)
        .upload_piece(vec![5u8; 256].into(), &cid, None)
        .await
        .unwrap();
    assert_eq!(uploaded.piece_cid, cid);
    assert_eq!(uploaded.size, 256);
    assert!(!uploaded.already_present);
}

#[test(tokio::test)]
async fn test_upload_piece_already_present() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pdp/piece"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&mock)
        .await;

    let uploaded = server_for(&mock)
        .upload_piece(vec![6u8; 256].into(), &piece(6), None)
        .await
        .unwrap();
    assert!(uploaded.already_present);
}

#[test(tokio::test)]
async fn test_upload_piece_cancelled() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pdp/piece"))
        .respond_with(ResponseTemplate::new(201).set_delay(Duration::from_secs(3)))
        .mount(&mock)
        .await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = server_for(&mock)
        .upload_piece(vec![7u8; 256].into(), &piece(7), Some(&cancel))
        .await
        .unwrap_err();
    assert!(matches!(err, SpError::Aborted));
}

#[test(tokio::test)]
async fn test_find_piece() {
    let mock = MockServer::start().await;
    let known = piece(1);
    let other = piece(2);
    let missing = piece(3);
    Mock::given(method("GET"))
        .and(path("/pdp/piece"))
        .and(query_param("pieceCid", known.to_string().as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "pieceCid": known.to_string() })))
        .mount(&mock)
        .await;
    Mock::given(method("GET"))
        .and(path("/pdp/piece"))
        .and(query_param("pieceCid", other.to_string().as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "pieceCid": known.to_string() })))
        .mount(&mock)
        .await;
    Mock::given(method("GET"))
        .and(path("/pdp/piece"))
        .and(query_param("pieceCid", missing.to_string().as_str()))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock)
        .await;

    let server = server_for(&mock);
    server.find_piece(&known).await.unwrap();

    let err = server.find_piece(&other).await.unwrap_err();
    assert!(matches!(err, SpError::InvalidResponse(_)));

    let err = server.find_piece(&missing).await.unwrap_err();
    assert!(matches!(err, SpError::PieceNotFound(_)));
    assert!(err.is_not_found());
}

#[test(tokio::test)]
async fn test_find_piece_retries_transient_errors() {
    let mock = MockServer::start().await;
    let cid = piece(4);
    Mock::given(method("GET"))
        .and(path("/pdp/piece"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&mock)
        .await;
    Mock::given(method("GET"))
        .and(path("/pdp/piece"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "pieceCid": cid.to_string() })))
        .with_priority(2)
        .mount(&mock)
        .await;

    let config = PdpServerConfig::new(mock.uri()).with_request_retry(
        RetryPolicy::default()
            .with_max_retries(3)
            .with_backoff(Duration::from_millis(5), 2.0, Duration::from_millis(20)),
    );
    PdpServer::new(config).unwrap().find_piece(&cid).await.unwrap();
}

#[test(tokio::test)]
async fn test_wait_for_pull() {
    let mock = MockServer::start().await;
    let cid = piece(8);
    let request = PullRequest {
        record_keeper: "0xrk".to_string(),
        extra_data: extra(),
        data_set_id: Some(7),
        pieces: vec![PullPiece {
            piece_cid: cid,
            source_url: format!("https://primary.example.com/piece/{}", cid),
        }],
    };
    Mock::given(method("POST"))
        .and(path("/pdp/piece/pull"))
        .and(body_partial_json(json!({ "recordKeeper": "0xrk", "dataSetId": 7 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "inProgress" })))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&mock)
        .await;
    Mock::given(method("POST"))
        .and(path("/pdp/piece/pull"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "complete",
            "pieces": [{ "pieceCid": cid.to_string(), "status": "complete" }]
        })))
        .with_priority(2)
        .mount(&mock)
        .await;

    let policy = RetryPolicy::polling(Duration::from_millis(10), Duration::from_secs(5));
    let status = server_for(&mock)
        .wait_for_pull(&request, &policy, None)
        .await
        .unwrap();
    assert_eq!(status.status, PullState::Complete);
    assert_eq!(status.pieces.len(), 1);
}

#[test(tokio::test)]
async fn test_failed_pull() {
    let mock = MockServer::start().await;
    let cid = piece(9);
    Mock::given(method("POST"))
        .and(path("/pdp/piece/pull"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "failed",
            "pieces": [{ "pieceCid": cid.to_string(), "status": "failed" }]
        })))
        .mount(&mock)
        .await;

    let request = PullRequest {
        record_keeper: "0xrk".to_string(),
        extra_data: extra(),
        data_set_id: None,
        pieces: vec![PullPiece {
            piece_cid: cid,
            source_url: "https://primary.example.com/piece".to_string(),
        }],
    };
    let policy = RetryPolicy::polling(Duration::from_millis(10), Duration::from_secs(5));
    let err = server_for(&mock)
        .wait_for_pull(&request, &policy, None)
        .await
        .unwrap_err();
    match err {
        SpError::PullFailed(message) => assert!(message.contains(&cid.to_string())),
        other => panic!("expected pull failure, got {other}"),
    }
}

#[test(tokio::test)]
async fn test_download_piece() {
    let mock = MockServer::start().await;
    let cid = piece(10);
    let missing = piece(11);
    Mock::given(method("GET"))
        .and(path(format!("/piece/{}", cid)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![10u8; 256]))
        .mount(&mock)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/piece/{}", missing)))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock)
        .await;

    let server = server_for(&mock);
    let bytes = server.download_piece(&cid).await.unwrap();
    assert_eq!(bytes.as_ref(), &[10u8; 256][..]);

    let err = server.download_piece(&missing).await.unwrap_err();
    assert!(matches!(err, SpError::PieceNotFound(_)));
}

#[test(tokio::test)]
async fn test_delete_piece() {
    let mock = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/pdp/data-sets/7/pieces/3"))
        .and(body_partial_json(json!({ "extraData": extra().as_str() })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "txHash": "0x99" })))
        .mount(&mock)
        .await;

    let tx = server_for(&mock).delete_piece(7, 3, &extra()).await.unwrap();
    assert_eq!(tx, TxHash("0x99".to_string()));
}
