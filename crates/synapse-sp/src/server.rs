//! HTTP client for a provider's PDP service
//!
//! Endpoints:
//! - `GET  /pdp/ping`
//! - `POST /pdp/data-sets`, `POST /pdp/data-sets/create-and-add`
//! - `GET  /pdp/data-sets/created/{tx}`
//! - `POST /pdp/data-sets/{id}/pieces`, `GET /pdp/data-sets/{id}/pieces/added/{tx}`
//! - `DELETE /pdp/data-sets/{id}/pieces/{piece_id}`
//! - `POST /pdp/piece` + `PUT /pdp/piece/upload/{upload_id}`, `GET /pdp/piece?pieceCid=`
//! - `POST /pdp/piece/pull`
//! - `GET  /piece/{cid}`

use crate::types::{
    AddPiecesBody, CreateAndAddBody, CreateDataSetBody, DataSetCreationStatus, ExtraDataBody,
    FindPieceResponse, PieceAdditionStatus, PieceUploadBody, TxHashResponse,
};
use crate::{
    poll_until, retry, AddPieceEntry, DataSetCreated, DataSetId, ExtraData, PieceId, PiecesAdded,
    ProviderClient, PullRequest, PullStatus, Result, RetryPolicy, SpError, TxHandle, TxHash,
    UploadedPiece,
};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, Client, Response, StatusCode};
use std::time::Duration;
use synapse_piece::PieceCid;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Configuration for a PDP server connection
#[derive(Clone, Debug)]
pub struct PdpServerConfig {
    /// Provider service URL (e.g., "https://sp.example.com")
    pub service_url: String,
    /// Per-request timeout
    pub timeout: Duration,
    /// Retry policy for idempotent requests
    pub request_retry: RetryPolicy,
    /// Polling policy for transaction status
    pub status_poll: RetryPolicy,
    /// User agent string
    pub user_agent: String,
}

impl PdpServerConfig {
    /// Create a new config for a service URL
    pub fn new(service_url: impl Into<String>) -> Self {
        Self {
            service_url: service_url.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(60),
            request_retry: RetryPolicy::default(),
            status_poll: RetryPolicy::polling(Duration::from_secs(1), Duration::from_secs(300)),
            user_agent: format!("synapse-sp/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Set timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the transaction status polling policy
    pub fn with_status_poll(mut self, policy: RetryPolicy) -> Self {
        self.status_poll = policy;
        self
    }

    /// Set the retry policy for idempotent requests
    pub fn with_request_retry(mut self, policy: RetryPolicy) -> Self {
        self.request_retry = policy;
        self
    }
}

/// PDP server client
#[derive(Clone)]
pub struct PdpServer {
    client: Client,
    config: PdpServerConfig,
}

impl PdpServer {
    /// Create a new PDP server client
    pub fn new(config: PdpServerConfig) -> Result<Self> {
        url::Url::parse(&config.service_url)
            .map_err(|e| SpError::Configuration(format!("{}: {}", config.service_url, e)))?;

        let mut headers = header::HeaderMap::new();
        let agent = config
            .user_agent
            .parse()
            .map_err(|_| SpError::Configuration("invalid user agent".to_string()))?;
        headers.insert(header::USER_AGENT, agent);

        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| SpError::Connection(e.to_string()))?;

        Ok(Self { client, config })
    }

    /// Get the configuration
    pub fn config(&self) -> &PdpServerConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.service_url, path)
    }

    /// Turn a `Location` header into a full status URL and tx hash
    fn tx_handle_from(&self, response: &Response, operation: &str) -> Result<TxHandle> {
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                SpError::InvalidResponse(format!("{}: missing Location header", operation))
            })?;

        let tx_hash = location
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                SpError::InvalidResponse(format!("{}: malformed Location {}", operation, location))
            })?;

        let status_url = if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else {
            self.url(location)
        };

        Ok(TxHandle {
            tx_hash: TxHash(tx_hash.to_string()),
            status_url,
        })
    }

    async fn send_cancellable(
        &self,
        request: reqwest::RequestBuilder,
        cancel: Option<&CancellationToken>,
    ) -> Result<Response> {
        match cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(SpError::Aborted),
                response = request.send() => Ok(response?),
            },
            None => Ok(request.send().await?),
        }
    }

    async fn creation_status(&self, status_url: &str) -> Result<Option<DataSetCreated>> {
        let response = self.client.get(status_url).send().await?;
        let response = check_status(response, "data set creation status").await?;
        let status: DataSetCreationStatus = response.json().await?;
        debug!(?status, "data set creation status");

        let tx_hash = status_url.rsplit('/').next().unwrap_or_default().to_string();
        if status.tx_status == "rejected" || status.ok == Some(false) {
            return Err(SpError::Rejected {
                tx_hash,
                reason: format!("data set creation failed (txStatus={})", status.tx_status),
            });
        }
        match (status.data_set_created, status.data_set_id) {
            (true, Some(data_set_id)) => Ok(Some(DataSetCreated {
                data_set_id,
                tx_hash: TxHash(tx_hash),
            })),
            _ => Ok(None),
        }
    }

    async fn addition_status(
        &self,
        data_set_id: DataSetId,
        tx_hash: &TxHash,
    ) -> Result<Option<PiecesAdded>> {
        let url = self.url(&format!(
            "/pdp/data-sets/{}/pieces/added/{}",
            data_set_id, tx_hash
        ));
        let response = self.client.get(&url).send().await?;
        // The addition record only appears once the provider has seen the tx
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response, "piece addition status").await?;
        let status: PieceAdditionStatus = response.json().await?;
        debug!(?status, "piece addition status");

        if status.tx_status == "rejected" || status.add_message_ok == Some(false) {
            return Err(SpError::Rejected {
                tx_hash: tx_hash.to_string(),
                reason: format!("piece addition failed (txStatus={})", status.tx_status),
            });
        }
        match (status.add_message_ok, status.confirmed_piece_ids) {
            (Some(true), Some(piece_ids)) => Ok(Some(PiecesAdded {
                data_set_id,
                tx_hash: tx_hash.clone(),
                piece_ids,
            })),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl ProviderClient for PdpServer {
    fn service_url(&self) -> &str {
        &self.config.service_url
    }

    #[instrument(skip(self), fields(url = %self.config.service_url))]
    async fn ping(&self) -> Result<()> {
        let url = self.url("/pdp/ping");
        let response = self.client.get(&url).send().await?;
        check_status(response, "ping").await?;
        Ok(())
    }

    #[instrument(skip(self, extra_data))]
    async fn create_data_set(
        &self,
        record_keeper: &str,
        extra_data: &ExtraData,
    ) -> Result<TxHandle> {
        let response = self
            .client
            .post(self.url("/pdp/data-sets"))
            .json(&CreateDataSetBody {
                record_keeper,
                extra_data,
            })
            .send()
            .await?;
        let response = check_status(response, "create data set").await?;
        let handle = self.tx_handle_from(&response, "create data set")?;
        info!(tx_hash = %handle.tx_hash, "data set creation submitted");
        Ok(handle)
    }

    #[instrument(skip(self, pieces, extra_data), fields(pieces = pieces.len()))]
    async fn create_and_add_pieces(
        &self,
        record_keeper: &str,
        pieces: &[PieceCid],
        extra_data: &ExtraData,
    ) -> Result<TxHandle> {
        let response = self
            .client
            .post(self.url("/pdp/data-sets/create-and-add"))
            .json(&CreateAndAddBody {
                record_keeper,
                pieces: pieces.iter().copied().map(AddPieceEntry::single).collect(),
                extra_data,
            })
            .send()
            .await?;
        let response = check_status(response, "create data set and add pieces").await?;
        let handle = self.tx_handle_from(&response, "create data set and add pieces")?;
        info!(tx_hash = %handle.tx_hash, "data set creation with pieces submitted");
        Ok(handle)
    }

    #[instrument(skip(self, tx), fields(tx_hash = %tx.tx_hash))]
    async fn wait_for_data_set_creation(&self, tx: &TxHandle) -> Result<DataSetCreated> {
        poll_until(&self.config.status_poll, "data set creation", None, move || {
            self.creation_status(&tx.status_url)
        })
        .await
    }

    #[instrument(skip(self, pieces, extra_data), fields(pieces = pieces.len()))]
    async fn add_pieces(
        &self,
        data_set_id: DataSetId,
        pieces: &[PieceCid],
        extra_data: &ExtraData,
    ) -> Result<TxHandle> {
        let response = self
            .client
            .post(self.url(&format!("/pdp/data-sets/{}/pieces", data_set_id)))
            .json(&AddPiecesBody {
                pieces: pieces.iter().copied().map(AddPieceEntry::single).collect(),
                extra_data,
            })
            .send()
            .await?;
        let response = check_status(response, "add pieces").await?;
        let handle = self.tx_handle_from(&response, "add pieces")?;
        info!(tx_hash = %handle.tx_hash, "piece addition submitted");
        Ok(handle)
    }

    #[instrument(skip(self))]
    async fn wait_for_pieces_added(
        &self,
        data_set_id: DataSetId,
        tx_hash: &TxHash,
    ) -> Result<PiecesAdded> {
        poll_until(&self.config.status_poll, "piece addition", None, move || {
            self.addition_status(data_set_id, tx_hash)
        })
        .await
    }

    #[instrument(skip(self, data, cancel), fields(size = data.len(), piece = %piece_cid))]
    async fn upload_piece(
        &self,
        data: Bytes,
        piece_cid: &PieceCid,
        cancel: Option<&CancellationToken>,
    ) -> Result<UploadedPiece> {
        let size = data.len() as u64;
        let create = self.client.post(self.url("/pdp/piece")).json(&PieceUploadBody {
            piece_cid: *piece_cid,
            size,
        });
        let response = self.send_cancellable(create, cancel).await?;

        // 200 means the provider already holds this piece
        if response.status() == StatusCode::OK {
            debug!("piece already present on provider");
            return Ok(UploadedPiece {
                piece_cid: *piece_cid,
                size,
                already_present: true,
            });
        }
        let response = check_status(response, "create upload").await?;
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| SpError::InvalidResponse("upload: missing Location header".into()))?
            .to_string();

        let put = self
            .client
            .put(self.url(&location))
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(data);
        let response = self.send_cancellable(put, cancel).await?;
        check_status(response, "upload piece").await?;

        info!("piece uploaded");
        Ok(UploadedPiece {
            piece_cid: *piece_cid,
            size,
            already_present: false,
        })
    }

    #[instrument(skip(self), fields(piece = %piece_cid))]
    async fn find_piece(&self, piece_cid: &PieceCid) -> Result<()> {
        let cid = piece_cid.to_string();
        let query = cid.as_str();
        let response = retry(&self.config.request_retry, "find piece", move || async move {
            let response = self
                .client
                .get(self.url("/pdp/piece"))
                .query(&[("pieceCid", query)])
                .send()
                .await?;
            reject_transient(response, "find piece").await
        })
        .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(SpError::PieceNotFound(cid));
        }
        let response = check_status(response, "find piece").await?;
        let found: FindPieceResponse = response.json().await?;
        if found.piece_cid != *piece_cid {
            return Err(SpError::InvalidResponse(format!(
                "asked for {}, provider answered {}",
                piece_cid, found.piece_cid
            )));
        }
        Ok(())
    }

    #[instrument(skip(self, request), fields(pieces = request.pieces.len()))]
    async fn pull_pieces(&self, request: &PullRequest) -> Result<PullStatus> {
        let response = retry(&self.config.request_retry, "pull pieces", move || async move {
            let response = self
                .client
                .post(self.url("/pdp/piece/pull"))
                .json(request)
                .send()
                .await?;
            check_status(response, "pull pieces").await
        })
        .await?;
        Ok(response.json().await?)
    }

    #[instrument(skip(self), fields(piece = %piece_cid))]
    async fn download_piece(&self, piece_cid: &PieceCid) -> Result<Bytes> {
        let url = self.url(&format!("/piece/{}", piece_cid));
        let url = url.as_str();
        let response = retry(&self.config.request_retry, "download piece", move || async move {
            let response = self.client.get(url).send().await?;
            reject_transient(response, "download piece").await
        })
        .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(SpError::PieceNotFound(piece_cid.to_string()));
        }
        let response = check_status(response, "download piece").await?;
        Ok(response.bytes().await?)
    }

    #[instrument(skip(self, extra_data))]
    async fn delete_piece(
        &self,
        data_set_id: DataSetId,
        piece_id: PieceId,
        extra_data: &ExtraData,
    ) -> Result<TxHash> {
        let url = self.url(&format!(
            "/pdp/data-sets/{}/pieces/{}",
            data_set_id, piece_id
        ));
        let response = self
            .client
            .delete(&url)
            .json(&ExtraDataBody { extra_data })
            .send()
            .await?;
        let response = check_status(response, "delete piece").await?;
        let body: TxHashResponse = response.json().await?;
        info!(tx_hash = %body.tx_hash, "piece removal submitted");
        Ok(body.tx_hash)
    }
}

/// Map non-success statuses to `SpError::Status`
async fn check_status(response: Response, operation: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SpError::Status {
        operation: operation.to_string(),
        status: status.as_u16(),
        body,
    })
}

/// Turn 429 and 5xx into errors so `retry` sees them; pass everything else through
async fn reject_transient(response: Response, operation: &str) -> Result<Response> {
    let status = response.status();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return check_status(response, operation).await;
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_trims_trailing_slash() {
        let config = PdpServerConfig::new("https://sp.example.com/");
        assert_eq!(config.service_url, "https://sp.example.com");
    }

    #[test]
    fn test_rejects_invalid_url() {
        let result = PdpServer::new(PdpServerConfig::new("not a url"));
        assert!(matches!(result, Err(SpError::Configuration(_))));
    }

    #[test]
    fn test_piece_url() {
        let server = PdpServer::new(PdpServerConfig::new("https://sp.example.com")).unwrap();
        let piece = synapse_piece::calculate(&[3u8; 128]);
        assert_eq!(
            server.piece_url(&piece),
            format!("https://sp.example.com/piece/{}", piece)
        );
    }
}
