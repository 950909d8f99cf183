//! Piece retrieval strategies
//!
//! Retrievers are tried in order by a [`RetrieverChain`]: CDN first when
//! requested, then providers found through the caller's data sets, then a
//! fixed list of known providers. Every result is verified against the
//! requested piece CID before it is returned.

use crate::chain::{ChainAccess, ProviderConnector};
use crate::types::{same_address, Address, ProviderId, ProviderInfo};
use crate::{Result, StorageError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::future::{select_ok, BoxFuture};
use futures::{FutureExt, StreamExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use synapse_piece::{PieceCid, PieceVerifier};
use synapse_sp::{ProviderClient, SpError};
use tracing::{debug, instrument, warn};

/// Default CDN URL layout
pub const DEFAULT_CDN_TEMPLATE: &str = "https://{client}.{domain}/{cid}";

/// Per-call retrieval hints
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetrievalOptions {
    pub with_cdn: bool,
    /// Only fetch from this provider
    pub provider_address: Option<Address>,
}

/// A way of fetching piece bytes for a client
#[async_trait]
pub trait PieceRetriever: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_piece(
        &self,
        client: &str,
        piece_cid: &PieceCid,
        options: &RetrievalOptions,
    ) -> Result<Bytes>;
}

// ==================== CDN ====================

/// Fetches pieces through the content delivery network
pub struct CdnRetriever {
    http: reqwest::Client,
    template: String,
    domain: String,
}

impl CdnRetriever {
    /// Retriever for `https://{client}.{domain}/{cid}`
    pub fn new(domain: impl Into<String>) -> Self {
        Self::with_template(DEFAULT_CDN_TEMPLATE, domain)
    }

    /// Retriever with a custom URL layout
    ///
    /// `{client}`, `{domain}` and `{cid}` are substituted.
    pub fn with_template(template: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            template: template.into(),
            domain: domain.into(),
        }
    }

    pub fn url_for(&self, client: &str, piece_cid: &PieceCid) -> String {
        self.template
            .replace("{client}", &client.to_lowercase())
            .replace("{domain}", &self.domain)
            .replace("{cid}", &piece_cid.to_string())
    }
}

#[async_trait]
impl PieceRetriever for CdnRetriever {
    fn name(&self) -> &str {
        "cdn"
    }

    #[instrument(skip(self, piece_cid, options), fields(piece_cid = %piece_cid))]
    async fn fetch_piece(
        &self,
        client: &str,
        piece_cid: &PieceCid,
        options: &RetrievalOptions,
    ) -> Result<Bytes> {
        if !options.with_cdn {
            return Err(StorageError::Retrieval("CDN retrieval not requested".to_string()));
        }
        let url = self.url_for(client, piece_cid);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| StorageError::Retrieval(format!("GET {}: {}", url, e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::PieceNotFound(piece_cid.to_string()));
        }
        if !status.is_success() {
            return Err(StorageError::Retrieval(format!("CDN returned {} for {}", status, url)));
        }

        let mut verifier = PieceVerifier::new();
        let mut body = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| StorageError::Retrieval(format!("reading {}: {}", url, e)))?;
            verifier.update(&chunk);
            body.extend_from_slice(&chunk);
        }
        verifier.finish_and_check(piece_cid)?;
        debug!(bytes = body.len(), "piece served by CDN");
        Ok(body.freeze())
    }
}

// ==================== Providers ====================

/// Ask every provider whether it holds the piece and download from the
/// first one that answers yes
pub(crate) async fn race_download(
    connector: &dyn ProviderConnector,
    providers: &[ProviderInfo],
    piece_cid: &PieceCid,
) -> Result<Bytes> {
    let probes: Vec<BoxFuture<'_, std::result::Result<Arc<dyn ProviderClient>, SpError>>> = providers
        .iter()
        .filter_map(|provider| match connector.connect(provider) {
            Ok(client) => Some(client),
            Err(e) => {
                warn!(provider_id = provider.id, error = %e, "skipping unreachable provider");
                None
            }
        })
        .map(|client| {
            async move {
                client.find_piece(piece_cid).await?;
                Ok::<_, SpError>(client)
            }
            .boxed()
        })
        .collect();

    if probes.is_empty() {
        return Err(StorageError::Retrieval(format!(
            "no provider to ask for {}",
            piece_cid
        )));
    }

    let (client, _) = select_ok(probes).await.map_err(|e| {
        StorageError::Retrieval(format!("no provider holds {}: {}", piece_cid, e))
    })?;
    debug!(url = client.service_url(), "provider holds piece");
    Ok(client.download_piece(piece_cid).await?)
}

/// Finds providers through the client's data sets on chain
pub struct ChainRetriever {
    chain: Arc<dyn ChainAccess>,
    connector: Arc<dyn ProviderConnector>,
}

impl ChainRetriever {
    pub fn new(chain: Arc<dyn ChainAccess>, connector: Arc<dyn ProviderConnector>) -> Self {
        Self { chain, connector }
    }

    /// Active providers holding a live data set for `client`
    async fn candidates(&self, client: &str, only: Option<&str>) -> Result<Vec<ProviderInfo>> {
        let mut seen = BTreeSet::new();
        let ids: Vec<ProviderId> = self
            .chain
            .client_data_sets(client)
            .await?
            .into_iter()
            .filter(|ds| ds.is_live() && !ds.is_terminated())
            .map(|ds| ds.provider_id)
            .filter(|id| seen.insert(*id))
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        Ok(self
            .chain
            .providers_by_ids(&ids)
            .await?
            .into_iter()
            .flatten()
            .filter(|p| p.active)
            .filter(|p| only.map_or(true, |address| same_address(&p.service_provider, address)))
            .collect())
    }
}

#[async_trait]
impl PieceRetriever for ChainRetriever {
    fn name(&self) -> &str {
        "chain"
    }

    async fn fetch_piece(
        &self,
        client: &str,
        piece_cid: &PieceCid,
        options: &RetrievalOptions,
    ) -> Result<Bytes> {
        let providers = self
            .candidates(client, options.provider_address.as_deref())
            .await?;
        if providers.is_empty() {
            return Err(StorageError::Retrieval(format!(
                "{} has no live data sets to fetch from",
                client
            )));
        }
        race_download(self.connector.as_ref(), &providers, piece_cid).await
    }
}

/// Queries a fixed list of providers
pub struct ProvidersRetriever {
    providers: Vec<ProviderInfo>,
    connector: Arc<dyn ProviderConnector>,
}

impl ProvidersRetriever {
    pub fn new(providers: Vec<ProviderInfo>, connector: Arc<dyn ProviderConnector>) -> Self {
        Self {
            providers,
            connector,
        }
    }
}

#[async_trait]
impl PieceRetriever for ProvidersRetriever {
    fn name(&self) -> &str {
        "providers"
    }

    async fn fetch_piece(
        &self,
        _client: &str,
        piece_cid: &PieceCid,
        options: &RetrievalOptions,
    ) -> Result<Bytes> {
        let providers: Vec<ProviderInfo> = match &options.provider_address {
            Some(address) => self
                .providers
                .iter()
                .filter(|p| same_address(&p.service_provider, address))
                .cloned()
                .collect(),
            None => self.providers.clone(),
        };
        race_download(self.connector.as_ref(), &providers, piece_cid).await
    }
}

// ==================== Chain of retrievers ====================

/// Tries retrievers in order until one returns verified bytes
#[derive(Clone, Default)]
pub struct RetrieverChain {
    retrievers: Vec<Arc<dyn PieceRetriever>>,
}

impl RetrieverChain {
    pub fn new(retrievers: Vec<Arc<dyn PieceRetriever>>) -> Self {
        Self { retrievers }
    }

    pub fn push(&mut self, retriever: Arc<dyn PieceRetriever>) {
        self.retrievers.push(retriever);
    }

    pub fn len(&self) -> usize {
        self.retrievers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retrievers.is_empty()
    }
}

#[async_trait]
impl PieceRetriever for RetrieverChain {
    fn name(&self) -> &str {
        "chain of retrievers"
    }

    #[instrument(skip(self, piece_cid, options), fields(piece_cid = %piece_cid))]
    async fn fetch_piece(
        &self,
        client: &str,
        piece_cid: &PieceCid,
        options: &RetrievalOptions,
    ) -> Result<Bytes> {
        if self.retrievers.is_empty() {
            return Err(StorageError::Retrieval("no retrievers configured".to_string()));
        }

        let mut errors = Vec::with_capacity(self.retrievers.len());
        for retriever in &self.retrievers {
            let outcome = retriever
                .fetch_piece(client, piece_cid, options)
                .await
                .and_then(|bytes| {
                    let mut verifier = PieceVerifier::new();
                    verifier.update(&bytes);
                    verifier.finish_and_check(piece_cid)?;
                    Ok(bytes)
                });
            match outcome {
                Ok(bytes) => {
                    debug!(retriever = retriever.name(), "piece retrieved");
                    return Ok(bytes);
                }
                Err(e) => {
                    debug!(retriever = retriever.name(), error = %e, "retriever failed");
                    errors.push(format!("{}: {}", retriever.name(), e));
                }
            }
        }
        Err(StorageError::Retrieval(errors.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{DataSetSeed, MemoryNetwork};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CLIENT: &str = "0x00000000000000000000000000000000000000AA";

    struct Fixed {
        bytes: std::result::Result<Bytes, String>,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn ok(bytes: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                bytes: Ok(Bytes::copy_from_slice(bytes)),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(reason: &str) -> Arc<Self> {
            Arc::new(Self {
                bytes: Err(reason.to_string()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PieceRetriever for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn fetch_piece(&self, _: &str, _: &PieceCid, _: &RetrievalOptions) -> Result<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.bytes.clone().map_err(StorageError::Retrieval)
        }
    }

    #[tokio::test]
    async fn test_chain_skips_failures_and_bad_bytes() {
        let good = vec![7u8; 300];
        let cid = synapse_piece::calculate(&good);
        let failing = Fixed::failing("offline");
        let corrupt = Fixed::ok(&[8u8; 300]);
        let correct = Fixed::ok(&good);
        let chain = RetrieverChain::new(vec![failing.clone(), corrupt.clone(), correct.clone()]);

        let bytes = chain
            .fetch_piece(CLIENT, &cid, &RetrievalOptions::default())
            .await
            .unwrap();
        assert_eq!(bytes.as_ref(), good.as_slice());
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(corrupt.calls.load(Ordering::SeqCst), 1);
        assert_eq!(correct.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_chain_reports_every_failure() {
        let cid = synapse_piece::calculate(&[1u8; 200]);
        let chain = RetrieverChain::new(vec![Fixed::failing("a down"), Fixed::failing("b down")]);

        let err = chain
            .fetch_piece(CLIENT, &cid, &RetrievalOptions::default())
            .await
            .unwrap_err();
        let message = match err {
            StorageError::Retrieval(message) => message,
            other => panic!("unexpected error: {other}"),
        };
        assert!(message.contains("a down") && message.contains("b down"));

        let empty = RetrieverChain::default()
            .fetch_piece(CLIENT, &cid, &RetrievalOptions::default())
            .await;
        assert!(matches!(empty, Err(StorageError::Retrieval(_))));
    }

    #[tokio::test]
    async fn test_cdn_fetch_verifies_stream() {
        let server = MockServer::start().await;
        let data = vec![3u8; 4096];
        let cid = synapse_piece::calculate(&data);
        let wrong = synapse_piece::calculate(&[4u8; 4096]);

        Mock::given(method("GET"))
            .and(path(format!("/{}/{}", CLIENT.to_lowercase(), cid)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(data.clone()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/{}/{}", CLIENT.to_lowercase(), wrong)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(data.clone()))
            .mount(&server)
            .await;

        let cdn = CdnRetriever::with_template(format!("{}/{{client}}/{{cid}}", server.uri()), "unused");
        let cdn_on = RetrievalOptions {
            with_cdn: true,
            provider_address: None,
        };

        let bytes = cdn.fetch_piece(CLIENT, &cid, &cdn_on).await.unwrap();
        assert_eq!(bytes.len(), 4096);

        let mismatch = cdn.fetch_piece(CLIENT, &wrong, &cdn_on).await.unwrap_err();
        assert!(matches!(mismatch, StorageError::InvalidPiece(_)));

        let missing = synapse_piece::calculate(&[5u8; 200]);
        let err = cdn.fetch_piece(CLIENT, &missing, &cdn_on).await.unwrap_err();
        assert!(err.is_not_found());

        let off = cdn
            .fetch_piece(CLIENT, &cid, &RetrievalOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(off, StorageError::Retrieval(_)));
    }

    #[test]
    fn test_default_cdn_url() {
        let cid = synapse_piece::calculate(&[0u8; 200]);
        let cdn = CdnRetriever::new("calibration.filbeam.io");
        assert_eq!(
            cdn.url_for("0xABC", &cid),
            format!("https://0xabc.calibration.filbeam.io/{}", cid)
        );
    }

    #[tokio::test]
    async fn test_chain_retriever_uses_data_set_providers() {
        let network = MemoryNetwork::new();
        let a = network.add_provider("a");
        let b = network.add_provider("b");
        let c = network.add_provider("c");
        network.seed_data_set(DataSetSeed::new(CLIENT, a.id));
        network.seed_data_set(DataSetSeed::new(CLIENT, b.id));
        network.seed_data_set(DataSetSeed::new(CLIENT, c.id).terminated());

        let data = Bytes::from(vec![6u8; 500]);
        let cid = network.park(b.id, data.clone());
        network.park(c.id, data.clone());

        let retriever = ChainRetriever::new(network.chain(), network.connector());
        let bytes = retriever
            .fetch_piece(CLIENT, &cid, &RetrievalOptions::default())
            .await
            .unwrap();
        assert_eq!(bytes, data);
        assert_eq!(network.download_calls(b.id), 1);
        assert_eq!(network.download_calls(c.id), 0);

        let pinned = RetrievalOptions {
            with_cdn: false,
            provider_address: Some(a.service_provider.clone()),
        };
        let err = retriever.fetch_piece(CLIENT, &cid, &pinned).await.unwrap_err();
        assert!(matches!(err, StorageError::Retrieval(_)));
    }

    #[tokio::test]
    async fn test_providers_retriever() {
        let network = MemoryNetwork::new();
        let a = network.add_provider("a");
        let b = network.add_provider("b");
        let data = Bytes::from(vec![9u8; 300]);
        let cid = network.park(a.id, data.clone());

        let retriever = ProvidersRetriever::new(vec![a.clone(), b.clone()], network.connector());
        assert_eq!(
            retriever
                .fetch_piece(CLIENT, &cid, &RetrievalOptions::default())
                .await
                .unwrap(),
            data
        );

        let only_b = RetrievalOptions {
            with_cdn: false,
            provider_address: Some(b.service_provider),
        };
        assert!(retriever.fetch_piece(CLIENT, &cid, &only_b).await.is_err());
    }
}
