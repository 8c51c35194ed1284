//! DNSLink resolution over DNS-over-HTTPS with a durable answer cache.
//!
//! Resolution asks the configured DoH endpoint for the TXT records of
//! `_dnslink.<hostname>` and extracts the first `dnslink=/hyper/<key>`
//! answer. Every successful raw response body is written to the datastore so
//! a later lookup can still succeed while offline, and decoded keys are kept
//! in a process-lifetime memory cache because key assignments are expected
//! to be effectively permanent.

use crate::error::{Error, Result};
use crate::repo::{Column, DataStore};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::Instrument;
use url::Url;

/// Same default endpoint a fresh instance points at unless configured
/// otherwise.
pub const DEFAULT_DNS_RESOLVER: &str = "https://mozilla.cloudflare-dns.com/dns-query";

pub const DNSLINK_TXT_PREFIX: &str = "_dnslink.";
const DNSLINK_DATA_PREFIX: &str = "dnslink=/hyper/";

/// The subset of a DoH JSON response the resolver cares about.
#[derive(Debug, Deserialize)]
struct DnsResponse {
    #[serde(default, rename = "Answer")]
    answer: Vec<DnsAnswer>,
}

#[derive(Debug, Deserialize)]
struct DnsAnswer {
    #[serde(default)]
    name: String,
    #[serde(default)]
    data: String,
}

/// Transport seam for the resolver. The default implementation talks to a
/// real DoH endpoint, tests substitute canned bodies.
#[async_trait]
pub trait TxtFetcher: Send + Sync + 'static {
    /// Fetches the body of a `application/dns-json` query.
    async fn fetch(&self, url: &str) -> Result<String>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        HttpFetcher {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        HttpFetcher::new()
    }
}

#[async_trait]
impl TxtFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .header("accept", "application/dns-json")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Network(format!(
                "resolver returned {}",
                response.status()
            )));
        }
        Ok(response.text().await?)
    }
}

pub struct DnsResolver<TStore: DataStore> {
    resolver: String,
    fetcher: Box<dyn TxtFetcher>,
    store: Arc<TStore>,
    // hostname -> encoded key, never invalidated for the process lifetime
    memory: Mutex<HashMap<String, String>>,
}

impl<TStore: DataStore> DnsResolver<TStore> {
    pub fn new(store: Arc<TStore>, resolver: impl Into<String>, fetcher: Box<dyn TxtFetcher>) -> Self {
        DnsResolver {
            resolver: resolver.into(),
            fetcher,
            store,
            memory: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves a hostname to its encoded key via DNSLink.
    ///
    /// Falls back to the last persisted answer for the hostname when the
    /// network fetch fails, and returns the fetch error only if there is no
    /// cached answer either.
    pub async fn resolve(&self, hostname: &str) -> Result<String> {
        let span = tracing::trace_span!("dnslink", %hostname);

        async move {
            if let Some(hit) = self.memory.lock().unwrap().get(hostname) {
                return Ok(hit.clone());
            }

            let label = format!("{}{}", DNSLINK_TXT_PREFIX, hostname);
            // append_pair keeps any query parameters the endpoint already has
            let mut query = Url::parse(&self.resolver).map_err(|e| {
                Error::Network(format!("bad resolver endpoint {:?}: {}", self.resolver, e))
            })?;
            query
                .query_pairs_mut()
                .append_pair("name", &label)
                .append_pair("type", "TXT");

            let body = match self.fetcher.fetch(query.as_str()).await {
                Ok(body) => {
                    self.store
                        .put(Column::Dns, hostname.as_bytes(), body.as_bytes())
                        .await?;
                    body
                }
                Err(e) => {
                    tracing::debug!("fetch failed, trying cached answer: {}", e);
                    match self.store.get(Column::Dns, hostname.as_bytes()).await? {
                        Some(cached) => String::from_utf8(cached)
                            .map_err(|_| Error::Corrupt(format!("dns cache for {:?}", hostname)))?,
                        None => return Err(e),
                    }
                }
            };

            let response: DnsResponse = serde_json::from_str(&body)?;
            for answer in response.answer {
                if !answer.name.contains(&label) {
                    continue;
                }
                // TXT record data is often quoted in DoH responses
                let data = answer.data.trim_matches('"');
                if let Some(rest) = data.strip_prefix(DNSLINK_DATA_PREFIX) {
                    let key = match rest.find('/') {
                        Some(end) => &rest[..end],
                        None => rest,
                    };
                    tracing::trace!("dnslink found for {:?}", hostname);
                    self.memory
                        .lock()
                        .unwrap()
                        .insert(hostname.to_string(), key.to_string());
                    return Ok(key.to_string());
                }
            }

            Err(Error::DnsLinkNotFound { label })
        }
        .instrument(span)
        .await
    }
}
