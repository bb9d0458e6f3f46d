//! DexScreener discovery feed (free, no credits)
//!
//! ## API Reference
//!
//! - Latest profiles: `{base}/token-profiles/latest/v1`
//! - Latest boosts: `{base}/token-boosts/latest/v1`
//! - Token pairs: `{base}/token-pairs/v1/{chain}/{address}`
//!
//! Each discovery source is one feed page. Listings only carry addresses, so
//! every address is expanded through its first trading pair into a
//! [`MetricSnapshot`]. A failed lookup is reported back with the page; a
//! listing whose lookups all failed counts as a failed page. All requests
//! share one `governor` quota; HTTP 429 backs off exponentially.

use crate::pipeline::backoff::ExponentialBackoff;
use crate::pipeline::collaborators::{DiscoveryFeed, FeedPage, LookupFailure};
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::error::{FeedError, PipelineError};
use crate::pipeline::types::{Candidate, CandidateFilter, MetricSnapshot};
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::num::NonZeroU32;
use std::time::Duration;

/// Discovery source, one per feed page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedSource {
    Profiles,
    Boosts,
}

impl FeedSource {
    fn path(&self) -> &'static str {
        match self {
            FeedSource::Profiles => "token-profiles/latest/v1",
            FeedSource::Boosts => "token-boosts/latest/v1",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FeedSource::Profiles => "dexscreener:profiles",
            FeedSource::Boosts => "dexscreener:boosts",
        }
    }
}

/// Entry of a profiles/boosts listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListedToken {
    #[serde(rename = "chainId")]
    pub chain_id: String,
    #[serde(rename = "tokenAddress")]
    pub token_address: String,
}

/// DexScreener pair response structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DexScreenerPair {
    #[serde(rename = "baseToken")]
    pub base_token: Option<BaseToken>,
    #[serde(rename = "marketCap")]
    pub market_cap: Option<f64>,
    pub fdv: Option<f64>,
    pub volume: Option<PairVolume>,
    pub liquidity: Option<PairLiquidity>,
    /// Unix timestamp in milliseconds
    #[serde(rename = "pairCreatedAt")]
    pub pair_created_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseToken {
    pub address: Option<String>,
    pub name: Option<String>,
    pub symbol: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairVolume {
    pub h24: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairLiquidity {
    pub usd: Option<f64>,
}

/// Build a candidate from a token's first pair. `now_ms` is used for age.
pub fn pair_to_candidate(
    address: &str,
    pair: &DexScreenerPair,
    source: FeedSource,
    now_ms: i64,
) -> Candidate {
    let age_hours = pair
        .pair_created_at
        .filter(|created| *created > 0 && *created <= now_ms)
        .map(|created| (now_ms - created) as f64 / 3_600_000.0);

    let base = pair.base_token.as_ref();

    Candidate {
        address: address.to_string(),
        token_name: base.and_then(|b| b.name.clone()),
        token_symbol: base.and_then(|b| b.symbol.clone()),
        source: source.label().to_string(),
        snapshot: MetricSnapshot {
            market_cap_usd: pair.market_cap.or(pair.fdv),
            volume_24h_usd: pair.volume.as_ref().and_then(|v| v.h24),
            liquidity_usd: pair.liquidity.as_ref().and_then(|l| l.usd),
            age_hours,
            top_holder_share: None,
        },
    }
}

/// Combine the lookups of one listing into a page
pub fn assemble_page(
    listed: usize,
    candidates: Vec<Candidate>,
    failures: Vec<LookupFailure>,
) -> Result<FeedPage, FeedError> {
    if listed > 0 && failures.len() == listed {
        let first = failures.first().map(|f| f.message.as_str()).unwrap_or_default();
        return Err(FeedError::Http(format!(
            "all {} pair lookups failed (first: {})",
            listed, first
        )));
    }

    Ok(FeedPage {
        candidates,
        failures,
    })
}

pub struct DexScreenerFeed {
    client: reqwest::Client,
    base_url: String,
    chain: String,
    sources: Vec<FeedSource>,
    limiter: DefaultDirectRateLimiter,
}

impl DexScreenerFeed {
    pub fn new(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| PipelineError::Config(format!("HTTP client: {}", e)))?;

        let rate = NonZeroU32::new(config.dexscreener_requests_per_minute.max(1))
            .unwrap_or(NonZeroU32::MIN);

        Ok(Self {
            client,
            base_url: config.dexscreener_base_url.trim_end_matches('/').to_string(),
            chain: config.chain.clone(),
            sources: vec![FeedSource::Profiles, FeedSource::Boosts],
            limiter: RateLimiter::direct(Quota::per_minute(rate)),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FeedError> {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(8), 3);

        loop {
            self.limiter.until_ready().await;

            let response = self.client.get(url).send().await?;
            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                if backoff.sleep().await.is_err() {
                    return Err(FeedError::RateLimited(url.to_string()));
                }
                continue;
            }

            if !status.is_success() {
                return Err(FeedError::Http(format!("DexScreener API error: {} ({})", status, url)));
            }

            return Ok(response.json::<T>().await?);
        }
    }

    /// Addresses on a listing, filtered to the configured chain, deduped
    async fn list_addresses(&self, source: FeedSource) -> Result<Vec<String>, FeedError> {
        let url = format!("{}/{}", self.base_url, source.path());
        let listed: Vec<ListedToken> = self.get_json(&url).await?;

        let mut seen = HashSet::new();
        Ok(listed
            .into_iter()
            .filter(|t| t.chain_id == self.chain)
            .filter(|t| seen.insert(t.token_address.clone()))
            .map(|t| t.token_address)
            .collect())
    }

    pub async fn token_pairs(&self, address: &str) -> Result<Vec<DexScreenerPair>, FeedError> {
        let url = format!("{}/token-pairs/v1/{}/{}", self.base_url, self.chain, address);
        self.get_json(&url).await
    }
}

#[async_trait]
impl DiscoveryFeed for DexScreenerFeed {
    fn page_count(&self) -> usize {
        self.sources.len()
    }

    async fn fetch_page(&self, page: usize, _filter: &CandidateFilter) -> Result<FeedPage, FeedError> {
        let source = *self
            .sources
            .get(page)
            .ok_or_else(|| FeedError::Parse(format!("no feed page {}", page)))?;

        let addresses = self.list_addresses(source).await?;
        let listed = addresses.len();
        log::debug!("📡 {}: {} listed addresses", source.label(), listed);

        let mut candidates = Vec::with_capacity(listed);
        let mut failures = Vec::new();
        for address in addresses {
            match self.token_pairs(&address).await {
                Ok(pairs) => match pairs.first() {
                    Some(pair) => {
                        let now_ms = chrono::Utc::now().timestamp_millis();
                        candidates.push(pair_to_candidate(&address, pair, source, now_ms));
                    }
                    None => log::debug!("   ├─ {} has no pairs", address),
                },
                Err(e) => {
                    log::warn!("⚠️  Pair lookup failed for {}: {}", address, e);
                    failures.push(LookupFailure {
                        address,
                        message: e.to_string(),
                    });
                }
            }
        }

        assemble_page(listed, candidates, failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAIR_JSON: &str = r#"[{
        "chainId": "solana",
        "baseToken": {"address": "MintA", "name": "Alpha", "symbol": "ALP"},
        "quoteToken": {"symbol": "SOL"},
        "priceUsd": "0.0012",
        "marketCap": 120000.5,
        "fdv": 130000.0,
        "volume": {"h24": 45000.0, "h6": 1000.0},
        "liquidity": {"usd": 18000.0, "base": 1, "quote": 2},
        "pairCreatedAt": 1700000000000
    }]"#;

    #[test]
    fn test_pair_to_candidate() {
        let pairs: Vec<DexScreenerPair> = serde_json::from_str(PAIR_JSON).unwrap();
        let now_ms = 1_700_000_000_000 + 6 * 3_600_000;

        let candidate = pair_to_candidate("MintA", &pairs[0], FeedSource::Boosts, now_ms);

        assert_eq!(candidate.address, "MintA");
        assert_eq!(candidate.token_name.as_deref(), Some("Alpha"));
        assert_eq!(candidate.token_symbol.as_deref(), Some("ALP"));
        assert_eq!(candidate.source, "dexscreener:boosts");
        assert_eq!(candidate.snapshot.market_cap_usd, Some(120_000.5));
        assert_eq!(candidate.snapshot.volume_24h_usd, Some(45_000.0));
        assert_eq!(candidate.snapshot.liquidity_usd, Some(18_000.0));
        assert_eq!(candidate.snapshot.age_hours, Some(6.0));
    }

    #[test]
    fn test_sparse_pair_falls_back_to_fdv() {
        let pair: DexScreenerPair =
            serde_json::from_str(r#"{"fdv": 9000.0, "pairCreatedAt": null}"#).unwrap();
        let candidate = pair_to_candidate("MintB", &pair, FeedSource::Profiles, 0);

        assert_eq!(candidate.snapshot.market_cap_usd, Some(9_000.0));
        assert_eq!(candidate.snapshot.volume_24h_usd, None);
        assert_eq!(candidate.snapshot.age_hours, None);
        assert_eq!(candidate.token_name, None);
    }

    #[test]
    fn test_listing_parse() {
        let listed: Vec<ListedToken> = serde_json::from_str(
            r#"[{"chainId": "solana", "tokenAddress": "MintA", "url": "x"},
                {"chainId": "base", "tokenAddress": "0xabc"}]"#,
        )
        .unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].chain_id, "base");
    }

    fn failure(address: &str) -> LookupFailure {
        LookupFailure {
            address: address.to_string(),
            message: "HTTP error: 502".to_string(),
        }
    }

    #[test]
    fn test_page_with_every_lookup_failed_is_an_error() {
        let result = assemble_page(2, Vec::new(), vec![failure("MintA"), failure("MintB")]);

        match result {
            Err(FeedError::Http(message)) => {
                assert!(message.contains("all 2 pair lookups failed"));
                assert!(message.contains("502"));
            }
            other => panic!("expected HTTP error, got {:?}", other),
        }
    }

    #[test]
    fn test_partial_lookup_failures_are_returned_with_the_page() {
        let pairs: Vec<DexScreenerPair> = serde_json::from_str(PAIR_JSON).unwrap();
        let candidate = pair_to_candidate("MintA", &pairs[0], FeedSource::Profiles, 0);

        let page = assemble_page(2, vec![candidate], vec![failure("MintB")]).unwrap();
        assert_eq!(page.candidates.len(), 1);
        assert_eq!(page.failures, vec![failure("MintB")]);

        // Empty listings and pair-less tokens are not failures
        assert_eq!(assemble_page(0, Vec::new(), Vec::new()).unwrap(), FeedPage::default());
        assert!(assemble_page(1, Vec::new(), Vec::new()).unwrap().candidates.is_empty());
    }

    #[tokio::test]
    #[ignore] // Run only when testing with live API
    async fn test_fetch_live_profiles() {
        let feed = DexScreenerFeed::new(&PipelineConfig::from_env()).unwrap();
        let filter = CandidateFilter {
            mc_min: 0.0,
            volume_min: 0.0,
            liquidity_min: 0.0,
            age_max_hours: 10_000.0,
        };

        let page = feed.fetch_page(0, &filter).await.unwrap();
        println!("{} candidates, {} failed lookups", page.candidates.len(), page.failures.len());
    }
}
