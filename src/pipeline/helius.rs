//! Helius enrichment API (paid, metered)
//!
//! One enrichment is two JSON-RPC calls, one credit each:
//! - `getAsset`: name, symbol, supply, `price_info.total_price` (market cap)
//! - `getTokenLargestAccounts`: largest holder balance → top holder share
//!
//! Each call is reported as its own charge (`token_metadata`,
//! `top_holders_fetch`). If `getAsset` succeeds and the second call fails,
//! the error carries the `token_metadata` charge already spent.

use crate::pipeline::backoff::ExponentialBackoff;
use crate::pipeline::collaborators::{Enrichment, EnrichmentApi};
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::error::{EnrichError, EnrichErrorKind, PipelineError};
use crate::pipeline::ledger::{total_charged, CreditCharge, CreditOperation};
use crate::pipeline::types::MetricSnapshot;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

pub const CREDITS_PER_CALL: u64 = 1;

/// Ledger charges of a complete enrichment, one per RPC call
pub fn call_charges() -> Vec<CreditCharge> {
    vec![
        CreditCharge::new(CreditOperation::TokenMetadata, CREDITS_PER_CALL),
        CreditCharge::new(CreditOperation::TopHoldersFetch, CREDITS_PER_CALL),
    ]
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Asset {
    pub content: Option<AssetContent>,
    pub token_info: Option<TokenInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssetContent {
    pub metadata: Option<AssetMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssetMetadata {
    pub name: Option<String>,
    pub symbol: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenInfo {
    /// Raw supply (not decimal-adjusted)
    pub supply: Option<f64>,
    pub decimals: Option<u32>,
    pub price_info: Option<PriceInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PriceInfo {
    pub price_per_token: Option<f64>,
    pub total_price: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LargestAccounts {
    pub value: Vec<LargestAccount>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LargestAccount {
    pub address: String,
    #[serde(rename = "uiAmount")]
    pub ui_amount: Option<f64>,
}

impl TokenInfo {
    /// Decimal-adjusted supply
    pub fn ui_supply(&self) -> Option<f64> {
        let supply = self.supply?;
        let decimals = self.decimals.unwrap_or(0) as i32;
        Some(supply / 10_f64.powi(decimals))
    }
}

/// Name, symbol and market cap from a `getAsset` result
pub fn snapshot_from_asset(asset: &Asset) -> (MetricSnapshot, Option<String>, Option<String>) {
    let metadata = asset.content.as_ref().and_then(|c| c.metadata.as_ref());
    let token_info = asset.token_info.as_ref();

    let market_cap = token_info.and_then(|info| {
        let price = info.price_info.as_ref()?;
        price.total_price.or_else(|| {
            let per_token = price.price_per_token?;
            Some(per_token * info.ui_supply()?)
        })
    });

    (
        MetricSnapshot {
            market_cap_usd: market_cap,
            ..Default::default()
        },
        metadata.and_then(|m| m.name.clone()),
        metadata.and_then(|m| m.symbol.clone()),
    )
}

/// Largest holder's share of supply (0.0 - 1.0)
pub fn top_holder_share(accounts: &LargestAccounts, ui_supply: Option<f64>) -> Option<f64> {
    let supply = ui_supply.filter(|s| *s > 0.0)?;
    let largest = accounts.value.first()?.ui_amount?;
    Some((largest / supply).clamp(0.0, 1.0))
}

pub struct HeliusEnricher {
    client: reqwest::Client,
    rpc_url: String,
}

impl HeliusEnricher {
    pub fn new(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let api_key = config.require_helius_key()?;
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| PipelineError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            rpc_url: format!(
                "{}/?api-key={}",
                config.helius_rpc_url.trim_end_matches('/'),
                api_key
            ),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, EnrichError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": "tierflow",
            "method": method,
            "params": params,
        });
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(500), Duration::from_secs(4), 3);

        loop {
            let response = self
                .client
                .post(&self.rpc_url)
                .json(&body)
                .send()
                .await
                .map_err(|e| EnrichError::new(EnrichErrorKind::Network, format!("{}: {}", method, e)))?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                if backoff.sleep().await.is_err() {
                    return Err(EnrichError::new(
                        EnrichErrorKind::Api,
                        format!("{}: rate limited", method),
                    ));
                }
                continue;
            }
            if !status.is_success() {
                return Err(EnrichError::new(
                    EnrichErrorKind::Api,
                    format!("{}: HTTP {}", method, status),
                ));
            }

            let parsed: RpcResponse<T> = response
                .json()
                .await
                .map_err(|e| EnrichError::new(EnrichErrorKind::Api, format!("{}: {}", method, e)))?;

            if let Some(err) = parsed.error {
                return Err(EnrichError::new(
                    EnrichErrorKind::Api,
                    format!("{}: RPC error {}: {}", method, err.code, err.message),
                ));
            }

            return parsed.result.ok_or_else(|| {
                EnrichError::new(EnrichErrorKind::NotFound, format!("{}: empty result", method))
            });
        }
    }
}

#[async_trait]
impl EnrichmentApi for HeliusEnricher {
    fn estimated_cost(&self) -> u64 {
        total_charged(&call_charges())
    }

    async fn enrich(&self, address: &str) -> Result<Enrichment, EnrichError> {
        let asset: Asset = self.call("getAsset", json!({ "id": address })).await?;
        let (mut snapshot, token_name, token_symbol) = snapshot_from_asset(&asset);
        let ui_supply = asset.token_info.as_ref().and_then(TokenInfo::ui_supply);

        let accounts: LargestAccounts = self
            .call("getTokenLargestAccounts", json!([address]))
            .await
            .map_err(|e| e.with_charge(CreditOperation::TokenMetadata, CREDITS_PER_CALL))?;

        snapshot.top_holder_share = top_holder_share(&accounts, ui_supply);

        Ok(Enrichment {
            snapshot,
            token_name,
            token_symbol,
            charges: call_charges(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ASSET_JSON: &str = r#"{
        "interface": "FungibleToken",
        "id": "MintA",
        "content": {"metadata": {"name": "Alpha", "symbol": "ALP"}},
        "token_info": {
            "supply": 1000000000000000,
            "decimals": 6,
            "price_info": {"price_per_token": 0.00025, "total_price": 250000.0, "currency": "USDC"}
        }
    }"#;

    #[test]
    fn test_snapshot_from_asset() {
        let asset: Asset = serde_json::from_str(ASSET_JSON).unwrap();
        let (snapshot, name, symbol) = snapshot_from_asset(&asset);

        assert_eq!(snapshot.market_cap_usd, Some(250_000.0));
        assert_eq!(name.as_deref(), Some("Alpha"));
        assert_eq!(symbol.as_deref(), Some("ALP"));
        assert_eq!(
            asset.token_info.as_ref().and_then(TokenInfo::ui_supply),
            Some(1_000_000_000.0)
        );
    }

    #[test]
    fn test_market_cap_from_price_per_token() {
        let asset: Asset = serde_json::from_str(
            r#"{"token_info": {"supply": 2000000, "decimals": 3, "price_info": {"price_per_token": 0.5}}}"#,
        )
        .unwrap();
        let (snapshot, name, _) = snapshot_from_asset(&asset);

        assert_eq!(snapshot.market_cap_usd, Some(1_000.0));
        assert_eq!(name, None);
    }

    #[test]
    fn test_top_holder_share() {
        let accounts: LargestAccounts = serde_json::from_str(
            r#"{"context": {"slot": 1}, "value": [
                {"address": "A", "amount": "300", "decimals": 0, "uiAmount": 300.0},
                {"address": "B", "amount": "100", "decimals": 0, "uiAmount": 100.0}
            ]}"#,
        )
        .unwrap();

        assert_eq!(top_holder_share(&accounts, Some(1_000.0)), Some(0.3));
        assert_eq!(top_holder_share(&accounts, None), None);
        assert_eq!(top_holder_share(&accounts, Some(0.0)), None);
        assert_eq!(top_holder_share(&LargestAccounts::default(), Some(10.0)), None);
    }

    #[test]
    fn test_rpc_error_parse() {
        let parsed: RpcResponse<Asset> = serde_json::from_str(
            r#"{"jsonrpc": "2.0", "id": "x", "error": {"code": -32000, "message": "Asset Not Found"}}"#,
        )
        .unwrap();
        assert!(parsed.result.is_none());
        assert_eq!(parsed.error.unwrap().message, "Asset Not Found");
    }

    #[test]
    fn test_call_charges_match_estimate() {
        let charges = call_charges();
        assert_eq!(charges.len(), 2);
        assert_eq!(charges[0].operation, CreditOperation::TokenMetadata);
        assert_eq!(charges[1].operation, CreditOperation::TopHoldersFetch);
        assert_eq!(total_charged(&charges), 2 * CREDITS_PER_CALL);
    }
}
