//! HTTP client for the full token-analysis workflow
//!
//! `POST {ANALYSIS_URL}` with `{"token_address": ...}`. A 2xx response whose
//! `status` is `"analyzed"` is a successful promotion.

use crate::pipeline::collaborators::{AnalysisWorkflow, Analyzed};
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::error::{AnalysisError, PipelineError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
struct AnalysisRequest<'a> {
    token_address: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisResponse {
    pub status: String,
    #[serde(default)]
    pub credits_used: u64,
    pub analysis_id: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl AnalysisResponse {
    pub fn into_result(self) -> Result<Analyzed, AnalysisError> {
        if self.status != "analyzed" {
            return Err(AnalysisError(
                self.error
                    .unwrap_or_else(|| format!("workflow returned status {}", self.status)),
            ));
        }

        Ok(Analyzed {
            credits_used: self.credits_used,
            reference: self.analysis_id.map(|id| match id {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            }),
        })
    }
}

pub struct HttpAnalysisWorkflow {
    client: reqwest::Client,
    url: String,
}

impl HttpAnalysisWorkflow {
    pub fn new(config: &PipelineConfig) -> Result<Self, PipelineError> {
        // Full analysis is slow; allow well beyond the per-call HTTP timeout
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout() * 40)
            .build()
            .map_err(|e| PipelineError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: config.analysis_url.clone(),
        })
    }
}

#[async_trait]
impl AnalysisWorkflow for HttpAnalysisWorkflow {
    async fn promote(&self, address: &str) -> Result<Analyzed, AnalysisError> {
        let response = self
            .client
            .post(&self.url)
            .json(&AnalysisRequest {
                token_address: address,
            })
            .send()
            .await
            .map_err(|e| AnalysisError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnalysisError(format!("HTTP {}: {}", status, body.trim())));
        }

        let parsed: AnalysisResponse = response
            .json()
            .await
            .map_err(|e| AnalysisError(format!("invalid response: {}", e)))?;

        parsed.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analyzed_response() {
        let parsed: AnalysisResponse =
            serde_json::from_str(r#"{"status": "analyzed", "credits_used": 42, "analysis_id": 17}"#)
                .unwrap();
        let analyzed = parsed.into_result().unwrap();

        assert_eq!(analyzed.credits_used, 42);
        assert_eq!(analyzed.reference.as_deref(), Some("17"));
    }

    #[test]
    fn test_failed_response() {
        let parsed: AnalysisResponse =
            serde_json::from_str(r#"{"status": "failed", "error": "no early bidders"}"#).unwrap();
        let err = parsed.into_result().unwrap_err();
        assert_eq!(err.0, "no early bidders");

        let parsed: AnalysisResponse = serde_json::from_str(r#"{"status": "queued"}"#).unwrap();
        assert!(parsed.into_result().unwrap_err().0.contains("queued"));
    }
}
