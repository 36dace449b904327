//! Fraud-check collaborator client.
//!
//! The oracle scores a request's likely-human-ness from a client-supplied
//! token. It is consulted at registration (where identities are minted) and
//! at placement. The call is bounded by a timeout; an unreachable oracle
//! degrades to an *ambiguous* verdict rather than hanging or hard-failing
//! the write path.
//!
//! Policy, decided once rather than mixed: an explicit verification failure
//! rejects the request; a low or ambiguous score lets the write through and
//! lengthens the identity's next cooldown instead.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use mosaic_core::config::CaptchaConfig;

/// Outcome of consulting the oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FraudVerdict {
    /// Verified, score at or above the threshold.
    Passed,
    /// Verified, but the score is below the threshold. Callers stretch the
    /// next cooldown; they do not reject.
    LowScore,
    /// The oracle explicitly rejected the token (or none was supplied).
    Failed,
    /// The oracle could not be reached in time; treated as ambiguous.
    Unavailable,
}

impl FraudVerdict {
    /// True for verdicts that lengthen the next cooldown.
    #[must_use]
    pub const fn is_ambiguous(self) -> bool {
        matches!(self, Self::LowScore | Self::Unavailable)
    }
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    success: bool,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default, rename = "error-codes")]
    error_codes: Option<Vec<String>>,
}

/// HTTP client for the verification API.
pub struct CaptchaClient {
    config: CaptchaConfig,
    http: reqwest::Client,
}

impl CaptchaClient {
    /// Builds the client with the configured request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be constructed.
    pub fn new(config: CaptchaConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self { config, http })
    }

    /// Scores one request.
    ///
    /// With the oracle disabled (development), everything passes. A missing
    /// token always fails: the client was supposed to attach one.
    pub async fn verify(&self, token: Option<&str>, client_ip: &str) -> FraudVerdict {
        if !self.config.enabled {
            return FraudVerdict::Passed;
        }
        let Some(token) = token else {
            return FraudVerdict::Failed;
        };

        let params = [
            ("secret", self.config.secret.as_str()),
            ("response", token),
            ("remoteip", client_ip),
        ];
        let response = match self.http.post(&self.config.verify_url).form(&params).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "fraud check unreachable");
                return FraudVerdict::Unavailable;
            },
        };
        let body: VerifyResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "fraud check returned malformed body");
                return FraudVerdict::Unavailable;
            },
        };

        if !self.config.hostname.is_empty()
            && body.hostname.as_deref() != Some(self.config.hostname.as_str())
        {
            warn!(hostname = ?body.hostname, "fraud check hostname mismatch");
            return FraudVerdict::Failed;
        }
        if !body.success {
            debug!(errors = ?body.error_codes, ip = client_ip, "fraud check failed");
            return FraudVerdict::Failed;
        }
        match body.score {
            Some(score) if score < self.config.score_threshold => {
                warn!(score, ip = client_ip, "low fraud-check score");
                FraudVerdict::LowScore
            },
            _ => FraudVerdict::Passed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disabled() -> CaptchaClient {
        CaptchaClient::new(CaptchaConfig::default()).unwrap()
    }

    fn enabled() -> CaptchaClient {
        CaptchaClient::new(CaptchaConfig {
            enabled: true,
            secret: "s".into(),
            ..CaptchaConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn disabled_oracle_passes_everything() {
        assert_eq!(disabled().verify(None, "192.0.2.1").await, FraudVerdict::Passed);
        assert_eq!(
            disabled().verify(Some("t"), "192.0.2.1").await,
            FraudVerdict::Passed
        );
    }

    #[tokio::test]
    async fn missing_token_fails() {
        assert_eq!(enabled().verify(None, "192.0.2.1").await, FraudVerdict::Failed);
    }

    #[test]
    fn ambiguity_classification() {
        assert!(FraudVerdict::LowScore.is_ambiguous());
        assert!(FraudVerdict::Unavailable.is_ambiguous());
        assert!(!FraudVerdict::Passed.is_ambiguous());
        assert!(!FraudVerdict::Failed.is_ambiguous());
    }
}
