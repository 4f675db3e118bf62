use std::time::Duration;

use anyhow::{anyhow, Context};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

const CALLBACK_SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Uniform failure taxonomy for an external webhook call. The orchestrator
/// treats every variant identically for refund purposes: once the call did
/// not return 2xx within the deadline, the charge is compensated.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("webhook call timed out after {0:?}")]
    Timeout(Duration),
    #[error("webhook returned HTTP {status}: {detail}")]
    Http { status: u16, detail: String },
    #[error("webhook call failed: {0}")]
    Network(String),
}

/// Bounded-timeout HTTP wrapper around the external generation services.
/// Does not retry; retry policy, if any, belongs to the caller.
#[derive(Clone)]
pub struct WebhookGateway {
    http: reqwest::Client,
    auth_token: Option<String>,
    timeout: Duration,
}

impl WebhookGateway {
    pub fn new(auth_token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to build webhook HTTP client")?;

        Ok(Self {
            http,
            auth_token: auth_token.filter(|value| !value.trim().is_empty()),
            timeout,
        })
    }

    /// POSTs `payload` and returns the decoded JSON body on 2xx. The timeout
    /// covers connect, send and body read; when it fires the in-flight
    /// request is dropped and the external side effect's completion is
    /// unknown to us.
    pub async fn invoke(&self, url: &str, payload: &Value) -> Result<Value, GatewayError> {
        let mut request = self.http.post(url).json(payload);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let outcome = tokio::time::timeout(self.timeout, async {
            let response = request
                .send()
                .await
                .map_err(|error| GatewayError::Network(error.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let detail = response.text().await.unwrap_or_default();
                return Err(GatewayError::Http {
                    status: status.as_u16(),
                    detail: truncate(&detail, 512),
                });
            }

            response
                .json::<Value>()
                .await
                .map_err(|error| GatewayError::Network(format!("invalid JSON body: {error}")))
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(self.timeout)),
        }
    }
}

/// Verifies the signature the generation service attaches to completion
/// callbacks: `t=<unix seconds>,v1=<hex hmac-sha256 of "{t}.{body}">`. The
/// timestamp guards against replay; the comparison is constant-time.
pub fn verify_callback_signature(
    secret: &str,
    signature_header: &str,
    payload: &[u8],
) -> anyhow::Result<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in signature_header.split(',') {
        let mut pieces = part.trim().splitn(2, '=');
        let key = pieces.next().unwrap_or_default();
        let value = pieces.next().unwrap_or_default();
        match key {
            "t" => timestamp = value.parse::<i64>().ok(),
            "v1" => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| anyhow!("missing timestamp in callback signature"))?;
    if signatures.is_empty() {
        return Err(anyhow!("missing v1 callback signature"));
    }

    let now = Utc::now().timestamp();
    if (now - timestamp).abs() > CALLBACK_SIGNATURE_TOLERANCE_SECS {
        return Err(anyhow!("callback signature timestamp outside tolerance"));
    }

    let body = std::str::from_utf8(payload).context("callback payload is not valid UTF-8")?;
    let signed_payload = format!("{timestamp}.{body}");

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .context("invalid callback signing secret")?;
    mac.update(signed_payload.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());

    let matched = signatures
        .into_iter()
        .any(|candidate| expected.as_bytes().ct_eq(candidate.as_bytes()).into());
    if !matched {
        return Err(anyhow!("callback signature mismatch"));
    }

    Ok(())
}

fn truncate(value: &str, max: usize) -> String {
    if value.len() <= max {
        return value.to_string();
    }
    let mut cut = max;
    while !value.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &value[..cut])
}
