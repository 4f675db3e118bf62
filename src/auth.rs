use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::RwLock;

const JWKS_TTL: Duration = Duration::from_secs(10 * 60);

/// Verifies RS256 bearer tokens against the identity provider's published
/// JWKS. Key sets are cached per issuer with a TTL so the hot path stays off
/// the network.
#[derive(Clone)]
pub struct AuthService {
    http: reqwest::Client,
    jwks_cache: Arc<RwLock<HashMap<String, CachedKeys>>>,
    expected_issuer: Option<String>,
}

#[derive(Clone)]
struct CachedKeys {
    keys: Vec<Jwk>,
    fetched_at: Instant,
}

#[derive(Debug, Deserialize, Clone)]
struct JwkSet {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize, Clone)]
struct Jwk {
    kid: Option<String>,
    kty: String,
    n: Option<String>,
    e: Option<String>,
    alg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UnverifiedClaims {
    iss: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IdentityClaims {
    /// The platform user id.
    pub sub: String,
    pub iss: String,
    pub exp: usize,
}

impl AuthService {
    pub fn new(expected_issuer: Option<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to build auth HTTP client")?;

        Ok(Self {
            http,
            jwks_cache: Arc::new(RwLock::new(HashMap::new())),
            expected_issuer: expected_issuer
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty()),
        })
    }

    pub async fn verify_bearer_token(
        &self,
        authorization_header: &str,
    ) -> anyhow::Result<IdentityClaims> {
        let token = extract_bearer_token(authorization_header)?;
        self.verify_token(token).await
    }

    pub async fn verify_token(&self, token: &str) -> anyhow::Result<IdentityClaims> {
        let header = decode_header(token).context("invalid JWT header")?;
        let kid = header.kid.ok_or_else(|| anyhow!("JWT header missing kid"))?;

        let issuer = unverified_issuer(token)?;
        if let Some(expected) = &self.expected_issuer {
            if issuer != *expected {
                return Err(anyhow!(
                    "JWT issuer mismatch: expected {expected}, got {issuer}"
                ));
            }
        }

        let keys = self.keys_for_issuer(&issuer).await?;
        let jwk = keys
            .iter()
            .find(|candidate| candidate.kid.as_deref() == Some(kid.as_str()))
            .ok_or_else(|| anyhow!("no JWK matches kid {kid}"))?;

        if jwk.kty != "RSA" {
            return Err(anyhow!("unsupported JWK key type {}", jwk.kty));
        }
        if let Some(alg) = &jwk.alg {
            if alg != "RS256" {
                return Err(anyhow!("unsupported JWK algorithm {alg}"));
            }
        }

        let n = jwk.n.as_ref().ok_or_else(|| anyhow!("JWK missing modulus"))?;
        let e = jwk.e.as_ref().ok_or_else(|| anyhow!("JWK missing exponent"))?;
        let decoding_key =
            DecodingKey::from_rsa_components(n, e).context("failed to build RSA decoding key")?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[issuer.as_str()]);

        let data = decode::<IdentityClaims>(token, &decoding_key, &validation)
            .context("JWT signature validation failed")?;

        tracing::debug!(iss = %data.claims.iss, "verified bearer token");
        Ok(data.claims)
    }

    async fn keys_for_issuer(&self, issuer: &str) -> anyhow::Result<Vec<Jwk>> {
        {
            let cache = self.jwks_cache.read().await;
            if let Some(cached) = cache.get(issuer) {
                if cached.fetched_at.elapsed() < JWKS_TTL {
                    return Ok(cached.keys.clone());
                }
            }
        }

        let url = format!("{}/.well-known/jwks.json", issuer.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to fetch JWKS from {url}"))?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "JWKS fetch from {url} failed with HTTP {}",
                response.status()
            ));
        }

        let set: JwkSet = response
            .json()
            .await
            .with_context(|| format!("invalid JWKS document from {url}"))?;

        let mut cache = self.jwks_cache.write().await;
        cache.insert(
            issuer.to_string(),
            CachedKeys {
                keys: set.keys.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(set.keys)
    }
}

pub fn extract_bearer_token(value: &str) -> anyhow::Result<&str> {
    let mut parts = value.splitn(2, ' ');
    let scheme = parts.next().unwrap_or_default();
    let token = parts.next().unwrap_or_default().trim();

    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(anyhow!("invalid Authorization header format"));
    }
    Ok(token)
}

fn unverified_issuer(token: &str) -> anyhow::Result<String> {
    let mut parts = token.split('.');
    let _header = parts.next();
    let payload = parts
        .next()
        .ok_or_else(|| anyhow!("JWT payload segment missing"))?;

    let decoded = URL_SAFE_NO_PAD
        .decode(payload.as_bytes())
        .context("failed to decode JWT payload")?;
    let claims: UnverifiedClaims =
        serde_json::from_slice(&decoded).context("failed to parse JWT claims")?;

    let issuer = claims.iss.ok_or_else(|| anyhow!("JWT missing iss claim"))?;
    Ok(issuer.trim().trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_scheme_is_case_insensitive_and_required() {
        assert_eq!(extract_bearer_token("Bearer abc").unwrap(), "abc");
        assert_eq!(extract_bearer_token("bearer abc ").unwrap(), "abc");
        assert!(extract_bearer_token("Basic abc").is_err());
        assert!(extract_bearer_token("Bearer ").is_err());
        assert!(extract_bearer_token("token").is_err());
    }
}
