use std::{env, path::PathBuf, time::Duration};

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub trust_proxy: bool,
    pub tls_key_path: Option<PathBuf>,
    pub tls_cert_path: Option<PathBuf>,
    pub database_rest_url: String,
    pub service_role_key: String,
    pub auth_issuer: Option<String>,
    pub video_webhook_url: Option<String>,
    pub prefill_webhook_url: Option<String>,
    pub webhook_auth_token: Option<String>,
    pub webhook_callback_secret: Option<String>,
    pub webhook_timeout: Duration,
    pub video_generation_cost: i64,
    pub prefill_cost: i64,
    pub storage_endpoint: Option<String>,
    pub storage_bucket: String,
    pub storage_region: String,
    pub storage_access_key: Option<String>,
    pub storage_secret_key: Option<String>,
    pub maintenance_token: Option<String>,
    pub reconcile_delete_concurrency: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let port = parse_u16(env::var("PORT").ok(), 8090);

        let trust_proxy = match env::var("TRUST_PROXY") {
            Ok(value) => {
                let normalized = value.trim().to_lowercase();
                !matches!(normalized.as_str(), "false" | "0" | "off" | "no")
            }
            Err(_) => true,
        };

        let database_url = env::var("DATABASE_API_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_API_URL environment variable is not set"))?;
        let database_rest_url = normalize_rest_url(&database_url);

        let service_role_key = env::var("SERVICE_ROLE_KEY")
            .map_err(|_| anyhow::anyhow!("SERVICE_ROLE_KEY environment variable is not set"))?;

        let webhook_timeout_ms = parse_u64(env::var("WEBHOOK_TIMEOUT_MS").ok(), 25_000);

        Ok(Self {
            port,
            trust_proxy,
            tls_key_path: env::var("TLS_KEY_PATH").ok().map(PathBuf::from),
            tls_cert_path: env::var("TLS_CERT_PATH").ok().map(PathBuf::from),
            database_rest_url,
            service_role_key,
            auth_issuer: env::var("AUTH_ISSUER").ok(),
            video_webhook_url: env::var("VIDEO_WEBHOOK_URL").ok(),
            prefill_webhook_url: env::var("PREFILL_WEBHOOK_URL").ok(),
            webhook_auth_token: env::var("WEBHOOK_AUTH_TOKEN").ok(),
            webhook_callback_secret: env::var("WEBHOOK_CALLBACK_SECRET").ok(),
            webhook_timeout: Duration::from_millis(webhook_timeout_ms),
            video_generation_cost: parse_i64(env::var("VIDEO_GENERATION_COST").ok(), 10),
            prefill_cost: parse_i64(env::var("PREFILL_COST").ok(), 1),
            storage_endpoint: env::var("STORAGE_ENDPOINT").ok(),
            storage_bucket: env::var("STORAGE_BUCKET")
                .unwrap_or_else(|_| "listing-uploads".to_string()),
            storage_region: env::var("STORAGE_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            storage_access_key: env::var("STORAGE_ACCESS_KEY").ok(),
            storage_secret_key: env::var("STORAGE_SECRET_KEY").ok(),
            maintenance_token: env::var("MAINTENANCE_TOKEN").ok(),
            reconcile_delete_concurrency: parse_usize(
                env::var("RECONCILE_DELETE_CONCURRENCY").ok(),
                10,
            ),
        })
    }
}

fn parse_u16(value: Option<String>, fallback: u16) -> u16 {
    value
        .and_then(|v| v.parse::<u16>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}

fn parse_u64(value: Option<String>, fallback: u64) -> u64 {
    value
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}

fn parse_i64(value: Option<String>, fallback: i64) -> i64 {
    value
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}

/// The REST facade lives under `/rest/v1` on the platform base URL. Accept
/// either form so deployments can paste the project URL directly.
fn normalize_rest_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.ends_with("/rest/v1") {
        trimmed.to_string()
    } else {
        format!("{}/rest/v1", trimmed)
    }
}
