use std::{collections::HashSet, env, net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;

use listing_jobs_server::{
    auth, build_router, config::Config, gateway, ledger, orchestrator, reconcile, state::AppState,
    storage, store,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let loaded_env_files = load_env_files()?;
    init_tracing();
    if loaded_env_files.is_empty() {
        tracing::warn!("No .env or .env.local file found. Using process environment only.");
    } else {
        let files = loaded_env_files
            .iter()
            .map(|path| path.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        tracing::info!(files = %files, "Loaded environment files");
    }

    let config = Config::from_env()?;

    if config.video_webhook_url.is_none() {
        tracing::warn!(
            "VIDEO_WEBHOOK_URL is not set. Video generation requests will be rejected until it is provided."
        );
    }
    if config.prefill_webhook_url.is_none() {
        tracing::warn!(
            "PREFILL_WEBHOOK_URL is not set. Listing prefill requests will be rejected until it is provided."
        );
    }
    if config.webhook_callback_secret.is_none() {
        tracing::warn!(
            "WEBHOOK_CALLBACK_SECRET is not set. Completion callbacks will be rejected until it is provided."
        );
    }
    if config.auth_issuer.is_none() {
        tracing::warn!("AUTH_ISSUER is not set. JWT verification will accept any valid issuer.");
    }

    let store = store::RestStore::new(config.database_rest_url.clone(), &config.service_role_key)?;
    let auth = auth::AuthService::new(config.auth_issuer.clone())?;
    let gateway =
        gateway::WebhookGateway::new(config.webhook_auth_token.clone(), config.webhook_timeout)?;

    let ledger = ledger::CreditLedger::new(Arc::new(store.clone()));
    let orchestrator = orchestrator::JobOrchestrator::new(
        ledger,
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        gateway,
        config.video_webhook_url.clone(),
        config.prefill_webhook_url.clone(),
        orchestrator::Costs {
            video_generation: config.video_generation_cost,
            prefill: config.prefill_cost,
        },
    );

    let reconciler = build_reconciler(&config, store.clone())?;
    if reconciler.is_none() {
        tracing::warn!(
            "Object storage credentials are not fully set. Storage maintenance routes are disabled."
        );
    }

    let state = AppState::new(config.clone(), store, auth, orchestrator, reconciler);

    match state.store.ping().await {
        Ok(()) => {
            tracing::info!("Database connectivity check passed");
        }
        Err(error) => {
            tracing::error!(
                error = ?error,
                rest_url = %config.database_rest_url,
                "Database connectivity check failed. Verify DATABASE_API_URL and SERVICE_ROLE_KEY."
            );
        }
    }

    let app = build_router(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    if let Some((cert_path, key_path)) = valid_tls_paths(&config) {
        let tls_config = RustlsConfig::from_pem_file(cert_path, key_path)
            .await
            .context("failed to load TLS certificate/key")?;

        tracing::info!(
            port = config.port,
            "TLS configuration loaded. Running in HTTPS mode."
        );

        axum_server::bind_rustls(addr, tls_config)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .context("HTTPS server failed")?;
    } else {
        tracing::info!(port = config.port, "Running in HTTP mode.");
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .context("failed to bind TCP listener")?;

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .context("HTTP server failed")?;
    }

    Ok(())
}

fn build_reconciler(
    config: &Config,
    store: store::RestStore,
) -> anyhow::Result<Option<reconcile::StorageReconciler>> {
    let (endpoint, access_key, secret_key) = match (
        config.storage_endpoint.as_deref(),
        config.storage_access_key.as_deref(),
        config.storage_secret_key.as_deref(),
    ) {
        (Some(endpoint), Some(access_key), Some(secret_key)) => (endpoint, access_key, secret_key),
        _ => return Ok(None),
    };

    let storage = storage::ObjectStorageClient::new(
        endpoint,
        &config.storage_bucket,
        &config.storage_region,
        access_key,
        secret_key,
    )?;

    Ok(Some(reconcile::StorageReconciler::new(
        store,
        storage,
        config.reconcile_delete_concurrency,
    )))
}

fn valid_tls_paths(config: &Config) -> Option<(String, String)> {
    let cert_path = config
        .tls_cert_path
        .as_ref()
        .map(|path| path.to_string_lossy().to_string());
    let key_path = config
        .tls_key_path
        .as_ref()
        .map(|path| path.to_string_lossy().to_string());

    match (cert_path, key_path) {
        (Some(cert_path), Some(key_path)) => {
            let cert_exists = std::path::Path::new(&cert_path).exists();
            let key_exists = std::path::Path::new(&key_path).exists();

            if cert_exists && key_exists {
                Some((cert_path, key_path))
            } else {
                if !key_exists {
                    tracing::error!(path = %key_path, "TLS key file not found");
                }
                if !cert_exists {
                    tracing::error!(path = %cert_path, "TLS certificate file not found");
                }
                tracing::error!("Proceeding without TLS.");
                None
            }
        }
        (Some(cert_path), None) => {
            tracing::error!(path = %cert_path, "TLS certificate file provided but TLS key path missing");
            tracing::error!("Proceeding without TLS.");
            None
        }
        (None, Some(key_path)) => {
            tracing::error!(path = %key_path, "TLS key file provided but TLS certificate path missing");
            tracing::error!("Proceeding without TLS.");
            None
        }
        (None, None) => None,
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn load_env_files() -> anyhow::Result<Vec<PathBuf>> {
    let mut roots = Vec::new();
    if let Ok(cwd) = env::current_dir() {
        roots.push(cwd);
    }
    if let Ok(executable_path) = env::current_exe() {
        if let Some(executable_dir) = executable_path.parent() {
            roots.push(executable_dir.to_path_buf());
        }
    }
    roots.push(PathBuf::from(env!("CARGO_MANIFEST_DIR")));

    let mut seen_roots = HashSet::new();
    let mut loaded = Vec::new();

    for root in roots {
        let key = root.to_string_lossy().to_string();
        if !seen_roots.insert(key) {
            continue;
        }

        for filename in [".env", ".env.local"] {
            let path = root.join(filename);
            if path.is_file() {
                dotenvy::from_path(&path)
                    .with_context(|| format!("failed to load {}", path.display()))?;
                loaded.push(path);
            }
        }
    }

    if loaded.is_empty() {
        if let Ok(path) = dotenvy::dotenv() {
            loaded.push(path);
        }
    }

    Ok(loaded)
}
