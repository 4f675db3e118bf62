use std::{sync::Arc, time::Duration};

use crate::{
    auth::AuthService, config::Config, orchestrator::JobOrchestrator,
    rate_limit::InMemoryRateLimiter, reconcile::StorageReconciler, store::RestStore,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: RestStore,
    pub auth: AuthService,
    pub orchestrator: JobOrchestrator,
    pub reconciler: Option<StorageReconciler>,
    pub job_limiter: Arc<InMemoryRateLimiter>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: RestStore,
        auth: AuthService,
        orchestrator: JobOrchestrator,
        reconciler: Option<StorageReconciler>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            auth,
            orchestrator,
            reconciler,
            job_limiter: Arc::new(InMemoryRateLimiter::new(
                Duration::from_secs(15 * 60),
                100,
            )),
        }
    }
}
