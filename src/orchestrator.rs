use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    gateway::{GatewayError, WebhookGateway},
    jobs::{admissible_sources, Job, JobKind, JobPatch, JobStatus, JobStore},
    ledger::{CreditLedger, LedgerError},
    listings::ListingStore,
};

pub const SELECTED_IMAGE_COUNT: usize = 3;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("listing not found")]
    NotFound,
    #[error("insufficient credits: {available} available, {requested} requested")]
    InsufficientCredits { available: i64, requested: i64 },
    #[error("failed to create job record: {0}")]
    JobCreationFailed(String),
    #[error("generation service call failed: {source}")]
    Upstream {
        job_id: Uuid,
        #[source]
        source: GatewayError,
    },
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("{0} webhook is not configured")]
    NotConfigured(&'static str),
}

impl From<LedgerError> for OrchestratorError {
    fn from(error: LedgerError) -> Self {
        match error {
            LedgerError::Insufficient {
                available,
                requested,
            } => OrchestratorError::InsufficientCredits {
                available,
                requested,
            },
            other => OrchestratorError::Persistence(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoGenerationRequest {
    pub listing_id: String,
    #[serde(default)]
    pub selected_image_urls: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefillRequest {
    pub raw_text: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub default_currency: Option<String>,
    #[serde(default)]
    pub property_types: Vec<String>,
    #[serde(default)]
    pub currencies: Vec<String>,
    #[serde(default)]
    pub characteristic_definitions: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackRequest {
    pub job_id: Uuid,
    pub status: String,
    #[serde(default)]
    pub result_payload: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug)]
pub struct AcceptedJob {
    pub job_id: Uuid,
}

#[derive(Debug)]
pub struct PrefillOutcome {
    pub job_id: Uuid,
    pub result: Value,
}

#[derive(Debug)]
pub struct CallbackOutcome {
    pub job_id: Uuid,
    /// False when the job was already terminal and the callback was a replay.
    pub applied: bool,
}

#[derive(Clone)]
pub struct Costs {
    pub video_generation: i64,
    pub prefill: i64,
}

/// Composes ledger, job store and gateway per request. The one invariant
/// everything below serves: once a charge commits, the request either ends
/// with a live job row or the charge is refunded.
#[derive(Clone)]
pub struct JobOrchestrator {
    ledger: CreditLedger,
    jobs: Arc<dyn JobStore>,
    listings: Arc<dyn ListingStore>,
    gateway: WebhookGateway,
    video_webhook_url: Option<String>,
    prefill_webhook_url: Option<String>,
    costs: Costs,
}

impl JobOrchestrator {
    pub fn new(
        ledger: CreditLedger,
        jobs: Arc<dyn JobStore>,
        listings: Arc<dyn ListingStore>,
        gateway: WebhookGateway,
        video_webhook_url: Option<String>,
        prefill_webhook_url: Option<String>,
        costs: Costs,
    ) -> Self {
        Self {
            ledger,
            jobs,
            listings,
            gateway,
            video_webhook_url,
            prefill_webhook_url,
            costs,
        }
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    /// Video generation: the gateway call only kicks the external pipeline
    /// off, so success leaves the job in `processing` until the signed
    /// completion callback arrives.
    pub async fn run_video_generation(
        &self,
        user_id: &str,
        request: VideoGenerationRequest,
    ) -> Result<AcceptedJob, OrchestratorError> {
        if request.listing_id.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "listingId is required".to_string(),
            ));
        }
        if request.selected_image_urls.len() != SELECTED_IMAGE_COUNT
            || request
                .selected_image_urls
                .iter()
                .any(|url| url.trim().is_empty())
        {
            return Err(OrchestratorError::InvalidRequest(format!(
                "selectedImageUrls must contain exactly {SELECTED_IMAGE_COUNT} image URLs"
            )));
        }

        let webhook_url = self
            .video_webhook_url
            .clone()
            .ok_or(OrchestratorError::NotConfigured("video generation"))?;

        let listing = self
            .listings
            .fetch_owned(user_id, request.listing_id.trim())
            .await
            .map_err(|error| OrchestratorError::Persistence(error.to_string()))?
            .ok_or(OrchestratorError::NotFound)?;

        let cost = self.costs.video_generation;
        self.ledger
            .charge(
                user_id,
                cost,
                &format!("video generation for listing {}", listing.id),
            )
            .await?;

        let job = self.create_job_or_refund(user_id, JobKind::VideoGeneration, cost).await?;

        let mut payload = listing.webhook_fields();
        if let Some(fields) = payload.as_object_mut() {
            fields.insert("jobId".to_string(), json!(job.id));
            fields.insert("userId".to_string(), json!(user_id));
            fields.insert(
                "selectedImageUrls".to_string(),
                json!(request.selected_image_urls),
            );
            if let Some(notes) = &request.notes {
                fields.insert("notes".to_string(), json!(notes));
            }
        }

        match self.gateway.invoke(&webhook_url, &payload).await {
            Ok(_) => {
                self.advance(job.id, JobStatus::Processing, JobPatch::status(JobStatus::Processing))
                    .await;
                Ok(AcceptedJob { job_id: job.id })
            }
            Err(error) => {
                self.fail_and_refund(&job, error.to_string()).await;
                Err(OrchestratorError::Upstream {
                    job_id: job.id,
                    source: error,
                })
            }
        }
    }

    /// AI prefill is synchronous: the gateway response carries the final
    /// artifact and the job completes within the request.
    pub async fn run_prefill(
        &self,
        user_id: &str,
        request: PrefillRequest,
    ) -> Result<PrefillOutcome, OrchestratorError> {
        if request.raw_text.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "rawText is required".to_string(),
            ));
        }
        if request.property_types.is_empty() || request.currencies.is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "propertyTypes and currencies are required".to_string(),
            ));
        }

        let webhook_url = self
            .prefill_webhook_url
            .clone()
            .ok_or(OrchestratorError::NotConfigured("AI prefill"))?;

        let cost = self.costs.prefill;
        self.ledger
            .charge(user_id, cost, "AI listing prefill")
            .await?;

        let job = self.create_job_or_refund(user_id, JobKind::AiPrefill, cost).await?;

        let payload = json!({
            "jobId": job.id,
            "userId": user_id,
            "rawText": request.raw_text,
            "language": request.language,
            "defaultCurrency": request.default_currency,
            "propertyTypes": request.property_types,
            "currencies": request.currencies,
            "characteristicDefinitions": request.characteristic_definitions,
        });

        match self.gateway.invoke(&webhook_url, &payload).await {
            Ok(result) => {
                let patch = JobPatch {
                    status: Some(JobStatus::Completed),
                    result_payload: Some(result.clone()),
                    ..JobPatch::default()
                };
                self.advance(job.id, JobStatus::Completed, patch).await;
                Ok(PrefillOutcome {
                    job_id: job.id,
                    result,
                })
            }
            Err(error) => {
                self.fail_and_refund(&job, error.to_string()).await;
                Err(OrchestratorError::Upstream {
                    job_id: job.id,
                    source: error,
                })
            }
        }
    }

    /// The caller may only see their own jobs; someone else's id reads as
    /// absent.
    pub async fn get_job(&self, user_id: &str, id: Uuid) -> Result<Option<Job>, OrchestratorError> {
        let job = self
            .jobs
            .fetch(id)
            .await
            .map_err(|error| OrchestratorError::Persistence(error.to_string()))?;
        Ok(job.filter(|job| job.user_id == user_id))
    }

    /// Applies a completion callback from the generation service. Replays of
    /// already-terminal jobs acknowledge without acting, which is what keeps
    /// the refund at-most-once.
    pub async fn apply_callback(
        &self,
        request: CallbackRequest,
    ) -> Result<CallbackOutcome, OrchestratorError> {
        let job = self
            .jobs
            .fetch(request.job_id)
            .await
            .map_err(|error| OrchestratorError::Persistence(error.to_string()))?
            .ok_or(OrchestratorError::NotFound)?;

        match request.status.as_str() {
            "completed" => {
                let patch = JobPatch {
                    status: Some(JobStatus::Completed),
                    result_payload: request.result_payload,
                    ..JobPatch::default()
                };
                let applied = self
                    .jobs
                    .transition(job.id, admissible_sources(JobStatus::Completed), patch)
                    .await
                    .map_err(|error| OrchestratorError::Persistence(error.to_string()))?;
                Ok(CallbackOutcome {
                    job_id: job.id,
                    applied,
                })
            }
            "failed" => {
                let message = request
                    .error_message
                    .unwrap_or_else(|| "generation service reported failure".to_string());
                let applied = self.fail_and_refund(&job, message).await;
                Ok(CallbackOutcome {
                    job_id: job.id,
                    applied,
                })
            }
            other => Err(OrchestratorError::InvalidRequest(format!(
                "unknown callback status {other:?}"
            ))),
        }
    }

    async fn create_job_or_refund(
        &self,
        user_id: &str,
        kind: JobKind,
        cost: i64,
    ) -> Result<Job, OrchestratorError> {
        let job = Job::new(user_id, kind, cost);
        if let Err(error) = self.jobs.insert(&job).await {
            tracing::error!(user_id, error = %error, "job row creation failed after charge; refunding");
            if let Err(refund_error) = self
                .ledger
                .refund(user_id, cost, &format!("refund: {} job not created", kind.as_str()))
                .await
            {
                tracing::error!(
                    user_id,
                    error = %refund_error,
                    "refund after failed job creation also failed; charge is stranded"
                );
            }
            return Err(OrchestratorError::JobCreationFailed(error.to_string()));
        }
        Ok(job)
    }

    /// Single post-charge failure funnel: claim the job as `failed`, refund,
    /// then flag the refund on the row. Returns whether this call performed
    /// the transition (false means another path already settled the job).
    async fn fail_and_refund(&self, job: &Job, error_message: String) -> bool {
        let patch = JobPatch {
            status: Some(JobStatus::Failed),
            error_message: Some(error_message),
            ..JobPatch::default()
        };
        let claimed = match self
            .jobs
            .transition(job.id, admissible_sources(JobStatus::Failed), patch)
            .await
        {
            Ok(claimed) => claimed,
            Err(error) => {
                tracing::error!(job_id = %job.id, error = %error, "failed to mark job failed");
                false
            }
        };
        if !claimed {
            return false;
        }

        match self
            .ledger
            .refund(
                &job.user_id,
                job.credits_charged,
                &format!("refund: {} job {} failed", job.kind.as_str(), job.id),
            )
            .await
        {
            Ok(_) => {
                let flag = JobPatch {
                    credits_refunded: Some(true),
                    ..JobPatch::default()
                };
                if let Err(error) = self.jobs.transition(job.id, &[JobStatus::Failed], flag).await {
                    tracing::warn!(job_id = %job.id, error = %error, "refund succeeded but flag update failed");
                }
            }
            Err(error) => {
                // The user still sees the failure; the unrefunded charge
                // becomes a support case, visible as failed + unrefunded.
                tracing::error!(
                    job_id = %job.id,
                    user_id = %job.user_id,
                    credits = job.credits_charged,
                    error = %error,
                    "refund after job failure did not complete"
                );
            }
        }
        true
    }

    /// Post-success status advance. The charge is already settled and the
    /// external work is underway or done, so a persistence hiccup here is
    /// logged rather than turned into a user-facing failure.
    async fn advance(&self, job_id: Uuid, to: JobStatus, patch: JobPatch) {
        match self.jobs.transition(job_id, admissible_sources(to), patch).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(job_id = %job_id, to = to.as_str(), "job was not in an admissible state");
            }
            Err(error) => {
                tracing::error!(job_id = %job_id, to = to.as_str(), error = %error, "job status update failed");
            }
        }
    }
}
