use std::collections::HashSet;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    jobs::{Job, JobKind, JobPatch, JobStatus, JobStore},
    ledger::{Balance, BalanceStore, CreditTransaction},
    listings::{Listing, ListingStore},
};

const BALANCES_TABLE: &str = "credit_balances";
const TRANSACTIONS_TABLE: &str = "credit_transactions";
const JOBS_TABLE: &str = "generation_jobs";
const LISTINGS_TABLE: &str = "listings";
const PROFILES_TABLE: &str = "profiles";

/// Client for the managed database's REST facade. Row filters travel as
/// query parameters (`user_id=eq.X`); updates with `Prefer:
/// return=representation` report the matched rows, which is how conditional
/// writes observe "zero rows affected".
#[derive(Clone)]
pub struct RestStore {
    base_url: String,
    http: reqwest::Client,
}

impl RestStore {
    pub fn new(base_url: String, service_role_key: &str) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "apikey",
            HeaderValue::from_str(service_role_key).context("invalid SERVICE_ROLE_KEY")?,
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {service_role_key}"))
                .context("invalid SERVICE_ROLE_KEY for header")?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("failed to build database HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub async fn ping(&self) -> anyhow::Result<()> {
        let _rows: Vec<IdRow> = self
            .select(PROFILES_TABLE, &[("select", "id"), ("limit", "1")])
            .await?;
        Ok(())
    }

    /// Fetches a listing scoped to its owner; absent and not-owned look the
    /// same to the caller.
    pub async fn fetch_owned_listing(
        &self,
        owner_id: &str,
        listing_id: &str,
    ) -> anyhow::Result<Option<Listing>> {
        let owner_filter = format!("eq.{owner_id}");
        let id_filter = format!("eq.{listing_id}");
        let rows: Vec<Listing> = self
            .select(
                LISTINGS_TABLE,
                &[
                    ("id", id_filter.as_str()),
                    ("owner_id", owner_filter.as_str()),
                    ("limit", "1"),
                ],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    pub async fn account_ids(&self) -> anyhow::Result<HashSet<String>> {
        let rows: Vec<IdRow> = self.select(PROFILES_TABLE, &[("select", "id")]).await?;
        Ok(rows.into_iter().map(|row| row.id).collect())
    }

    pub async fn listing_ids_for_user(&self, user_id: &str) -> anyhow::Result<HashSet<String>> {
        let filter = format!("eq.{user_id}");
        let rows: Vec<IdRow> = self
            .select(
                LISTINGS_TABLE,
                &[("select", "id"), ("owner_id", filter.as_str())],
            )
            .await?;
        Ok(rows.into_iter().map(|row| row.id).collect())
    }

    pub async fn job_ids_for_user(&self, user_id: &str) -> anyhow::Result<HashSet<String>> {
        let filter = format!("eq.{user_id}");
        let rows: Vec<IdRow> = self
            .select(
                JOBS_TABLE,
                &[("select", "id"), ("user_id", filter.as_str())],
            )
            .await?;
        Ok(rows.into_iter().map(|row| row.id).collect())
    }

    async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, &str)],
    ) -> anyhow::Result<Vec<T>> {
        let url = format!("{}/{}", self.base_url, table);
        let response = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .with_context(|| format!("select from {table} failed"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("select from {table} returned {status}: {body}"));
        }

        response
            .json::<Vec<T>>()
            .await
            .with_context(|| format!("failed to decode rows from {table}"))
    }

    /// Insert a row. `Ok(false)` means a unique-key conflict (row already
    /// exists); every other non-2xx is an error.
    async fn insert_row<T: Serialize>(&self, table: &str, row: &T) -> anyhow::Result<bool> {
        let url = format!("{}/{}", self.base_url, table);
        let response = self
            .http
            .post(&url)
            .header("Prefer", "return=minimal")
            .json(row)
            .send()
            .await
            .with_context(|| format!("insert into {table} failed"))?;

        let status = response.status();
        if status == StatusCode::CONFLICT {
            return Ok(false);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("insert into {table} returned {status}: {body}"));
        }
        Ok(true)
    }

    /// Conditional update: applies `patch` to rows matching `filters` and
    /// returns how many rows matched.
    async fn update_where<T: Serialize>(
        &self,
        table: &str,
        filters: &[(&str, String)],
        patch: &T,
    ) -> anyhow::Result<usize> {
        let url = format!("{}/{}", self.base_url, table);
        let query: Vec<(&str, &str)> = filters
            .iter()
            .map(|(key, value)| (*key, value.as_str()))
            .collect();
        let response = self
            .http
            .patch(&url)
            .query(&query)
            .header("Prefer", "return=representation")
            .json(patch)
            .send()
            .await
            .with_context(|| format!("update of {table} failed"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("update of {table} returned {status}: {body}"));
        }

        let rows: Vec<serde_json::Value> = response
            .json()
            .await
            .with_context(|| format!("failed to decode updated rows from {table}"))?;
        Ok(rows.len())
    }
}

#[derive(Debug, Deserialize)]
struct IdRow {
    id: String,
}

#[derive(Debug, Deserialize)]
struct BalanceRow {
    free_remaining: i64,
    paid_balance: i64,
}

#[async_trait]
impl BalanceStore for RestStore {
    async fn fetch(&self, user_id: &str) -> anyhow::Result<Option<Balance>> {
        let filter = format!("eq.{user_id}");
        let rows: Vec<BalanceRow> = self
            .select(
                BALANCES_TABLE,
                &[
                    ("select", "free_remaining,paid_balance"),
                    ("user_id", filter.as_str()),
                    ("limit", "1"),
                ],
            )
            .await?;
        Ok(rows.into_iter().next().map(|row| Balance {
            free_remaining: row.free_remaining,
            paid_balance: row.paid_balance,
        }))
    }

    async fn compare_and_swap(
        &self,
        user_id: &str,
        expected: Balance,
        next: Balance,
    ) -> anyhow::Result<bool> {
        let matched = self
            .update_where(
                BALANCES_TABLE,
                &[
                    ("user_id", format!("eq.{user_id}")),
                    ("free_remaining", format!("eq.{}", expected.free_remaining)),
                    ("paid_balance", format!("eq.{}", expected.paid_balance)),
                ],
                &serde_json::json!({
                    "free_remaining": next.free_remaining,
                    "paid_balance": next.paid_balance,
                }),
            )
            .await?;
        Ok(matched > 0)
    }

    async fn insert(&self, user_id: &str, initial: Balance) -> anyhow::Result<bool> {
        self.insert_row(
            BALANCES_TABLE,
            &serde_json::json!({
                "user_id": user_id,
                "free_remaining": initial.free_remaining,
                "paid_balance": initial.paid_balance,
            }),
        )
        .await
    }

    async fn append_transaction(&self, entry: &CreditTransaction) -> anyhow::Result<()> {
        let created = self
            .insert_row(
                TRANSACTIONS_TABLE,
                &serde_json::json!({
                    "user_id": entry.user_id,
                    "amount": entry.amount,
                    "description": entry.description,
                    "created_at": entry.created_at,
                }),
            )
            .await?;
        if !created {
            return Err(anyhow!("transaction insert reported a conflict"));
        }
        Ok(())
    }
}

/// Column-level representation of a job row; the wire model in `jobs::Job`
/// uses camelCase for API responses while the database keeps snake_case.
#[derive(Debug, Serialize, Deserialize)]
struct JobRow {
    id: Uuid,
    user_id: String,
    kind: JobKind,
    status: JobStatus,
    credits_charged: i64,
    credits_refunded: bool,
    error_message: Option<String>,
    result_payload: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<&Job> for JobRow {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            user_id: job.user_id.clone(),
            kind: job.kind,
            status: job.status,
            credits_charged: job.credits_charged,
            credits_refunded: job.credits_refunded,
            error_message: job.error_message.clone(),
            result_payload: job.result_payload.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            kind: row.kind,
            status: row.status,
            credits_charged: row.credits_charged,
            credits_refunded: row.credits_refunded,
            error_message: row.error_message,
            result_payload: row.result_payload,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

fn status_filter(from: &[JobStatus]) -> String {
    let names: Vec<&str> = from.iter().map(|status| status.as_str()).collect();
    format!("in.({})", names.join(","))
}

#[async_trait]
impl JobStore for RestStore {
    async fn insert(&self, job: &Job) -> anyhow::Result<()> {
        let created = self.insert_row(JOBS_TABLE, &JobRow::from(job)).await?;
        if !created {
            return Err(anyhow!("job {} already exists", job.id));
        }
        Ok(())
    }

    async fn fetch(&self, id: Uuid) -> anyhow::Result<Option<Job>> {
        let filter = format!("eq.{id}");
        let rows: Vec<JobRow> = self
            .select(JOBS_TABLE, &[("id", filter.as_str()), ("limit", "1")])
            .await?;
        Ok(rows.into_iter().next().map(Job::from))
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[JobStatus],
        patch: JobPatch,
    ) -> anyhow::Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }

        let mut body = serde_json::Map::new();
        if let Some(status) = patch.status {
            body.insert("status".to_string(), status.as_str().into());
        }
        if let Some(message) = patch.error_message {
            body.insert("error_message".to_string(), message.into());
        }
        if let Some(payload) = patch.result_payload {
            body.insert("result_payload".to_string(), payload);
        }
        if let Some(refunded) = patch.credits_refunded {
            body.insert("credits_refunded".to_string(), refunded.into());
        }
        body.insert(
            "updated_at".to_string(),
            serde_json::to_value(Utc::now()).unwrap_or_default(),
        );

        let matched = self
            .update_where(
                JOBS_TABLE,
                &[
                    ("id", format!("eq.{id}")),
                    ("status", status_filter(from)),
                ],
                &serde_json::Value::Object(body),
            )
            .await?;
        Ok(matched > 0)
    }
}

#[async_trait]
impl ListingStore for RestStore {
    async fn fetch_owned(
        &self,
        owner_id: &str,
        listing_id: &str,
    ) -> anyhow::Result<Option<Listing>> {
        self.fetch_owned_listing(owner_id, listing_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_filter_lists_admissible_sources() {
        assert_eq!(
            status_filter(&[JobStatus::Pending, JobStatus::Processing]),
            "in.(pending,processing)"
        );
    }
}
