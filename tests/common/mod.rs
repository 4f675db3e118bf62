#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use listing_jobs_server::{
    gateway::WebhookGateway,
    jobs::{Job, JobPatch, JobStatus, JobStore},
    ledger::{Balance, BalanceStore, CreditLedger, CreditTransaction},
    listings::{Characteristic, Listing, ListingStore},
    orchestrator::{Costs, JobOrchestrator},
};

/// Balance rows in memory. `fail_after_writes` lets a test allow a fixed
/// number of successful writes and then make the store start failing, which
/// is how the refund-failure path gets exercised. `queue_conflicting_write`
/// makes the next swap lose to a concurrent writer that lands the queued
/// balance instead.
#[derive(Default)]
pub struct MemoryBalances {
    rows: Mutex<HashMap<String, Balance>>,
    pub transactions: Mutex<Vec<CreditTransaction>>,
    fail_after_writes: Mutex<Option<u32>>,
    conflicting_writes: Mutex<VecDeque<Balance>>,
}

impl MemoryBalances {
    pub fn with_balance(user_id: &str, balance: Balance) -> Arc<Self> {
        let store = Self::default();
        store.rows.lock().insert(user_id.to_string(), balance);
        Arc::new(store)
    }

    pub fn balance_of(&self, user_id: &str) -> Option<Balance> {
        self.rows.lock().get(user_id).copied()
    }

    pub fn fail_after_writes(&self, writes: u32) {
        *self.fail_after_writes.lock() = Some(writes);
    }

    pub fn queue_conflicting_write(&self, balance: Balance) {
        self.conflicting_writes.lock().push_back(balance);
    }

    fn consume_write_budget(&self) -> anyhow::Result<()> {
        let mut budget = self.fail_after_writes.lock();
        match budget.as_mut() {
            Some(0) => Err(anyhow::anyhow!("balance store is down")),
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BalanceStore for MemoryBalances {
    async fn fetch(&self, user_id: &str) -> anyhow::Result<Option<Balance>> {
        Ok(self.rows.lock().get(user_id).copied())
    }

    async fn compare_and_swap(
        &self,
        user_id: &str,
        expected: Balance,
        next: Balance,
    ) -> anyhow::Result<bool> {
        self.consume_write_budget()?;
        let mut rows = self.rows.lock();
        if let Some(interloper) = self.conflicting_writes.lock().pop_front() {
            rows.insert(user_id.to_string(), interloper);
            return Ok(false);
        }
        match rows.get_mut(user_id) {
            Some(current) if *current == expected => {
                *current = next;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert(&self, user_id: &str, initial: Balance) -> anyhow::Result<bool> {
        self.consume_write_budget()?;
        let mut rows = self.rows.lock();
        if rows.contains_key(user_id) {
            return Ok(false);
        }
        rows.insert(user_id.to_string(), initial);
        Ok(true)
    }

    async fn append_transaction(&self, entry: &CreditTransaction) -> anyhow::Result<()> {
        self.transactions.lock().push(entry.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryJobs {
    rows: Mutex<HashMap<Uuid, Job>>,
    pub fail_inserts: Mutex<bool>,
}

impl MemoryJobs {
    pub fn job(&self, id: Uuid) -> Option<Job> {
        self.rows.lock().get(&id).cloned()
    }

    pub fn only_job(&self) -> Job {
        let rows = self.rows.lock();
        assert_eq!(rows.len(), 1, "expected exactly one job row");
        rows.values().next().cloned().unwrap()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    pub fn seed(&self, job: Job) {
        self.rows.lock().insert(job.id, job);
    }
}

#[async_trait]
impl JobStore for MemoryJobs {
    async fn insert(&self, job: &Job) -> anyhow::Result<()> {
        if *self.fail_inserts.lock() {
            return Err(anyhow::anyhow!("job store is down"));
        }
        self.rows.lock().insert(job.id, job.clone());
        Ok(())
    }

    async fn fetch(&self, id: Uuid) -> anyhow::Result<Option<Job>> {
        Ok(self.rows.lock().get(&id).cloned())
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[JobStatus],
        patch: JobPatch,
    ) -> anyhow::Result<bool> {
        let mut rows = self.rows.lock();
        let Some(job) = rows.get_mut(&id) else {
            return Ok(false);
        };
        if !from.contains(&job.status) {
            return Ok(false);
        }
        if let Some(status) = patch.status {
            job.status = status;
        }
        if let Some(message) = patch.error_message {
            job.error_message = Some(message);
        }
        if let Some(payload) = patch.result_payload {
            job.result_payload = Some(payload);
        }
        if let Some(refunded) = patch.credits_refunded {
            job.credits_refunded = refunded;
        }
        Ok(true)
    }
}

#[derive(Default)]
pub struct MemoryListings {
    rows: Mutex<Vec<Listing>>,
}

impl MemoryListings {
    pub fn with_listing(listing: Listing) -> Arc<Self> {
        let store = Self::default();
        store.rows.lock().push(listing);
        Arc::new(store)
    }
}

#[async_trait]
impl ListingStore for MemoryListings {
    async fn fetch_owned(
        &self,
        owner_id: &str,
        listing_id: &str,
    ) -> anyhow::Result<Option<Listing>> {
        Ok(self
            .rows
            .lock()
            .iter()
            .find(|listing| listing.id == listing_id && listing.owner_id == owner_id)
            .cloned())
    }
}

pub fn sample_listing(owner_id: &str, id: &str) -> Listing {
    Listing {
        id: id.to_string(),
        owner_id: owner_id.to_string(),
        title: "Sunny flat".to_string(),
        description: Some("Two rooms near the sea".to_string()),
        price: Some(250_000),
        currency: Some("EUR".to_string()),
        city: Some("Istanbul".to_string()),
        district: Some("Kadikoy".to_string()),
        property_type: Some("apartment".to_string()),
        characteristics: vec![Characteristic {
            name: "bedrooms".to_string(),
            value: Some("2".to_string()),
        }],
    }
}

pub fn image_urls() -> Vec<String> {
    vec![
        "https://cdn.example.com/a.jpg".to_string(),
        "https://cdn.example.com/b.jpg".to_string(),
        "https://cdn.example.com/c.jpg".to_string(),
    ]
}

pub struct Fixture {
    pub balances: Arc<MemoryBalances>,
    pub jobs: Arc<MemoryJobs>,
    pub listings: Arc<MemoryListings>,
    pub orchestrator: JobOrchestrator,
}

/// Orchestrator over in-memory stores with both webhooks pointed at `url`.
pub fn fixture(
    balances: Arc<MemoryBalances>,
    listings: Arc<MemoryListings>,
    url: &str,
    video_cost: i64,
) -> Fixture {
    fixture_with_timeout(balances, listings, url, video_cost, Duration::from_secs(5))
}

pub fn fixture_with_timeout(
    balances: Arc<MemoryBalances>,
    listings: Arc<MemoryListings>,
    url: &str,
    video_cost: i64,
    timeout: Duration,
) -> Fixture {
    let jobs = Arc::new(MemoryJobs::default());
    let gateway = WebhookGateway::new(Some("gateway-token".to_string()), timeout)
        .expect("gateway construction");
    let orchestrator = JobOrchestrator::new(
        CreditLedger::new(balances.clone()),
        jobs.clone(),
        listings.clone(),
        gateway,
        Some(url.to_string()),
        Some(url.to_string()),
        Costs {
            video_generation: video_cost,
            prefill: 1,
        },
    );
    Fixture {
        balances,
        jobs,
        listings,
        orchestrator,
    }
}
