//! Outcome memory used to hint future repairs.
//!
//! Every concluded run appends one [`KnowledgeRecord`]: a fingerprint of the
//! bug, the strategy tried and whether it produced a verified patch. Planning
//! looks up the nearest records by cosine similarity.
//!
//! Storage sits behind [`KnowledgeStore`]. The orchestrator talks to it through
//! [`KnowledgeBase`], which never fails: write errors are logged and dropped,
//! read errors yield no hints.

pub mod jsonl;
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::warn;

use crate::model::{BugReport, RiskTier, RunId, Strategy};

pub use jsonl::JsonlKnowledgeStore;
pub use memory::MemoryKnowledgeStore;

/// Dimensions of the default fingerprint.
pub const FINGERPRINT_DIMS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeRecord {
    pub fingerprint: Vec<f32>,
    /// Absent when the run never produced a plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    pub outcome: Outcome,
    /// Absent when the run never reached risk classification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_tier: Option<RiskTier>,
    pub target: String,
    pub run_id: RunId,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn append(&self, record: KnowledgeRecord) -> Result<()>;

    /// Every stored record, in append order.
    async fn load_all(&self) -> Result<Vec<KnowledgeRecord>>;

    /// Up to `k` records nearest to `fingerprint`, most similar first, ties
    /// broken newest first.
    async fn query_nearest(&self, fingerprint: &[f32], k: usize) -> Result<Vec<KnowledgeRecord>> {
        Ok(rank_nearest(self.load_all().await?, fingerprint, k))
    }
}

/// Rank records by similarity to `fingerprint`.
pub fn rank_nearest(
    records: Vec<KnowledgeRecord>,
    fingerprint: &[f32],
    k: usize,
) -> Vec<KnowledgeRecord> {
    let mut scored: Vec<(f32, KnowledgeRecord)> = records
        .into_iter()
        .map(|r| (cosine_similarity(&r.fingerprint, fingerprint), r))
        .collect();
    scored.sort_by(|(sa, ra), (sb, rb)| {
        sb.partial_cmp(sa)
            .unwrap_or(Ordering::Equal)
            .then_with(|| rb.recorded_at.cmp(&ra.recorded_at))
    });
    scored.into_iter().take(k).map(|(_, r)| r).collect()
}

/// Cosine similarity in [-1, 1]. Mismatched lengths and zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Turns a bug report into a similarity vector.
pub trait Fingerprinter: Send + Sync {
    fn fingerprint(&self, bug: &BugReport) -> Vec<f32>;
}

/// Feature-hashed bag of tokens from the report, L2-normalised.
#[derive(Debug, Clone, Copy)]
pub struct HashingFingerprinter {
    dims: usize,
}

impl Default for HashingFingerprinter {
    fn default() -> Self {
        Self {
            dims: FINGERPRINT_DIMS,
        }
    }
}

impl Fingerprinter for HashingFingerprinter {
    fn fingerprint(&self, bug: &BugReport) -> Vec<f32> {
        let mut vector = vec![0f32; self.dims];
        let mut text = format!("{} {}", bug.category, bug.location.file);
        if let Some(symbol) = &bug.location.symbol {
            text.push(' ');
            text.push_str(symbol);
        }
        text.push(' ');
        text.push_str(&bug.description);

        for token in tokens(&text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let index = (u64::from_le_bytes(bucket) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() > 1)
        .map(str::to_lowercase)
}

/// Infallible facade over a [`KnowledgeStore`].
#[derive(Clone)]
pub struct KnowledgeBase {
    store: Arc<dyn KnowledgeStore>,
    fingerprinter: Arc<dyn Fingerprinter>,
}

impl std::fmt::Debug for KnowledgeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeBase").finish_non_exhaustive()
    }
}

impl KnowledgeBase {
    pub fn new(store: Arc<dyn KnowledgeStore>) -> Self {
        Self {
            store,
            fingerprinter: Arc::new(HashingFingerprinter::default()),
        }
    }

    pub fn with_fingerprinter(mut self, fingerprinter: Arc<dyn Fingerprinter>) -> Self {
        self.fingerprinter = fingerprinter;
        self
    }

    pub fn fingerprint(&self, bug: &BugReport) -> Vec<f32> {
        self.fingerprinter.fingerprint(bug)
    }

    /// Append a record. Failures are logged, never returned.
    pub async fn record(&self, record: KnowledgeRecord) {
        let run_id = record.run_id;
        if let Err(e) = self.store.append(record).await {
            warn!(run_id = %run_id, "failed to record knowledge: {e:#}");
        }
    }

    /// Nearest records, or none if the store cannot be read.
    pub async fn query_nearest(&self, fingerprint: &[f32], k: usize) -> Vec<KnowledgeRecord> {
        if k == 0 {
            return Vec::new();
        }
        match self.store.query_nearest(fingerprint, k).await {
            Ok(records) => records,
            Err(e) => {
                warn!("knowledge lookup failed: {e:#}");
                Vec::new()
            }
        }
    }

    pub async fn similar_to(&self, bug: &BugReport, k: usize) -> Vec<KnowledgeRecord> {
        let fingerprint = self.fingerprint(bug);
        self.query_nearest(&fingerprint, k).await
    }
}
