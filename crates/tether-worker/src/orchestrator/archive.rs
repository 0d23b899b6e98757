//! Built-in `archive` workflow: writes each shard's units to blob storage in
//! batches, then a per-shard manifest.
//!
//! Parameters (all optional): `batch_size` (default 50) and `fail_units`, a
//! list of unit indices to count as failed.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::batch::{UnitBatchStep, UnitOutcome, UnitProcessor};
use super::context::StepContext;
use super::workflow::{Step, StepError, StepResult, Workflow};

pub const ARCHIVE_JOB_TYPE: &str = "archive";

const DEFAULT_BATCH_SIZE: usize = 50;

pub struct ArchiveWorkflow {
    batch_size: usize,
}

impl ArchiveWorkflow {
    pub fn new(batch_size: usize) -> Self {
        Self { batch_size }
    }
}

impl Default for ArchiveWorkflow {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}

impl Workflow for ArchiveWorkflow {
    fn name(&self) -> &str {
        ARCHIVE_JOB_TYPE
    }

    fn steps(&self) -> Vec<Arc<dyn Step>> {
        vec![
            Arc::new(UnitBatchStep::new(
                "write-batches",
                self.batch_size,
                Arc::new(BlobArchiveProcessor),
            )),
            Arc::new(ManifestStep),
        ]
    }
}

/// Writes one JSON object per batch.
pub struct BlobArchiveProcessor;

#[async_trait]
impl UnitProcessor for BlobArchiveProcessor {
    async fn process(&self, ctx: &StepContext, batch_index: u64, units: &[u64]) -> StepResult<UnitOutcome> {
        let failing: Vec<u64> = ctx
            .parameters()
            .get("fail_units")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(Value::as_u64).collect())
            .unwrap_or_default();
        let (failed, succeeded): (Vec<u64>, Vec<u64>) = units.iter().partition(|u| failing.contains(*u));

        let key = format!("results/{}/{}/{}.json", ctx.job_id(), ctx.shard(), batch_index);
        let body = serde_json::to_vec(&json!({
            "job_id": ctx.job_id(),
            "shard": ctx.shard(),
            "batch": batch_index,
            "units": succeeded,
            "failed": failed,
        }))?;

        let blobs = ctx.blobs();
        ctx.guard(&format!("write-{}", batch_index), || async move {
            let blob = blobs.put(&key, body, "application/json").await?;
            Ok(serde_json::to_value(blob)?)
        })
        .await?;

        Ok(UnitOutcome {
            succeeded: succeeded.len() as u64,
            failed: failed.len() as u64,
        })
    }
}

/// Summarizes the shard and points the job at the manifest.
pub struct ManifestStep;

#[async_trait]
impl Step for ManifestStep {
    fn name(&self) -> &str {
        "manifest"
    }

    async fn run(&self, ctx: &StepContext) -> StepResult<Value> {
        let summary = ctx
            .output("write-batches")
            .cloned()
            .ok_or_else(|| StepError::engine_fatal("write-batches output missing"))?;

        let key = format!("results/{}/{}/manifest.json", ctx.job_id(), ctx.shard());
        let body = serde_json::to_vec(&json!({
            "job_id": ctx.job_id(),
            "shard": ctx.shard(),
            "shard_count": ctx.shard_count(),
            "summary": summary,
        }))?;

        let blobs = ctx.blobs();
        let stored = ctx
            .guard("manifest", || async move {
                let blob = blobs.put(&key, body, "application/json").await?;
                Ok(serde_json::to_value(blob)?)
            })
            .await?;

        let uri = stored
            .get("uri")
            .and_then(Value::as_str)
            .ok_or_else(|| StepError::engine_fatal("manifest blob reference has no uri"))?;
        if ctx.shard() == 0 {
            ctx.set_result_pointer(uri).await?;
        }
        Ok(stored)
    }
}
