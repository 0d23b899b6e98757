//! Sub-batched unit processing with checkpoints.
//!
//! A shard owns the units whose index maps to it (`unit % shard_count`). The
//! units are walked in fixed-size batches; after each batch the counters are
//! added to the job once and the step's cursor moves past it, so a restart
//! picks up at the first batch without a checkpoint.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tether_models::ProgressDelta;
use tracing::debug;

use super::context::StepContext;
use super::workflow::{Step, StepResult};

/// Counters for one processed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitOutcome {
    pub succeeded: u64,
    pub failed: u64,
}

impl UnitOutcome {
    pub fn all_succeeded(count: usize) -> Self {
        Self {
            succeeded: count as u64,
            failed: 0,
        }
    }
}

/// Work done for one batch of units. May be called again for the same batch
/// after a crash; side effects should go through `StepContext::guard`.
#[async_trait]
pub trait UnitProcessor: Send + Sync {
    async fn process(&self, ctx: &StepContext, batch_index: u64, units: &[u64]) -> StepResult<UnitOutcome>;
}

pub struct UnitBatchStep {
    name: String,
    batch_size: usize,
    processor: Arc<dyn UnitProcessor>,
}

impl UnitBatchStep {
    pub fn new(name: impl Into<String>, batch_size: usize, processor: Arc<dyn UnitProcessor>) -> Self {
        Self {
            name: name.into(),
            batch_size: batch_size.max(1),
            processor,
        }
    }
}

/// Units of the job owned by `shard`, in order.
pub fn shard_units(total_units: u64, shard: u32, shard_count: u32) -> Vec<u64> {
    let shard_count = u64::from(shard_count.max(1));
    (0..total_units)
        .filter(|unit| unit % shard_count == u64::from(shard))
        .collect()
}

#[async_trait]
impl Step for UnitBatchStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StepContext) -> StepResult<Value> {
        let units = shard_units(ctx.total_units(), ctx.shard(), ctx.shard_count());
        let start = ctx.cursor().await.unwrap_or(0);
        let mut totals = UnitOutcome::default();

        for (index, batch) in units.chunks(self.batch_size).enumerate().skip(start as usize) {
            let batch_index = index as u64;
            let outcome = self.processor.process(ctx, batch_index, batch).await?;
            totals.succeeded += outcome.succeeded;
            totals.failed += outcome.failed;
            ctx.checkpoint(batch_index, ProgressDelta::units(outcome.succeeded, outcome.failed))
                .await?;
        }

        debug!(
            job_id = %ctx.job_id(),
            shard = ctx.shard(),
            units = units.len(),
            resumed_at = start,
            "Processed shard units"
        );
        Ok(json!({
            "shard": ctx.shard(),
            "units": units.len(),
            "batches": units.len().div_ceil(self.batch_size),
            "resumed_at_batch": start,
            // Only the batches run in this attempt; earlier ones were counted at
            // their own checkpoints.
            "succeeded": totals.succeeded,
            "failed": totals.failed,
        }))
    }
}
