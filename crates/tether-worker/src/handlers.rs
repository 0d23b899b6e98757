//! Handlers for the built-in message types.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tether_models::{JobRecord, MessageBody, ProgressDelta};
use tether_store::JobRecordStore;
use tracing::{debug, info};

use crate::control::ControlPlane;
use crate::handler::{Handler, HandlerError, HandlerResult, Message};
use crate::orchestrator::Engine;

/// `job.start`: create the job record and one orchestrator instance per
/// shard. Re-delivery finds both already in place.
pub struct StartJobHandler {
    jobs: Arc<dyn JobRecordStore>,
    engine: Arc<Engine>,
}

impl StartJobHandler {
    pub fn new(jobs: Arc<dyn JobRecordStore>, engine: Arc<Engine>) -> Self {
        Self { jobs, engine }
    }
}

#[async_trait]
impl Handler for StartJobHandler {
    async fn handle(&self, message: &Message) -> HandlerResult {
        let MessageBody::StartJob(start) = &message.body else {
            return Err(HandlerError::validation(format!(
                "expected {}, got {}",
                MessageBody::START_JOB,
                message.body.message_type()
            )));
        };
        if self.engine.registry().get(&start.job_type).is_none() {
            return Err(HandlerError::validation(format!("unknown job type {}", start.job_type)));
        }

        let shards = start.shards.max(1);
        let record = JobRecord::new(start.job_id.clone(), start.job_type.clone())
            .with_parameters(start.parameters.clone())
            .with_total_units(start.total_units)
            .with_instance_count(shards);
        let job = self.jobs.create(record).await?;
        if job.status.is_terminal() {
            debug!(job_id = %job.job_id, status = %job.status, "Start for finished job ignored");
            return Ok(json!({ "job_id": job.job_id, "status": job.status.as_str() }));
        }

        let mut instances = Vec::with_capacity(job.instance_count as usize);
        for shard in 0..job.instance_count {
            let instance_id = self
                .engine
                .start_instance(&job.job_id, shard, job.instance_count, job.parameters.clone())
                .await?;
            instances.push(instance_id.to_string());
        }

        info!(job_id = %job.job_id, job_type = %job.job_type, shards = job.instance_count, "Job started");
        Ok(json!({ "job_id": job.job_id, "instances": instances }))
    }
}

/// `job.control`: cancel, pause or resume.
pub struct ControlHandler {
    control: Arc<ControlPlane>,
}

impl ControlHandler {
    pub fn new(control: Arc<ControlPlane>) -> Self {
        Self { control }
    }
}

#[async_trait]
impl Handler for ControlHandler {
    async fn handle(&self, message: &Message) -> HandlerResult {
        let MessageBody::ControlJob(command) = &message.body else {
            return Err(HandlerError::validation(format!(
                "expected {}, got {}",
                MessageBody::CONTROL_JOB,
                message.body.message_type()
            )));
        };
        let entry = self.control.apply(command).await?;
        Ok(json!({ "outcome": entry.outcome, "instances": entry.instances }))
    }
}

/// `unit.process`: a short unit handled inline by the dispatcher. Counts the
/// unit against its job when it names one.
pub struct UnitProgressHandler {
    jobs: Arc<dyn JobRecordStore>,
}

impl UnitProgressHandler {
    pub fn new(jobs: Arc<dyn JobRecordStore>) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl Handler for UnitProgressHandler {
    async fn handle(&self, message: &Message) -> HandlerResult {
        let MessageBody::ProcessUnit(unit) = &message.body else {
            return Err(HandlerError::validation(format!(
                "expected {}, got {}",
                MessageBody::PROCESS_UNIT,
                message.body.message_type()
            )));
        };

        match &unit.job_id {
            Some(job_id) => {
                // Token makes a re-run after a lost commit a no-op.
                let delta = ProgressDelta::units(1, 0).at_checkpoint(message.envelope.idempotency_key.as_str());
                let applied = self.jobs.update_progress(job_id, &delta).await?;
                Ok(json!({ "unit_id": unit.unit_id, "applied": applied }))
            }
            None => {
                debug!(stream = %unit.stream, unit_id = %unit.unit_id, "Processed unit");
                Ok(json!({ "unit_id": unit.unit_id }))
            }
        }
    }
}
