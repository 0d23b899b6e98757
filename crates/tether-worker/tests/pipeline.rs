//! End-to-end pipeline behaviour on the in-memory backends.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use tether_models::{
    ControlAction, ControlJob, Envelope, ErrorClass, InstanceId, InstanceRecord, InstanceSignal, InstanceStatus,
    JobId, JobRecord, JobStatus, LedgerStatus, MessageBody, ProcessUnit, StartJob, StepStatus,
};
use tether_queue::{InMemoryQueue, MessageQueue};
use tether_storage::InMemoryBlobStore;
use tether_store::{
    InMemoryAuditLog, InMemoryInstanceStore, InMemoryJobStore, InMemoryLedger, InMemorySequenceStore,
    InstanceStore, JobRecordStore, Ledger, StoreError, StoreResult,
};
use tether_worker::orchestrator::{ArchiveWorkflow, UnitBatchStep, UnitOutcome, UnitProcessor};
use tether_worker::{
    BatchReport, Consumer, ControlHandler, ControlPlane, Engine, EngineConfig, Handler, HandlerError,
    HandlerResult, HandlerRouter, Message, SequencedHandler, StartJobHandler, Step, StepContext, StepResult,
    WorkerConfig, Workflow, WorkflowRegistry,
};

// =============================================================================
// Fixtures
// =============================================================================

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        consumer_name: "test-consumer".to_string(),
        max_retries: 3,
        retry_base_delay: Duration::ZERO,
        retry_max_delay: Duration::ZERO,
        defer_delay: Duration::ZERO,
        ..WorkerConfig::default()
    }
}

fn engine_config() -> EngineConfig {
    EngineConfig {
        step_base_delay: Duration::ZERO,
        step_max_delay: Duration::ZERO,
        ..EngineConfig::default()
    }
}

fn unit(stream: &str, unit_id: &str, sequence: Option<u64>) -> Envelope {
    let body = MessageBody::ProcessUnit(ProcessUnit {
        job_id: None,
        stream: stream.to_string(),
        unit_id: unit_id.to_string(),
        sequence,
        data: json!({}),
    });
    Envelope::new(&body, unit_id).unwrap()
}

struct Stores {
    queue: Arc<InMemoryQueue>,
    ledger: Arc<InMemoryLedger>,
    jobs: Arc<InMemoryJobStore>,
    blobs: Arc<InMemoryBlobStore>,
}

impl Stores {
    fn new() -> Self {
        Self {
            queue: Arc::new(InMemoryQueue::default()),
            ledger: Arc::new(InMemoryLedger::default()),
            jobs: Arc::new(InMemoryJobStore::new()),
            blobs: Arc::new(InMemoryBlobStore::new()),
        }
    }

    fn consumer(&self, handler: Arc<dyn Handler>) -> Consumer {
        Consumer::new(
            worker_config(),
            self.queue.clone(),
            self.ledger.clone(),
            self.jobs.clone(),
            self.blobs.clone(),
            handler,
        )
    }
}

/// Poll until the queue is empty, summing the reports.
async fn drain(consumer: &Consumer, queue: &InMemoryQueue) -> BatchReport {
    let mut total = BatchReport::default();
    for _ in 0..50 {
        if queue.depth().await.unwrap() == 0 {
            break;
        }
        let report = consumer.poll_once().await.unwrap();
        total.acked += report.acked;
        total.retried += report.retried;
        total.deferred += report.deferred;
        total.dead_lettered += report.dead_lettered;
    }
    assert_eq!(queue.depth().await.unwrap(), 0, "queue did not drain");
    total
}

/// Counts invocations; fails units whose id is listed.
struct UnitCounter {
    calls: AtomicU32,
    failing: Vec<(&'static str, fn() -> HandlerError)>,
}

impl UnitCounter {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            failing: Vec::new(),
        })
    }

    fn failing(unit_id: &'static str, make: fn() -> HandlerError) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            failing: vec![(unit_id, make)],
        })
    }
}

#[async_trait]
impl Handler for UnitCounter {
    async fn handle(&self, message: &Message) -> HandlerResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let MessageBody::ProcessUnit(unit) = &message.body else {
            return Err(HandlerError::validation("unexpected body"));
        };
        match self.failing.iter().find(|(id, _)| *id == unit.unit_id) {
            Some((_, make)) => Err(make()),
            None => Ok(json!({ "unit_id": unit.unit_id })),
        }
    }
}

// =============================================================================
// Dispatch loop
// =============================================================================

#[tokio::test]
async fn test_double_delivery_runs_effect_once() {
    let stores = Stores::new();
    let handler = UnitCounter::ok();
    let consumer = stores.consumer(handler.clone());

    // Same business identity, distinct transport messages.
    let first = unit("orders", "u-1", None);
    let second = unit("orders", "u-1", None);
    assert_ne!(first.message_id, second.message_id);
    assert_eq!(first.idempotency_key, second.idempotency_key);
    stores.queue.publish(&first).await.unwrap();
    stores.queue.publish(&second).await.unwrap();

    let report = drain(&consumer, &stores.queue).await;
    assert_eq!(report.acked, 2);
    assert_eq!(report.dead_lettered, 0);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

    let entry = stores.ledger.get(&first.idempotency_key).await.unwrap().unwrap();
    assert_eq!(entry.status, LedgerStatus::Succeeded);
}

#[tokio::test]
async fn test_transient_failures_exhaust_into_dead_letters() {
    let stores = Stores::new();
    let handler = UnitCounter::failing("u-1", || HandlerError::transient("downstream unavailable"));
    let consumer = stores.consumer(handler.clone());
    let envelope = unit("orders", "u-1", None);
    stores.queue.publish(&envelope).await.unwrap();

    let report = drain(&consumer, &stores.queue).await;
    assert_eq!(report.retried, 2);
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

    let dead = stores.queue.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempt_count, 3);
    assert_eq!(dead[0].error_class, ErrorClass::Transient);
    assert!(dead[0].last_error.contains("downstream unavailable"));

    // Released, not failed: a redrive gets to run the handler again.
    let entry = stores.ledger.get(&envelope.idempotency_key).await.unwrap().unwrap();
    assert_eq!(entry.status, LedgerStatus::Pending);
    stores.queue.redrive(&dead[0].id).await.unwrap();
    consumer.poll_once().await.unwrap();
    assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_one_failure_does_not_affect_batch_siblings() {
    let stores = Stores::new();
    let handler = UnitCounter::failing("u-3", || HandlerError::business("unit rejected"));
    let consumer = stores.consumer(handler.clone());
    for i in 1..=5 {
        stores
            .queue
            .publish(&unit("orders", &format!("u-{}", i), None))
            .await
            .unwrap();
    }

    let report = consumer.poll_once().await.unwrap();
    assert_eq!(report.total(), 5);
    assert_eq!(report.acked, 4);
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(stores.queue.depth().await.unwrap(), 0);

    let dead = stores.queue.dead_letters(10).await.unwrap();
    assert_eq!(dead[0].envelope.subject, "u-3");
    assert_eq!(dead[0].error_class, ErrorClass::BusinessTerminal);
}

#[tokio::test]
async fn test_only_the_failed_message_is_redelivered() {
    let stores = Stores::new();
    let handler = UnitCounter::failing("u-3", || HandlerError::transient("downstream unavailable"));
    let consumer = stores.consumer(handler.clone());
    for i in 1..=5 {
        stores
            .queue
            .publish(&unit("orders", &format!("u-{}", i), None))
            .await
            .unwrap();
    }

    let report = consumer.poll_once().await.unwrap();
    assert_eq!(report.total(), 5);
    assert_eq!(report.acked, 4);
    assert_eq!(report.retried, 1);
    assert_eq!(report.dead_lettered, 0);

    let redelivered = stores.queue.receive("other-consumer", 10).await.unwrap();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].envelope.subject, "u-3");
    assert_eq!(redelivered[0].attempt, 2);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 5);
}

struct Recorder {
    seen: Arc<Mutex<Vec<u64>>>,
}

#[async_trait]
impl Handler for Recorder {
    async fn handle(&self, message: &Message) -> HandlerResult {
        if let MessageBody::ProcessUnit(unit) = &message.body {
            self.seen.lock().await.push(unit.sequence.unwrap_or(0));
        }
        Ok(Value::Null)
    }
}

#[tokio::test]
async fn test_out_of_order_sequences_apply_in_order() {
    let stores = Stores::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = SequencedHandler::new(
        Recorder { seen: seen.clone() },
        Arc::new(InMemorySequenceStore::new()),
    );
    let consumer = stores.consumer(Arc::new(handler));

    for sequence in [3, 1, 2] {
        stores
            .queue
            .publish(&unit("ledger-7", &format!("entry-{}", sequence), Some(sequence)))
            .await
            .unwrap();
    }

    let report = drain(&consumer, &stores.queue).await;
    assert_eq!(report.acked, 3);
    assert_eq!(report.dead_lettered, 0);
    assert_eq!(*seen.lock().await, vec![1, 2, 3]);
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Step that counts its runs and returns the previous step's output.
struct CountingStep {
    name: &'static str,
    previous: Option<&'static str>,
    runs: Arc<AtomicU32>,
}

#[async_trait]
impl Step for CountingStep {
    fn name(&self) -> &str {
        self.name
    }

    async fn run(&self, ctx: &StepContext) -> StepResult<Value> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = self.previous.and_then(|name| ctx.output(name)).cloned();
        Ok(json!({ "step": self.name, "run": run, "previous": previous }))
    }
}

struct ThreeSteps {
    runs: [Arc<AtomicU32>; 3],
}

impl Workflow for ThreeSteps {
    fn name(&self) -> &str {
        "three-steps"
    }

    fn steps(&self) -> Vec<Arc<dyn Step>> {
        vec![
            Arc::new(CountingStep {
                name: "a",
                previous: None,
                runs: self.runs[0].clone(),
            }),
            Arc::new(CountingStep {
                name: "b",
                previous: Some("a"),
                runs: self.runs[1].clone(),
            }),
            Arc::new(CountingStep {
                name: "c",
                previous: Some("b"),
                runs: self.runs[2].clone(),
            }),
        ]
    }
}

/// Instance store that fails the first save matching `crash_when`: the
/// process "crashes" before that state reaches storage.
struct CrashOnSave {
    inner: InMemoryInstanceStore,
    armed: AtomicBool,
    crash_when: fn(&InstanceRecord) -> bool,
}

impl CrashOnSave {
    fn new(crash_when: fn(&InstanceRecord) -> bool) -> Self {
        Self {
            inner: InMemoryInstanceStore::new(),
            armed: AtomicBool::new(true),
            crash_when,
        }
    }
}

#[async_trait]
impl InstanceStore for CrashOnSave {
    async fn create(&self, record: &InstanceRecord) -> StoreResult<bool> {
        self.inner.create(record).await
    }

    async fn get(&self, instance_id: &InstanceId) -> StoreResult<Option<InstanceRecord>> {
        self.inner.get(instance_id).await
    }

    async fn save(&self, record: &InstanceRecord) -> StoreResult<()> {
        if (self.crash_when)(record) && self.armed.swap(false, Ordering::SeqCst) {
            return Err(StoreError::unavailable("simulated crash"));
        }
        self.inner.save(record).await
    }

    async fn list_by_job(&self, job_id: &JobId) -> StoreResult<Vec<InstanceRecord>> {
        self.inner.list_by_job(job_id).await
    }

    async fn list_active(&self) -> StoreResult<Vec<InstanceRecord>> {
        self.inner.list_active().await
    }

    async fn set_signal(&self, instance_id: &InstanceId, signal: InstanceSignal) -> StoreResult<InstanceSignal> {
        self.inner.set_signal(instance_id, signal).await
    }

    async fn signal(&self, instance_id: &InstanceId) -> StoreResult<InstanceSignal> {
        self.inner.signal(instance_id).await
    }

    async fn try_lock(&self, instance_id: &InstanceId, owner: &str, ttl: Duration) -> StoreResult<bool> {
        self.inner.try_lock(instance_id, owner, ttl).await
    }

    async fn unlock(&self, instance_id: &InstanceId, owner: &str) -> StoreResult<()> {
        self.inner.unlock(instance_id, owner).await
    }
}

#[tokio::test]
async fn test_restart_resumes_after_last_recorded_step() {
    let stores = Stores::new();
    let runs = [
        Arc::new(AtomicU32::new(0)),
        Arc::new(AtomicU32::new(0)),
        Arc::new(AtomicU32::new(0)),
    ];
    // Crash on the save that would start "c", right after "b" was recorded.
    let instances = Arc::new(CrashOnSave::new(|record| {
        record.steps[1].status == StepStatus::Succeeded && record.steps[2].status == StepStatus::Running
    }));
    let registry = WorkflowRegistry::new().register(Arc::new(ThreeSteps { runs: runs.clone() }));
    let engine = Engine::new(
        engine_config(),
        registry,
        stores.jobs.clone(),
        instances.clone(),
        stores.ledger.clone(),
        stores.blobs.clone(),
    );

    let job_id = JobId::from_string("job-crash");
    stores
        .jobs
        .create(JobRecord::new(job_id.clone(), "three-steps"))
        .await
        .unwrap();
    let instance_id = engine.register_instance(&job_id, 0, 1, Value::Null).await.unwrap();

    assert!(engine.run_instance(&instance_id).await.is_err());
    let counts: Vec<u32> = runs.iter().map(|r| r.load(Ordering::SeqCst)).collect();
    assert_eq!(counts, vec![1, 1, 0]);
    let saved = instances.get(&instance_id).await.unwrap().unwrap();
    assert_eq!(saved.resume_index(), 2);

    let status = engine.run_instance(&instance_id).await.unwrap();
    assert_eq!(status, InstanceStatus::Completed);
    let counts: Vec<u32> = runs.iter().map(|r| r.load(Ordering::SeqCst)).collect();
    assert_eq!(counts, vec![1, 1, 1]);

    // "c" saw "b"'s output replayed from storage, not recomputed.
    let record = instances.get(&instance_id).await.unwrap().unwrap();
    let c_output = record.step("c").unwrap().output.as_ref().unwrap().inline().unwrap();
    assert_eq!(c_output["previous"]["step"], "b");
    assert_eq!(c_output["previous"]["run"], 1);

    let job = stores.jobs.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.finished_instances, 1);
}

/// Publishes once through the ledger and returns what was published.
struct PublishStep {
    runs: Arc<AtomicU32>,
    effects: Arc<AtomicU32>,
}

#[async_trait]
impl Step for PublishStep {
    fn name(&self) -> &str {
        "b"
    }

    async fn run(&self, ctx: &StepContext) -> StepResult<Value> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let effects = self.effects.clone();
        ctx.guard("publish", || async move {
            let published = effects.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(json!({ "published": published }))
        })
        .await
    }
}

struct GuardedMiddle {
    runs: [Arc<AtomicU32>; 3],
    effects: Arc<AtomicU32>,
}

impl Workflow for GuardedMiddle {
    fn name(&self) -> &str {
        "guarded-middle"
    }

    fn steps(&self) -> Vec<Arc<dyn Step>> {
        vec![
            Arc::new(CountingStep {
                name: "a",
                previous: None,
                runs: self.runs[0].clone(),
            }),
            Arc::new(PublishStep {
                runs: self.runs[1].clone(),
                effects: self.effects.clone(),
            }),
            Arc::new(CountingStep {
                name: "c",
                previous: Some("b"),
                runs: self.runs[2].clone(),
            }),
        ]
    }
}

#[tokio::test]
async fn test_crash_between_ledger_commit_and_step_record_reruns_only_that_step() {
    let stores = Stores::new();
    let runs = [
        Arc::new(AtomicU32::new(0)),
        Arc::new(AtomicU32::new(0)),
        Arc::new(AtomicU32::new(0)),
    ];
    let effects = Arc::new(AtomicU32::new(0));
    // Crash on the save that records "b" as succeeded; its guarded effect has
    // already been committed to the ledger by then.
    let instances = Arc::new(CrashOnSave::new(|record| {
        record.steps[1].status == StepStatus::Succeeded
    }));
    let registry = WorkflowRegistry::new().register(Arc::new(GuardedMiddle {
        runs: runs.clone(),
        effects: effects.clone(),
    }));
    let engine = Engine::new(
        engine_config(),
        registry,
        stores.jobs.clone(),
        instances.clone(),
        stores.ledger.clone(),
        stores.blobs.clone(),
    );

    let job_id = JobId::from_string("job-commit-crash");
    stores
        .jobs
        .create(JobRecord::new(job_id.clone(), "guarded-middle"))
        .await
        .unwrap();
    let instance_id = engine.register_instance(&job_id, 0, 1, Value::Null).await.unwrap();

    assert!(engine.run_instance(&instance_id).await.is_err());
    let counts: Vec<u32> = runs.iter().map(|r| r.load(Ordering::SeqCst)).collect();
    assert_eq!(counts, vec![1, 1, 0]);
    assert_eq!(effects.load(Ordering::SeqCst), 1);
    let saved = instances.get(&instance_id).await.unwrap().unwrap();
    assert_eq!(saved.resume_index(), 1);

    let status = engine.run_instance(&instance_id).await.unwrap();
    assert_eq!(status, InstanceStatus::Completed);
    let counts: Vec<u32> = runs.iter().map(|r| r.load(Ordering::SeqCst)).collect();
    assert_eq!(counts, vec![1, 2, 1]);
    assert_eq!(effects.load(Ordering::SeqCst), 1, "guarded effect ran twice");

    // The re-run of "b" replayed the recorded result.
    let record = instances.get(&instance_id).await.unwrap().unwrap();
    let c_output = record.step("c").unwrap().output.as_ref().unwrap().inline().unwrap();
    assert_eq!(c_output["previous"]["published"], 1);
    assert_eq!(
        stores.jobs.get(&job_id).await.unwrap().unwrap().status,
        JobStatus::Completed
    );
}

/// Requests cancellation of its own job while processing one batch.
struct CancelAt {
    jobs: Arc<InMemoryJobStore>,
    batch: u64,
}

#[async_trait]
impl UnitProcessor for CancelAt {
    async fn process(&self, ctx: &StepContext, batch_index: u64, units: &[u64]) -> StepResult<UnitOutcome> {
        if batch_index == self.batch {
            self.jobs
                .set_cancel_requested(ctx.job_id(), Some("operator"))
                .await?;
        }
        Ok(UnitOutcome::all_succeeded(units.len()))
    }
}

struct Batches {
    processor: Arc<dyn UnitProcessor>,
}

impl Workflow for Batches {
    fn name(&self) -> &str {
        "batches"
    }

    fn steps(&self) -> Vec<Arc<dyn Step>> {
        vec![Arc::new(UnitBatchStep::new("process", 10, self.processor.clone()))]
    }
}

#[tokio::test]
async fn test_cancel_stops_at_next_checkpoint() {
    let stores = Stores::new();
    let instances = Arc::new(InMemoryInstanceStore::new());
    let processor = Arc::new(CancelAt {
        jobs: stores.jobs.clone(),
        batch: 3,
    });
    let registry = WorkflowRegistry::new().register(Arc::new(Batches { processor }));
    let engine = Arc::new(Engine::new(
        engine_config(),
        registry,
        stores.jobs.clone(),
        instances.clone(),
        stores.ledger.clone(),
        stores.blobs.clone(),
    ));

    let job_id = JobId::from_string("job-cancel");
    stores
        .jobs
        .create(JobRecord::new(job_id.clone(), "batches").with_total_units(100))
        .await
        .unwrap();
    let instance_id = engine.start_instance(&job_id, 0, 1, Value::Null).await.unwrap();
    engine.join(&instance_id).await;

    let job = stores.jobs.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.processed_units, 40);
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.cancel_reason.as_deref(), Some("operator"));

    let instance = instances.get(&instance_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Terminated);
    assert_eq!(instance.steps[0].cursor, Some(4));
}

// =============================================================================
// Full pipeline: ingress message -> orchestrator -> control plane
// =============================================================================

struct Pipeline {
    stores: Stores,
    instances: Arc<InMemoryInstanceStore>,
    engine: Arc<Engine>,
    control: Arc<ControlPlane>,
    consumer: Consumer,
}

impl Pipeline {
    fn new() -> Self {
        let stores = Stores::new();
        let instances = Arc::new(InMemoryInstanceStore::new());
        let registry = WorkflowRegistry::new().register(Arc::new(ArchiveWorkflow::new(5)));
        let engine = Arc::new(Engine::new(
            engine_config(),
            registry,
            stores.jobs.clone(),
            instances.clone(),
            stores.ledger.clone(),
            stores.blobs.clone(),
        ));
        let control = Arc::new(ControlPlane::new(
            stores.jobs.clone(),
            instances.clone(),
            engine.clone(),
            Arc::new(InMemoryAuditLog::new(100)),
        ));
        let router = HandlerRouter::new()
            .route(
                MessageBody::START_JOB,
                Arc::new(StartJobHandler::new(stores.jobs.clone(), engine.clone())),
            )
            .route(MessageBody::CONTROL_JOB, Arc::new(ControlHandler::new(control.clone())));
        let consumer = stores.consumer(Arc::new(router));
        Self {
            stores,
            instances,
            engine,
            control,
            consumer,
        }
    }

    async fn send(&self, body: MessageBody, subject: &str) {
        let envelope = Envelope::new(&body, subject).unwrap();
        self.stores.queue.publish(&envelope).await.unwrap();
        drain(&self.consumer, &self.stores.queue).await;
    }

    async fn control(&self, job_id: &JobId, action: ControlAction, request_id: &str) {
        let body = MessageBody::ControlJob(ControlJob {
            job_id: job_id.clone(),
            action,
            request_id: request_id.to_string(),
            reason: None,
            requested_by: Some("ops".to_string()),
        });
        self.send(body, job_id.as_str()).await;
    }
}

fn start_archive(job_id: &JobId, parameters: Value) -> MessageBody {
    MessageBody::StartJob(StartJob {
        job_id: job_id.clone(),
        job_type: "archive".to_string(),
        parameters,
        total_units: 25,
        shards: 2,
    })
}

#[tokio::test]
async fn test_start_job_runs_sharded_workflow_to_completion() {
    let pipeline = Pipeline::new();
    let job_id = JobId::from_string("job-archive");

    pipeline
        .send(start_archive(&job_id, json!({ "fail_units": [3] })), "job-archive")
        .await;
    // A duplicate start is absorbed by the ledger.
    pipeline.send(start_archive(&job_id, json!({ "fail_units": [3] })), "job-archive").await;
    pipeline.engine.join_all().await;

    let view = pipeline.stores.jobs.get_status(&job_id).await.unwrap().unwrap();
    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(view.processed_units, 25);
    assert_eq!(view.succeeded_units, 24);
    assert_eq!(view.failed_units, 1);
    assert!(view.result_pointer.is_some());

    // Three batches per shard plus one manifest each.
    assert_eq!(pipeline.stores.blobs.len().await, 8);
    let instances = pipeline.instances.list_by_job(&job_id).await.unwrap();
    assert_eq!(instances.len(), 2);
    assert!(instances.iter().all(|i| i.status == InstanceStatus::Completed));
}

#[tokio::test]
async fn test_unknown_job_type_is_rejected() {
    let pipeline = Pipeline::new();
    let body = MessageBody::StartJob(StartJob {
        job_id: JobId::from_string("job-x"),
        job_type: "transcode".to_string(),
        parameters: Value::Null,
        total_units: 1,
        shards: 1,
    });
    pipeline.send(body, "job-x").await;

    let dead = pipeline.stores.queue.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].error_class, ErrorClass::Validation);
    assert!(pipeline.stores.jobs.get(&JobId::from_string("job-x")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_pause_resume_then_noop_on_finished_job() {
    let pipeline = Pipeline::new();
    let job_id = JobId::from_string("job-paused");
    pipeline
        .stores
        .jobs
        .create(
            JobRecord::new(job_id.clone(), "archive")
                .with_total_units(10)
                .with_instance_count(1),
        )
        .await
        .unwrap();
    let instance_id = pipeline
        .engine
        .register_instance(&job_id, 0, 1, Value::Null)
        .await
        .unwrap();

    pipeline.control(&job_id, ControlAction::Pause, "r-1").await;
    let job = pipeline.stores.jobs.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Paused);
    let instance = pipeline.instances.get(&instance_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Paused);

    pipeline.control(&job_id, ControlAction::Resume, "r-2").await;
    pipeline.engine.join_all().await;
    let job = pipeline.stores.jobs.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.processed_units, 10);

    // Terminal is final: a later cancel is acknowledged and audited as a no-op.
    pipeline.control(&job_id, ControlAction::Cancel, "r-3").await;
    let job = pipeline.stores.jobs.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(!job.cancel_requested);

    let history = pipeline.control.history(&job_id).await.unwrap();
    let outcomes: Vec<&str> = history.iter().map(|e| e.outcome.as_str()).collect();
    assert_eq!(outcomes, vec!["applied", "applied", "noop:terminal"]);
    assert_eq!(history[0].requested_by.as_deref(), Some("ops"));
    assert_eq!(history[0].instances, vec![instance_id.to_string()]);
}

#[tokio::test]
async fn test_cancel_before_instances_exist_finalizes_job() {
    let pipeline = Pipeline::new();
    let job_id = JobId::from_string("job-early-cancel");
    pipeline
        .stores
        .jobs
        .create(JobRecord::new(job_id.clone(), "archive").with_instance_count(2))
        .await
        .unwrap();

    pipeline.control(&job_id, ControlAction::Cancel, "r-1").await;

    let job = pipeline.stores.jobs.get(&job_id).await.unwrap().unwrap();
    assert!(job.cancel_requested);
    assert_eq!(job.status, JobStatus::Cancelled);
}
