// rust/boost-runtime/src/orchestrator.rs

//! Round-based driver of a distributed training run.
//!
//! A run is split into segments at checkpoint boundaries. Each segment gets
//! a fresh tracker and one distributed job; the tracker's return code decides
//! whether the segment's model is accepted.
//!
//! # Round lifecycle
//!
//! ```text
//! Idle -> TrackerStarting -> JobRunning -> Joining -> RoundComplete
//!              ^                                          |
//!              +------------------------------------------+
//!                                                         v
//!                                                        Done
//! ```
//!
//! Any non-terminal state can move to `Failed`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel;
use crossbeam::select;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointManager;
use crate::config::{validate_eval_names, TrainingConfig};
use crate::data::{
    aggregate_groups, co_partition, co_partition_groups, filter_missing, LabeledPoint,
    PartitionShard, ShardData,
};
use crate::engine::{
    CancelFlag, ClusterEngine, LocalCluster, PartitionTask, Partitioned, WorkerContext,
    WorkerOutput,
};
use crate::error::{BoostError, Result};
use crate::native::{
    Booster, EvalFunction, MatrixSource, MemoryBackend, NativeBackend, ObjectiveFunction,
    TrainRequest,
};
use crate::tracker::{
    SocketTrackerFactory, TrackerFactory, TrackerGuard, CODE_STOPPED, CODE_SUCCESS, ENV_TASK_ID,
};
use crate::watches::{Watches, WatchesBuilder};

/// Phase of the current training round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    Idle,
    TrackerStarting,
    JobRunning,
    Joining,
    RoundComplete,
    Done,
    Failed,
}

impl RoundState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::TrackerStarting => "tracker-starting",
            Self::JobRunning => "job-running",
            Self::Joining => "joining",
            Self::RoundComplete => "round-complete",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Enforces the legal order of round phases.
#[derive(Debug)]
pub struct RoundStateMachine {
    state: RoundState,
}

impl Default for RoundStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundStateMachine {
    pub fn new() -> Self {
        Self {
            state: RoundState::Idle,
        }
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    /// Moves to `next`, rejecting transitions outside the round lifecycle.
    pub fn advance(&mut self, next: RoundState) -> Result<()> {
        use RoundState::*;

        let legal = match (self.state, next) {
            (Idle | RoundComplete, TrackerStarting) => true,
            (TrackerStarting, JobRunning) => true,
            (JobRunning, Joining) => true,
            (Joining, RoundComplete) => true,
            (Idle | RoundComplete, Done) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        };
        if !legal {
            return Err(BoostError::internal(format!(
                "illegal round transition {} -> {}",
                self.state, next
            )));
        }

        debug!("Round state {} -> {}", self.state, next);
        self.state = next;
        Ok(())
    }

    /// Marks the run failed unless it already finished.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = RoundState::Failed;
        }
    }
}

/// Input of a training run: the training set and named eval sets.
#[derive(Debug, Clone)]
pub struct TrainingData {
    pub train: Partitioned<LabeledPoint>,
    pub evals: Vec<(String, Partitioned<LabeledPoint>)>,
}

impl TrainingData {
    pub fn new(train: Partitioned<LabeledPoint>) -> Self {
        Self {
            train,
            evals: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_eval(mut self, name: impl Into<String>, data: Partitioned<LabeledPoint>) -> Self {
        self.evals.push((name.into(), data));
        self
    }
}

/// Final model of a run plus per-dataset metrics of every round, including
/// rounds restored from a checkpoint.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub booster: Booster,
    pub metrics: BTreeMap<String, Vec<f32>>,
    /// Total completed rounds of `booster`.
    pub rounds: u32,
}

// Everything a worker task needs besides its shard.
struct WorkerSettings {
    params: BTreeMap<String, String>,
    missing: f32,
    train_test_ratio: f64,
    seed: u64,
    use_external_memory: bool,
    cache_dir: Option<PathBuf>,
    early_stopping_rounds: u32,
    objective: Option<Arc<dyn ObjectiveFunction>>,
    eval: Option<Arc<dyn EvalFunction>>,
}

/// Drives training rounds over a cluster engine, a native backend and a
/// per-round tracker.
pub struct Orchestrator {
    config: TrainingConfig,
    engine: Arc<dyn ClusterEngine>,
    backend: Arc<dyn NativeBackend>,
    trackers: Arc<dyn TrackerFactory>,
    checkpoints: Option<CheckpointManager>,
    objective: Option<Arc<dyn ObjectiveFunction>>,
    eval: Option<Arc<dyn EvalFunction>>,
}

impl Orchestrator {
    /// Validates `config` and sets up checkpointing if it is configured.
    pub fn new(
        config: TrainingConfig,
        engine: Arc<dyn ClusterEngine>,
        backend: Arc<dyn NativeBackend>,
        trackers: Arc<dyn TrackerFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let checkpoints = CheckpointManager::from_config(&config)?;
        Ok(Self {
            config,
            engine,
            backend,
            trackers,
            checkpoints,
            objective: None,
            eval: None,
        })
    }

    /// In-process setup: threads for workers, the memory backend, and a
    /// socket tracker per round.
    pub fn local(config: TrainingConfig) -> Result<Self> {
        let trackers = Arc::new(SocketTrackerFactory::new(config.tracker.clone()));
        Self::new(
            config,
            Arc::new(LocalCluster::new()),
            Arc::new(MemoryBackend::new()),
            trackers,
        )
    }

    #[must_use]
    pub fn with_checkpoint_manager(mut self, manager: CheckpointManager) -> Self {
        self.checkpoints = Some(manager);
        self
    }

    #[must_use]
    pub fn with_objective(mut self, objective: Arc<dyn ObjectiveFunction>) -> Self {
        self.objective = Some(objective);
        self
    }

    #[must_use]
    pub fn with_eval(mut self, eval: Arc<dyn EvalFunction>) -> Self {
        self.eval = Some(eval);
        self
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Trains for `training.num_rounds` rounds, resuming from the latest
    /// checkpoint when one exists.
    ///
    /// # Errors
    ///
    /// Any failing round fails the whole run; no checkpoint is written for
    /// the round that failed.
    pub fn train(&self, data: TrainingData) -> Result<TrainingOutcome> {
        let mut machine = RoundStateMachine::new();
        let result = self.run(data, &mut machine);
        if let Err(e) = &result {
            error!("Training failed while {}: {}", machine.state(), e);
            machine.fail();
        }
        result
    }

    fn run(&self, data: TrainingData, machine: &mut RoundStateMachine) -> Result<TrainingOutcome> {
        validate_eval_names(data.evals.iter().map(|(name, _)| name.as_str()))?;
        let total = self.config.training.num_rounds;
        let shards = self.prepare_shards(data)?;
        let settings = Arc::new(self.worker_settings());

        let (resumed, boundaries) = match &self.checkpoints {
            Some(manager) => {
                manager.clean_up_higher_versions(total.saturating_sub(1))?;
                let resumed = manager.load_latest_as_model()?;
                let boundaries =
                    manager.round_boundaries(self.config.checkpoint.interval, total)?;
                (resumed, boundaries)
            }
            None => (None, vec![total]),
        };

        let mut completed = resumed.as_ref().map_or(0, |m| m.round);
        let (mut booster, mut metrics) = match resumed {
            Some(model) => (Some(model.booster), model.metrics),
            None => (None, BTreeMap::new()),
        };
        if completed > 0 {
            info!("Resuming from checkpoint at round {}", completed);
        }

        for boundary in boundaries {
            if boundary <= completed {
                continue;
            }
            let rounds = boundary - completed;
            info!(
                "Training rounds {}..{} on {} workers",
                completed, boundary, self.config.training.num_workers
            );

            let output =
                self.run_segment(machine, &shards, &settings, booster.as_ref(), rounds, boundary)?;
            for (name, values) in output.metrics {
                metrics.entry(name).or_default().extend(values);
            }

            if boundary < total {
                if let Some(manager) = &self.checkpoints {
                    manager.update_checkpoint_with_metrics(
                        &output.booster,
                        boundary,
                        &metrics,
                    )?;
                }
            }
            booster = Some(output.booster);
            completed = boundary;
        }

        machine.advance(RoundState::Done)?;
        let booster = booster
            .ok_or_else(|| BoostError::internal("run finished without training a model"))?;

        if let Some(manager) = &self.checkpoints {
            if !self.config.checkpoint.skip_clean_checkpoint {
                if let Err(e) = manager.clean_path() {
                    warn!("Failed to clean checkpoint directory: {}", e);
                }
            }
        }

        info!("Training finished after {} rounds", completed);
        Ok(TrainingOutcome {
            booster,
            metrics,
            rounds: completed,
        })
    }

    fn worker_settings(&self) -> WorkerSettings {
        let training = &self.config.training;
        let mut params = training.params.clone();
        params
            .entry("objective".to_string())
            .or_insert_with(|| training.objective.clone());

        WorkerSettings {
            params,
            missing: training.missing,
            train_test_ratio: training.train_test_ratio,
            seed: training.seed,
            use_external_memory: training.use_external_memory,
            cache_dir: training.cache_dir.clone(),
            early_stopping_rounds: training.early_stopping_rounds,
            objective: self.objective.clone(),
            eval: self.eval.clone(),
        }
    }

    /// Filters, groups (for ranking) and co-partitions the input into one
    /// shard per worker.
    fn prepare_shards(&self, data: TrainingData) -> Result<Vec<PartitionShard>> {
        let training = &self.config.training;
        let train = strip_missing(data.train, training.missing)?;
        let evals = data
            .evals
            .into_iter()
            .map(|(name, set)| Ok((name, strip_missing(set, training.missing)?)))
            .collect::<Result<Vec<_>>>()?;

        let shards = if training.is_ranking() {
            let evals = evals
                .into_iter()
                .map(|(name, set)| (name, aggregate_groups(set)))
                .collect();
            co_partition_groups(aggregate_groups(train), evals, training.num_workers)?
        } else {
            co_partition(train, evals, training.num_workers)?
        };

        Ok(shards.into_partitions().into_iter().flatten().collect())
    }

    /// Runs one tracker-guarded distributed job of `rounds` rounds.
    fn run_segment(
        &self,
        machine: &mut RoundStateMachine,
        shards: &[PartitionShard],
        settings: &Arc<WorkerSettings>,
        previous: Option<&Booster>,
        rounds: u32,
        boundary: u32,
    ) -> Result<WorkerOutput> {
        machine.advance(RoundState::TrackerStarting)?;
        let tracker = TrackerGuard::new(self.trackers.create(shards.len())?);
        let start_timeout = self.config.tracker.start_timeout();
        if !tracker.start(start_timeout)? {
            return Err(BoostError::tracker(format!(
                "tracker did not become ready within {start_timeout:?}"
            )));
        }
        let env = tracker.worker_env();

        machine.advance(RoundState::JobRunning)?;
        let cancel = CancelFlag::new();
        let tasks: Vec<PartitionTask> = shards
            .iter()
            .map(|shard| {
                let mut env = env.clone();
                env.insert(ENV_TASK_ID.to_string(), shard.partition.to_string());
                let context = WorkerContext {
                    partition: shard.partition,
                    env,
                    rounds,
                    cancel: cancel.clone(),
                };
                worker_task(
                    shard.clone(),
                    context,
                    Arc::clone(&self.backend),
                    Arc::clone(settings),
                    previous.cloned(),
                )
            })
            .collect();

        let (job_tx, job_rx) = channel::bounded(1);
        let engine = Arc::clone(&self.engine);
        let job_cancel = cancel.clone();
        let job = thread::Builder::new()
            .name(format!("dbr-job-{boundary}"))
            .spawn(move || {
                let _ = job_tx.send(engine.run_job(tasks, &job_cancel));
            });
        let job = cancel_on_spawn_error(job, &cancel, "job")?;

        machine.advance(RoundState::Joining)?;
        let (code_tx, code_rx) = channel::bounded(1);
        let handle = tracker.handle();
        let wait_timeout = self.config.tracker.wait_timeout();
        let waiter = thread::Builder::new()
            .name(format!("dbr-tracker-wait-{boundary}"))
            .spawn(move || {
                let _ = code_tx.send(handle.wait_for(wait_timeout));
            });
        let waiter = cancel_on_spawn_error(waiter, &cancel, "tracker wait")?;

        let lost_job = || BoostError::internal("job thread exited without a result");
        let first = select! {
            recv(code_rx) -> code => Finished::Tracker(code.unwrap_or(CODE_STOPPED)),
            recv(job_rx) -> result => Finished::Job(result.unwrap_or_else(|_| Err(lost_job()))),
        };
        let (code, finished) = match first {
            Finished::Tracker(code) => (code, None),
            Finished::Job(Ok(outputs)) => (code_rx.recv().unwrap_or(CODE_STOPPED), Some(outputs)),
            Finished::Job(Err(e)) => {
                warn!("Distributed job failed before the tracker returned: {}", e);
                cancel.cancel();
                tracker.stop();
                return Err(e);
            }
        };

        if code != CODE_SUCCESS {
            if finished.is_none() {
                // The job thread is left to wind down on its own.
                cancel.cancel();
                warn!("Tracker returned {}; cancelled the running job", code);
            }
            return Err(BoostError::TrackerExit {
                code,
                round: boundary,
            });
        }

        let outputs = match finished {
            Some(outputs) => outputs,
            None => job_rx.recv().unwrap_or_else(|_| Err(lost_job()))?,
        };
        join_quietly(job, "job");
        join_quietly(waiter, "tracker wait");

        machine.advance(RoundState::RoundComplete)?;
        select_representative(
            outputs,
            shards.len(),
            boundary,
            self.config.training.verify_worker_consistency,
        )
    }
}

// Whichever of the two round threads reported first.
enum Finished {
    Tracker(i32),
    Job(Result<Vec<WorkerOutput>>),
}

fn strip_missing(set: Partitioned<LabeledPoint>, missing: f32) -> Result<Partitioned<LabeledPoint>> {
    set.try_map_partitions(|_, rows| filter_missing(rows, missing).collect())
}

fn join_quietly(handle: JoinHandle<()>, name: &str) {
    if handle.join().is_err() {
        warn!("{} thread panicked", name);
    }
}

/// Picks the lowest partition's output and, with `verify`, checks that
/// every other worker produced the same model.
fn select_representative(
    mut outputs: Vec<WorkerOutput>,
    expected: usize,
    round: u32,
    verify: bool,
) -> Result<WorkerOutput> {
    if outputs.len() != expected {
        return Err(BoostError::internal(format!(
            "expected {expected} worker results, got {}",
            outputs.len()
        )));
    }
    outputs.sort_by_key(|o| o.partition);

    let mut outputs = outputs.into_iter();
    let representative = outputs
        .next()
        .ok_or_else(|| BoostError::internal("distributed job returned no results"))?;

    if verify {
        let fingerprint = representative.booster.fingerprint();
        for other in outputs {
            let theirs = other.booster.fingerprint();
            if theirs != fingerprint {
                return Err(BoostError::Inconsistent {
                    round,
                    message: format!(
                        "partition {} produced model {:016x}, partition {} produced {:016x}",
                        representative.partition, fingerprint, other.partition, theirs
                    ),
                });
            }
        }
    }

    Ok(representative)
}

/// Raises `cancel` when a thread could not be spawned, so tasks already
/// launched stop before joining the collective.
fn cancel_on_spawn_error<T>(
    spawned: std::io::Result<T>,
    cancel: &CancelFlag,
    what: &str,
) -> Result<T> {
    spawned.map_err(|e| {
        cancel.cancel();
        BoostError::internal(format!("failed to spawn {what} thread: {e}"))
    })
}

fn worker_task(
    shard: PartitionShard,
    context: WorkerContext,
    backend: Arc<dyn NativeBackend>,
    settings: Arc<WorkerSettings>,
    previous: Option<Booster>,
) -> PartitionTask {
    Box::new(move || {
        run_worker(
            shard,
            &context,
            backend.as_ref(),
            &settings,
            previous.as_ref(),
        )
    })
}

/// One partition's share of a round. The watches are released on every path.
fn run_worker(
    shard: PartitionShard,
    context: &WorkerContext,
    backend: &dyn NativeBackend,
    settings: &WorkerSettings,
    previous: Option<&Booster>,
) -> Result<WorkerOutput> {
    let shard = shard.into_validated()?;
    let watches = build_watches(shard, backend, settings)?;
    debug!("Partition {} built {}", context.partition, watches);

    let result = train_partition(&watches, context, backend, settings, previous);
    watches.delete();
    result
}

fn build_watches(
    shard: PartitionShard,
    backend: &dyn NativeBackend,
    settings: &WorkerSettings,
) -> Result<Watches> {
    let partition = shard.partition;
    let mut builder = WatchesBuilder::new(backend, partition).with_missing(settings.missing);
    if settings.use_external_memory {
        builder = builder.with_external_memory(settings.cache_dir.clone());
    }

    let mut datasets = shard.datasets;
    if datasets.len() > 1 {
        let sources = datasets
            .into_iter()
            .map(|(name, data)| (name, into_source(data)))
            .collect();
        return builder.build_from_sources(sources);
    }

    match datasets.pop() {
        Some((_, ShardData::Points(points))) => {
            builder.build_with_split(points, settings.train_test_ratio, settings.seed)
        }
        Some((_, ShardData::Groups(groups))) => {
            builder.build_grouped_with_split(groups, settings.train_test_ratio, settings.seed)
        }
        None => Err(BoostError::partition(partition, "shard carries no training data")),
    }
}

fn into_source(data: ShardData) -> MatrixSource {
    match data {
        ShardData::Points(points) => MatrixSource::Rows(points),
        ShardData::Groups(groups) => MatrixSource::Groups(groups),
    }
}

fn train_partition(
    watches: &Watches,
    context: &WorkerContext,
    backend: &dyn NativeBackend,
    settings: &WorkerSettings,
    previous: Option<&Booster>,
) -> Result<WorkerOutput> {
    let partition = context.partition;
    let dtrain = watches.train().ok_or_else(|| {
        BoostError::partition(partition, "the training matrix has no rows")
    })?;

    if context.cancel.is_cancelled() {
        return Err(BoostError::Cancelled { partition });
    }
    let session = backend.open_collective(&context.env)?;
    debug!(
        "Partition {} joined the collective as rank {} of {}",
        partition,
        session.rank(),
        session.world_size()
    );

    let watch_list = watches.watch_list();
    let names: Vec<String> = watch_list.iter().map(|(name, _)| name.to_string()).collect();
    let output = backend.train(TrainRequest {
        dtrain,
        params: &settings.params,
        rounds: context.rounds,
        watches: watch_list,
        objective: settings.objective.as_deref(),
        eval: settings.eval.as_deref(),
        early_stopping_rounds: settings.early_stopping_rounds,
        previous,
        env: &context.env,
    })?;
    session.shutdown()?;

    if output.metrics.len() != names.len() {
        return Err(BoostError::native(format!(
            "training returned {} metric series for {} watches",
            output.metrics.len(),
            names.len()
        )));
    }

    Ok(WorkerOutput {
        partition,
        booster: output.booster,
        metrics: names.into_iter().zip(output.metrics).collect(),
    })
}
