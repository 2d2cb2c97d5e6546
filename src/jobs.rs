use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use moka::sync::Cache;
use tracing::{debug, info, warn};

use crate::bracket::BracketTree;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::scoring::ScoringMode;
use crate::simulate::{run_simulation, SimulationOptions, WinModel};
use crate::store::{NodeStore, PickStore};
use crate::types::{
    SimulationRequest, SimulationResult, MAX_SIMULATION_RUNS, MIN_SIMULATION_RUNS, MODEL_VERSION,
};

// ── Cache key ───────────────────────────────────────────────────────────

/// Identity of a simulation output. Two requests with the same key get the
/// same cached result until the TTL lapses or the live bracket changes
/// enough to bump `MODEL_VERSION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SimCacheKey {
    tournament_id: u64,
    entry_id: u64,
    run_count: u32,
    mode: ScoringMode,
    model_version: u32,
}

impl SimCacheKey {
    fn for_request(request: &SimulationRequest) -> Self {
        SimCacheKey {
            tournament_id: request.tournament_id,
            entry_id: request.entry_id,
            run_count: request.run_count,
            mode: request.mode,
            model_version: MODEL_VERSION,
        }
    }
}

// ── Job handle ──────────────────────────────────────────────────────────

#[derive(Debug)]
enum JobState {
    Running,
    Done(Arc<SimulationResult>),
    Failed(EngineError),
}

#[derive(Debug)]
struct JobShared {
    /// Basis points (0..=10_000) so readers never touch a lock.
    progress: AtomicU32,
    cancel: AtomicBool,
    state: Mutex<JobState>,
    done: Condvar,
}

impl JobShared {
    fn new() -> Arc<Self> {
        Arc::new(JobShared {
            progress: AtomicU32::new(0),
            cancel: AtomicBool::new(false),
            state: Mutex::new(JobState::Running),
            done: Condvar::new(),
        })
    }

    fn finish(&self, outcome: Result<Arc<SimulationResult>, EngineError>) {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *state = match outcome {
            Ok(result) => JobState::Done(result),
            Err(err) => JobState::Failed(err),
        };
        self.done.notify_all();
    }
}

/// Caller-side view of a queued or running simulation. Cloneable; every
/// clone observes the same job.
#[derive(Clone, Debug)]
pub struct JobHandle {
    shared: Arc<JobShared>,
}

impl JobHandle {
    /// Completed-run fraction in `0.0..=1.0`, coarse-grained.
    pub fn progress(&self) -> f64 {
        f64::from(self.shared.progress.load(Ordering::Relaxed)) / 10_000.0
    }

    /// Ask the job to stop after its current run. Fractions in the result
    /// are computed over the runs that finished.
    pub fn cancel(&self) {
        self.shared.cancel.store(true, Ordering::Relaxed);
    }

    /// Block until the job finishes.
    pub fn wait(&self) -> Result<Arc<SimulationResult>, EngineError> {
        let mut state = self
            .shared
            .state
            .lock()
            .map_err(|e| EngineError::PersistenceFailure(e.to_string()))?;
        loop {
            match &*state {
                JobState::Running => {
                    state = self
                        .shared
                        .done
                        .wait(state)
                        .map_err(|e| EngineError::PersistenceFailure(e.to_string()))?;
                }
                JobState::Done(result) => return Ok(Arc::clone(result)),
                JobState::Failed(err) => return Err(err.clone()),
            }
        }
    }
}

/// What `submit` got you: an already-cached result, or a handle to a job
/// that is queued or running (possibly someone else's identical job).
#[derive(Debug)]
pub enum SubmitOutcome {
    Cached(Arc<SimulationResult>),
    Pending(JobHandle),
}

struct QueuedJob {
    request: SimulationRequest,
    key: Option<SimCacheKey>,
    shared: Arc<JobShared>,
}

// ── Service ─────────────────────────────────────────────────────────────

struct WorkerCtx {
    nodes: Arc<dyn NodeStore>,
    picks: Arc<dyn PickStore>,
    model: Arc<dyn WinModel>,
    cache: Cache<SimCacheKey, Arc<SimulationResult>>,
    inflight: Arc<Mutex<HashMap<SimCacheKey, Arc<JobShared>>>>,
    computed: Arc<AtomicU64>,
    sim_threads: usize,
}

/// Bounded worker pool over a channel, fronted by a TTL cache and an
/// in-flight map. A second request for a running key joins the live job
/// instead of queueing a duplicate.
pub struct SimulationService {
    cache: Cache<SimCacheKey, Arc<SimulationResult>>,
    inflight: Arc<Mutex<HashMap<SimCacheKey, Arc<JobShared>>>>,
    tx: Mutex<Option<Sender<QueuedJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    computed: Arc<AtomicU64>,
}

impl SimulationService {
    pub fn new(
        config: &EngineConfig,
        nodes: Arc<dyn NodeStore>,
        picks: Arc<dyn PickStore>,
        model: Arc<dyn WinModel>,
    ) -> Self {
        let cache: Cache<SimCacheKey, Arc<SimulationResult>> = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_secs(config.cache_ttl_secs))
            .build();
        let inflight: Arc<Mutex<HashMap<SimCacheKey, Arc<JobShared>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let computed = Arc::new(AtomicU64::new(0));
        let (tx, rx): (Sender<QueuedJob>, Receiver<QueuedJob>) = unbounded();

        let mut workers = Vec::with_capacity(config.job_concurrency);
        for index in 0..config.job_concurrency.max(1) {
            let rx = rx.clone();
            let ctx = WorkerCtx {
                nodes: Arc::clone(&nodes),
                picks: Arc::clone(&picks),
                model: Arc::clone(&model),
                cache: cache.clone(),
                inflight: Arc::clone(&inflight),
                computed: Arc::clone(&computed),
                sim_threads: config.sim_threads.max(1),
            };
            let handle = thread::Builder::new()
                .name(format!("sim-worker-{index}"))
                .spawn(move || worker_loop(&ctx, &rx));
            match handle {
                Ok(handle) => workers.push(handle),
                Err(e) => warn!("failed to spawn simulation worker: {e}"),
            }
        }

        SimulationService {
            cache,
            inflight,
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            computed,
        }
    }

    /// Queue a simulation, or short-circuit to a cached or in-flight one.
    /// Validation happens here so a bad request never occupies a worker.
    pub fn submit(&self, request: SimulationRequest) -> Result<SubmitOutcome, EngineError> {
        if request.run_count < MIN_SIMULATION_RUNS || request.run_count > MAX_SIMULATION_RUNS {
            return Err(EngineError::SimulationRequestInvalid(format!(
                "run count {} outside {}..={}",
                request.run_count, MIN_SIMULATION_RUNS, MAX_SIMULATION_RUNS
            )));
        }

        // Fixed-seed requests are reproducibility tooling: they bypass the
        // cache and the in-flight map entirely.
        let key = if request.seed.is_none() {
            Some(SimCacheKey::for_request(&request))
        } else {
            None
        };

        if let Some(key) = key {
            if let Some(hit) = self.cache.get(&key) {
                debug!(
                    tournament_id = request.tournament_id,
                    entry_id = request.entry_id,
                    "simulation cache hit"
                );
                return Ok(SubmitOutcome::Cached(hit));
            }
            let mut inflight = self
                .inflight
                .lock()
                .map_err(|e| EngineError::PersistenceFailure(e.to_string()))?;
            if let Some(existing) = inflight.get(&key) {
                debug!(
                    tournament_id = request.tournament_id,
                    entry_id = request.entry_id,
                    "joining in-flight simulation"
                );
                return Ok(SubmitOutcome::Pending(JobHandle { shared: Arc::clone(existing) }));
            }
            let shared = JobShared::new();
            inflight.insert(key, Arc::clone(&shared));
            drop(inflight);
            self.enqueue(QueuedJob { request, key: Some(key), shared: Arc::clone(&shared) })
                .inspect_err(|_| {
                    if let Ok(mut inflight) = self.inflight.lock() {
                        inflight.remove(&key);
                    }
                })?;
            return Ok(SubmitOutcome::Pending(JobHandle { shared }));
        }

        let shared = JobShared::new();
        self.enqueue(QueuedJob { request, key: None, shared: Arc::clone(&shared) })?;
        Ok(SubmitOutcome::Pending(JobHandle { shared }))
    }

    fn enqueue(&self, job: QueuedJob) -> Result<(), EngineError> {
        let guard = self
            .tx
            .lock()
            .map_err(|e| EngineError::PersistenceFailure(e.to_string()))?;
        match guard.as_ref() {
            Some(tx) => tx.send(job).map_err(|_| EngineError::QueueClosed),
            None => Err(EngineError::QueueClosed),
        }
    }

    /// Drop all cached results. Called when live advancement changes the
    /// tree out from under cached projections.
    pub fn flush_cache(&self) {
        self.cache.invalidate_all();
    }

    /// Number of simulations actually computed (cache and in-flight hits
    /// excluded).
    pub fn computed(&self) -> u64 {
        self.computed.load(Ordering::Relaxed)
    }

    /// Close the queue and join the workers. Queued jobs finish first.
    pub fn shutdown(&self) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
        if let Ok(mut workers) = self.workers.lock() {
            for handle in workers.drain(..) {
                if handle.join().is_err() {
                    warn!("simulation worker panicked during shutdown");
                }
            }
        }
        info!("simulation service stopped");
    }
}

impl Drop for SimulationService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(ctx: &WorkerCtx, rx: &Receiver<QueuedJob>) {
    for job in rx.iter() {
        let outcome = compute(ctx, &job);
        if let Some(key) = job.key {
            let mut inflight =
                ctx.inflight.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            inflight.remove(&key);
        }
        match outcome {
            Ok(result) => {
                let result = Arc::new(result);
                if let Some(key) = job.key {
                    ctx.cache.insert(key, Arc::clone(&result));
                }
                ctx.computed.fetch_add(1, Ordering::Relaxed);
                job.shared.finish(Ok(result));
            }
            Err(err) => {
                warn!(
                    tournament_id = job.request.tournament_id,
                    entry_id = job.request.entry_id,
                    "simulation failed: {err}"
                );
                job.shared.finish(Err(err));
            }
        }
    }
}

fn compute(ctx: &WorkerCtx, job: &QueuedJob) -> Result<SimulationResult, EngineError> {
    let request = &job.request;
    let nodes = ctx.nodes.nodes_for_tournament(request.tournament_id)?;
    if nodes.is_empty() {
        return Err(EngineError::MalformedBracket(format!(
            "tournament {} has no bracket",
            request.tournament_id
        )));
    }
    let tree = BracketTree::build(nodes)?;
    let picks = ctx.picks.picks_for_entry(request.entry_id)?;
    let options = SimulationOptions {
        run_count: request.run_count,
        seed: request.seed,
        workers: ctx.sim_threads,
    };
    let shared = &job.shared;
    let progress = |fraction: f64| {
        shared
            .progress
            .store((fraction * 10_000.0).round() as u32, Ordering::Relaxed);
    };
    run_simulation(
        &tree,
        request.entry_id,
        &picks,
        request.mode,
        &options,
        ctx.model.as_ref(),
        &shared.cancel,
        &progress,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bracket::seed_bracket;
    use crate::simulate::{SeedWeightModel, TeamRef};
    use crate::store::MemoryStore;
    use crate::types::{FieldTeam, Pick};

    fn request(entry_id: u64, run_count: u32) -> SimulationRequest {
        SimulationRequest {
            user_id: 1,
            entry_id,
            tournament_id: 1,
            run_count,
            mode: ScoringMode::Classic,
            seed: None,
        }
    }

    fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let teams: Vec<FieldTeam> = ["A", "B", "C", "D"]
            .iter()
            .enumerate()
            .map(|(idx, name)| FieldTeam {
                name: name.to_string(),
                seed: Some(idx as u32 + 1),
                region: None,
            })
            .collect();
        let nodes = seed_bracket(1, &teams).unwrap();
        let championship = nodes.iter().find(|node| node.round == 2).unwrap().id;
        store.insert_nodes(&nodes).unwrap();
        store.upsert_pick(Pick::new(10, championship, "A")).unwrap();
        store
    }

    fn service(store: &Arc<MemoryStore>, model: Arc<dyn WinModel>) -> SimulationService {
        let config = EngineConfig {
            job_concurrency: 1,
            sim_threads: 1,
            cache_ttl_secs: 60,
            ..EngineConfig::default()
        };
        SimulationService::new(
            &config,
            Arc::clone(store) as Arc<dyn NodeStore>,
            Arc::clone(store) as Arc<dyn PickStore>,
            model,
        )
    }

    #[test]
    fn second_identical_request_hits_the_cache() {
        let store = seeded_store();
        let service = service(&store, Arc::new(SeedWeightModel::default()));

        let first = match service.submit(request(10, 200)).unwrap() {
            SubmitOutcome::Pending(handle) => handle.wait().unwrap(),
            SubmitOutcome::Cached(_) => panic!("nothing cached yet"),
        };
        let second = match service.submit(request(10, 200)).unwrap() {
            SubmitOutcome::Cached(result) => result,
            SubmitOutcome::Pending(_) => panic!("expected a cache hit"),
        };
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(service.computed(), 1);
        service.shutdown();
    }

    #[test]
    fn concurrent_identical_requests_share_one_job() {
        struct GateModel {
            gate: Arc<Mutex<()>>,
        }
        impl WinModel for GateModel {
            fn home_win_probability(&self, _home: &TeamRef, _away: &TeamRef) -> f64 {
                let _held = self.gate.lock().unwrap();
                0.5
            }
        }

        let gate = Arc::new(Mutex::new(()));
        let store = seeded_store();
        let service = service(&store, Arc::new(GateModel { gate: Arc::clone(&gate) }));

        let first;
        let second;
        {
            // Hold the model's gate so the job stalls on its first game.
            let _held = gate.lock().unwrap();
            first = match service.submit(request(10, 200)).unwrap() {
                SubmitOutcome::Pending(handle) => handle,
                SubmitOutcome::Cached(_) => panic!("nothing cached yet"),
            };
            // Give the worker time to pick the job up.
            thread::sleep(Duration::from_millis(50));
            second = match service.submit(request(10, 200)).unwrap() {
                SubmitOutcome::Pending(handle) => handle,
                SubmitOutcome::Cached(_) => panic!("job should still be running"),
            };
        }
        let a = first.wait().unwrap();
        let b = second.wait().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(service.computed(), 1);
        service.shutdown();
    }

    #[test]
    fn invalid_run_count_never_reaches_the_queue() {
        let store = seeded_store();
        let service = service(&store, Arc::new(SeedWeightModel::default()));
        let err = service.submit(request(10, 5)).unwrap_err();
        assert!(matches!(err, EngineError::SimulationRequestInvalid(_)));
        assert_eq!(service.computed(), 0);
        service.shutdown();
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let store = seeded_store();
        let service = service(&store, Arc::new(SeedWeightModel::default()));
        service.shutdown();
        let err = service.submit(request(10, 200)).unwrap_err();
        assert_eq!(err, EngineError::QueueClosed);
    }

    #[test]
    fn missing_bracket_fails_the_job() {
        let store = Arc::new(MemoryStore::new());
        let service = service(&store, Arc::new(SeedWeightModel::default()));
        let handle = match service.submit(request(10, 200)).unwrap() {
            SubmitOutcome::Pending(handle) => handle,
            SubmitOutcome::Cached(_) => panic!("nothing cached"),
        };
        let err = handle.wait().unwrap_err();
        assert!(matches!(err, EngineError::MalformedBracket(_)));
        service.shutdown();
    }

    #[test]
    fn fixed_seed_requests_bypass_the_cache() {
        let store = seeded_store();
        let service = service(&store, Arc::new(SeedWeightModel::default()));
        let mut seeded = request(10, 200);
        seeded.seed = Some(42);

        for _ in 0..2 {
            match service.submit(seeded.clone()).unwrap() {
                SubmitOutcome::Pending(handle) => {
                    handle.wait().unwrap();
                }
                SubmitOutcome::Cached(_) => panic!("seeded requests must not be cached"),
            }
        }
        assert_eq!(service.computed(), 2);
        service.shutdown();
    }
}
