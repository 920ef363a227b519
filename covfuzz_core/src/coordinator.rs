use crate::config::FuzzerSettings;
use crate::corpus::{CorpusError, CorpusManager};
use crate::coverage::{CoverageError, CoverageMap};
use crate::executor::{CrashInfo, CrashType, Executor};
use crate::mutator::{MutationEngine, Strategy};
use crate::oracle::{CrashOracle, CrashSink, SignatureOracle};
use crate::scheduler::QueueScheduler;
use crate::stats::{FuzzingStats, LogStatsSink, StatsSink, StatsSnapshot};
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("corpus is empty")]
    CorpusEmpty,
    #[error("coordinator cannot start from state {0:?}")]
    InvalidState(CoordinatorState),
    #[error(transparent)]
    Corpus(#[from] CorpusError),
    #[error(transparent)]
    Coverage(#[from] CoverageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MaxIterations,
    /// Neither the queue nor the corpus had anything left to select.
    Exhausted,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub iterations: u64,
    pub stop_reason: StopReason,
    pub stats: StatsSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorOptions {
    pub max_iterations: Option<u64>,
    pub stats_interval: Duration,
    /// Virgin-map checkpoint loaded at construction and saved at cleanup.
    pub coverage_state: Option<PathBuf>,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self::from(&FuzzerSettings::default())
    }
}

impl From<&FuzzerSettings> for CoordinatorOptions {
    fn from(settings: &FuzzerSettings) -> Self {
        Self {
            max_iterations: settings.max_iterations,
            stats_interval: Duration::from_secs(settings.stats_interval_secs),
            coverage_state: settings.coverage_state.clone(),
        }
    }
}

/// What one pass through the loop amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Executed,
    Failed,
    Exhausted,
}

/// Drives the select, mutate, execute and feedback loop of one campaign.
///
/// The coordinator exclusively owns its coverage map, corpus, queue and seen-crash
/// set. Nothing here is shared between coordinators; scaling out means running
/// more coordinators.
pub struct FuzzingCoordinator<E: Executor> {
    state: CoordinatorState,
    options: CoordinatorOptions,
    coverage: CoverageMap,
    scheduler: QueueScheduler,
    engine: MutationEngine,
    corpus: CorpusManager,
    executor: E,
    oracle: Box<dyn CrashOracle>,
    crash_sink: Option<Box<dyn CrashSink>>,
    stats_sink: Box<dyn StatsSink>,
    seen_crashes: HashSet<String>,
    stats: FuzzingStats,
    iterations: u64,
    stop: Arc<AtomicBool>,
    last_stats_emit: Instant,
    cleaned_up: bool,
}

impl<E: Executor> FuzzingCoordinator<E> {
    pub fn new(
        corpus: CorpusManager,
        engine: MutationEngine,
        executor: E,
        options: CoordinatorOptions,
    ) -> Self {
        let coverage = match &options.coverage_state {
            Some(path) => CoverageMap::load_or_new(path),
            None => CoverageMap::new(),
        };
        Self {
            state: CoordinatorState::Idle,
            options,
            coverage,
            scheduler: QueueScheduler::new(),
            engine,
            corpus,
            executor,
            oracle: Box::new(SignatureOracle::new()),
            crash_sink: None,
            stats_sink: Box::new(LogStatsSink),
            seen_crashes: HashSet::new(),
            stats: FuzzingStats::new(),
            iterations: 0,
            stop: Arc::new(AtomicBool::new(false)),
            last_stats_emit: Instant::now(),
            cleaned_up: false,
        }
    }

    pub fn with_oracle(mut self, oracle: Box<dyn CrashOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    pub fn with_crash_sink(mut self, sink: Box<dyn CrashSink>) -> Self {
        self.crash_sink = Some(sink);
        self
    }

    pub fn with_stats_sink(mut self, sink: Box<dyn StatsSink>) -> Self {
        self.stats_sink = sink;
        self
    }

    /// Flag checked once per iteration; setting it ends the run after the
    /// iteration in flight.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn stats(&self) -> &FuzzingStats {
        &self.stats
    }

    pub fn corpus(&self) -> &CorpusManager {
        &self.corpus
    }

    pub fn scheduler(&self) -> &QueueScheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut QueueScheduler {
        &mut self.scheduler
    }

    pub fn coverage(&self) -> &CoverageMap {
        &self.coverage
    }

    pub fn engine(&self) -> &MutationEngine {
        &self.engine
    }

    /// Adds a seed to the corpus and queues it.
    pub fn add_seed(&mut self, data: &[u8]) -> Result<String, CoordinatorError> {
        let known = self.corpus.len();
        let hash = self.corpus.add_input(data, 0, false)?;
        let execution_count = self
            .corpus
            .get_metadata(&hash)
            .map_or(0, |entry| entry.execution_count);
        self.scheduler.add_input(&hash, data.len(), 0, execution_count);
        if self.corpus.len() > known {
            self.engine.push_corpus_input(data.to_vec());
        }
        Ok(hash)
    }

    /// Next input to fuzz. An empty queue is refilled from the whole corpus
    /// once before giving up.
    pub fn select_input(&mut self) -> Option<String> {
        if let Some(hash) = self.scheduler.get_next() {
            return Some(hash);
        }
        for hash in self.corpus.get_all_hashes() {
            if let Some(entry) = self.corpus.get_metadata(&hash) {
                self.scheduler.add_input(
                    &hash,
                    entry.size,
                    entry.coverage_edges as u64,
                    entry.execution_count,
                );
            }
        }
        log::trace!("Refilled queue with {} corpus entries", self.scheduler.len());
        self.scheduler.get_next()
    }

    /// Runs the campaign until the iteration limit, exhaustion, or the stop flag.
    ///
    /// Cleanup (final stats, corpus index flush, coverage checkpoint) runs exactly
    /// once, also when an error or a panic ends the loop early. A panic is
    /// resumed after cleanup.
    pub fn run(&mut self) -> Result<RunSummary, CoordinatorError> {
        if self.state != CoordinatorState::Idle {
            return Err(CoordinatorError::InvalidState(self.state));
        }
        if self.corpus.is_empty() {
            return Err(CoordinatorError::CorpusEmpty);
        }

        let parents: Vec<Vec<u8>> = self
            .corpus
            .get_all_hashes()
            .iter()
            .filter_map(|hash| self.corpus.get_input(hash))
            .collect();
        self.engine.set_corpus(parents);

        self.state = CoordinatorState::Running;
        self.stats.reset();
        self.last_stats_emit = Instant::now();
        log::info!(
            "Starting campaign: {} corpus entries, {} edges known, max iterations {:?}",
            self.corpus.len(),
            self.coverage.total_edges_found(),
            self.options.max_iterations
        );

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.fuzz_loop()));
        self.cleanup();
        let stop_reason = match outcome {
            Ok(result) => result?,
            Err(payload) => panic::resume_unwind(payload),
        };

        log::info!(
            "Campaign stopped after {} iterations ({:?})",
            self.iterations,
            stop_reason
        );
        Ok(RunSummary {
            iterations: self.iterations,
            stop_reason,
            stats: self.stats.snapshot(),
        })
    }

    fn fuzz_loop(&mut self) -> Result<StopReason, CoordinatorError> {
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return Ok(StopReason::Interrupted);
            }
            if self
                .options
                .max_iterations
                .is_some_and(|max| self.iterations >= max)
            {
                return Ok(StopReason::MaxIterations);
            }
            if self.fuzz_one()? == Step::Exhausted {
                return Ok(StopReason::Exhausted);
            }
            self.iterations += 1;
            if self.last_stats_emit.elapsed() >= self.options.stats_interval {
                self.emit_stats();
            }
        }
    }

    fn fuzz_one(&mut self) -> Result<Step, CoordinatorError> {
        let Some(hash) = self.select_input() else {
            return Ok(Step::Exhausted);
        };
        let Some(data) = self.corpus.get_input(&hash) else {
            log::warn!("Skipping {}: payload missing from corpus", hash);
            self.stats.failed_iterations += 1;
            return Ok(Step::Failed);
        };

        let mutated = match self.engine.mutate(&data, &Strategy::Auto) {
            Ok(mutated) if !mutated.is_empty() => mutated,
            Ok(_) => {
                log::debug!("Mutation of {} produced no bytes", hash);
                self.stats.failed_iterations += 1;
                return Ok(Step::Failed);
            }
            Err(e) => {
                log::warn!("Mutation of {} failed: {}", hash, e);
                self.stats.failed_iterations += 1;
                return Ok(Step::Failed);
            }
        };

        self.coverage.reset();
        let execution = match self.executor.execute(&mutated) {
            Ok(execution) => execution,
            Err(e) => {
                log::warn!("Execution failed: {}", e);
                self.stats.failed_iterations += 1;
                return Ok(Step::Failed);
            }
        };
        self.stats.total_executions += 1;
        self.coverage.record_trace(&execution.trace);

        let found_new_coverage = self.coverage.has_new_coverage();
        if found_new_coverage {
            let contribution = self.coverage.count_new_bits() as u64;
            let edges = self.coverage.get_edge_count();
            let known = self.corpus.len();
            let new_hash = self.corpus.add_input(&mutated, edges, true)?;
            self.scheduler.add_input(&new_hash, mutated.len(), contribution, 0);
            let first_seen = self.coverage.update_virgin_map();
            log::debug!(
                "New coverage from {} ({} bytes): {} new bits, {} new edges",
                new_hash,
                mutated.len(),
                contribution,
                first_seen
            );
            if self.corpus.len() > known {
                self.engine.push_corpus_input(mutated);
            }
        }

        if let Some(strategy) = self.engine.last_strategy().map(str::to_string) {
            self.engine.update_effectiveness(&strategy, found_new_coverage);
        }

        if execution.info.crashed {
            self.handle_crash(&execution.info);
        }
        self.corpus.increment_execution_count(&hash);
        Ok(Step::Executed)
    }

    /// Books a crash or hang. Returns `true` when its identity was not seen before
    /// in this campaign; only those are counted as unique and forwarded to the
    /// crash sink.
    pub fn handle_crash(&mut self, info: &CrashInfo) -> bool {
        self.stats.total_crashes += 1;
        let identity = self.oracle.identify(info);
        let key = format!("{}_{}", info.crash_type.name(), identity.signature);
        if !self.seen_crashes.insert(key) {
            log::trace!("Duplicate {} crash {}", info.crash_type, identity.signature);
            return false;
        }

        if info.crash_type == CrashType::Hang {
            self.stats.unique_hangs += 1;
        } else {
            self.stats.unique_crashes += 1;
        }
        log::info!(
            "New unique {} crash {} (exploitability {:?})",
            info.crash_type,
            identity.signature,
            identity.exploitability
        );
        if let Some(sink) = self.crash_sink.as_mut() {
            if let Err(e) = sink.report(info, &identity) {
                log::warn!("Failed to report crash {}: {}", identity.signature, e);
            }
        }
        true
    }

    fn refresh_stats(&mut self) {
        self.stats.corpus_size = self.corpus.len();
        self.stats.queue_depth = self.scheduler.len();
        self.stats.total_edges = self.coverage.total_edges_found();
    }

    fn emit_stats(&mut self) {
        self.refresh_stats();
        if let Err(e) = self.stats_sink.emit(&self.stats.snapshot()) {
            log::warn!("Stats sink failed: {}", e);
        }
        if let Err(e) = self.corpus.flush() {
            log::warn!("Failed to flush corpus index: {}", e);
        }
        self.last_stats_emit = Instant::now();
    }

    fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;
        self.state = CoordinatorState::Stopped;
        self.emit_stats();
        if let Some(path) = &self.options.coverage_state {
            if let Err(e) = self.coverage.save_state(path) {
                log::warn!("Failed to save coverage state to {:?}: {}", path, e);
            }
        }
        log::info!("\n{}", self.stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Execution, ExecutorError, InProcessExecutor};
    use crate::mutator::{MutationConfig, MutationStrategy, Mutator};
    use crate::oracle::CrashIdentity;
    use rand_core::RngCore;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use tempfile::{TempDir, tempdir};

    struct FnExecutor<F: FnMut(&[u8]) -> Result<Execution, ExecutorError>>(F);

    impl<F: FnMut(&[u8]) -> Result<Execution, ExecutorError>> Executor for FnExecutor<F> {
        fn execute(&mut self, input: &[u8]) -> Result<Execution, ExecutorError> {
            (self.0)(input)
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        snapshots: Arc<Mutex<Vec<StatsSnapshot>>>,
        crashes: Arc<Mutex<Vec<CrashIdentity>>>,
    }

    impl StatsSink for RecordingSink {
        fn emit(&mut self, snapshot: &StatsSnapshot) -> Result<(), anyhow::Error> {
            self.snapshots.lock().unwrap().push(snapshot.clone());
            Ok(())
        }
    }

    impl CrashSink for RecordingSink {
        fn report(
            &mut self,
            _info: &CrashInfo,
            identity: &CrashIdentity,
        ) -> Result<(), anyhow::Error> {
            self.crashes.lock().unwrap().push(identity.clone());
            Ok(())
        }
    }

    struct PanickingExecutor;

    impl Executor for PanickingExecutor {
        fn execute(&mut self, _input: &[u8]) -> Result<Execution, ExecutorError> {
            panic!("target adapter bug");
        }
    }

    struct IdentityMutator;

    impl Mutator for IdentityMutator {
        fn name(&self) -> &str {
            "identity"
        }

        fn mutate(&mut self, data: &[u8], _rng: &mut dyn RngCore) -> Vec<u8> {
            data.to_vec()
        }
    }

    struct FailingSink;

    impl StatsSink for FailingSink {
        fn emit(&mut self, _snapshot: &StatsSnapshot) -> Result<(), anyhow::Error> {
            Err(anyhow::anyhow!("aggregator unreachable"))
        }
    }

    fn options(max_iterations: u64) -> CoordinatorOptions {
        CoordinatorOptions {
            max_iterations: Some(max_iterations),
            ..CoordinatorOptions::default()
        }
    }

    fn coordinator<E: Executor>(
        executor: E,
        config: MutationConfig,
        options: CoordinatorOptions,
    ) -> (FuzzingCoordinator<E>, TempDir) {
        let dir = tempdir().unwrap();
        let corpus = CorpusManager::new(dir.path().join("corpus")).unwrap();
        let engine = MutationEngine::new(config, 1);
        (FuzzingCoordinator::new(corpus, engine, executor, options), dir)
    }

    fn byte_flip_only() -> MutationConfig {
        MutationConfig {
            enabled: vec![MutationStrategy::ByteFlip],
            ..MutationConfig::default()
        }
    }

    #[test]
    fn new_coverage_is_accepted_and_queued() {
        let executor = InProcessExecutor::new(|_data: &[u8], trace: &mut Vec<u32>| {
            trace.extend([1, 2, 3]);
        });
        let (mut fuzzer, _dir) = coordinator(executor, byte_flip_only(), options(1));
        let seed = fuzzer.add_seed(b"HELLO_WORLD!").unwrap();
        assert_eq!(fuzzer.scheduler().len(), 1);

        let summary = fuzzer.run().unwrap();
        assert_eq!(summary.iterations, 1);
        assert_eq!(summary.stop_reason, StopReason::MaxIterations);
        assert_eq!(fuzzer.corpus().len(), 2);
        assert_eq!(fuzzer.scheduler().len(), 1);
        assert!(!fuzzer.scheduler().contains(&seed));

        let accepted = fuzzer.scheduler().peek_next().unwrap().to_string();
        let entry = fuzzer.corpus().get_metadata(&accepted).unwrap();
        assert!(entry.found_new_coverage);
        assert_eq!(entry.size, 12);
        assert_eq!(fuzzer.corpus().get_metadata(&seed).unwrap().execution_count, 1);
        assert!(fuzzer.coverage().total_edges_found() > 0);
        assert_eq!(fuzzer.engine().get_stats()["byte_flip"].successes, 1);
    }

    #[test]
    fn repeated_coverage_is_not_accepted() {
        let executor = InProcessExecutor::new(|_data: &[u8], trace: &mut Vec<u32>| {
            trace.push(9);
        });
        let (mut fuzzer, _dir) = coordinator(executor, byte_flip_only(), options(5));
        fuzzer.add_seed(b"AAAA").unwrap();
        fuzzer.run().unwrap();
        assert_eq!(fuzzer.corpus().len(), 2);
        assert_eq!(fuzzer.stats().total_executions, 5);
    }

    #[test]
    fn duplicate_crashes_count_once() {
        let executor = InProcessExecutor::new(|_data: &[u8], _trace: &mut Vec<u32>| {
            panic!("same bug every time");
        });
        let sink = RecordingSink::default();
        let (fuzzer, _dir) = coordinator(executor, MutationConfig::default(), options(2));
        let mut fuzzer = fuzzer.with_crash_sink(Box::new(sink.clone()));
        fuzzer.add_seed(b"CRASH_ME").unwrap();

        let summary = fuzzer.run().unwrap();
        assert_eq!(summary.stats.total_executions, 2);
        assert_eq!(summary.stats.unique_crashes, 1);
        assert_eq!(summary.stats.total_crashes, 2);
        assert_eq!(summary.stats.unique_hangs, 0);
        assert_eq!(sink.crashes.lock().unwrap().len(), 1);
    }

    #[test]
    fn hangs_are_counted_separately() {
        let executor = FnExecutor(|input: &[u8]| {
            Ok(Execution {
                info: CrashInfo::hang(input),
                trace: Vec::new(),
            })
        });
        let (mut fuzzer, _dir) = coordinator(executor, MutationConfig::default(), options(3));
        fuzzer.add_seed(b"SLOW").unwrap();
        let summary = fuzzer.run().unwrap();
        assert_eq!(summary.stats.unique_hangs, 1);
        assert_eq!(summary.stats.unique_crashes, 0);
        assert_eq!(summary.stats.total_crashes, 3);
    }

    #[test]
    fn handle_crash_reports_novelty() {
        let executor = FnExecutor(|input: &[u8]| {
            Ok(Execution {
                info: CrashInfo::clean(input),
                trace: Vec::new(),
            })
        });
        let (mut fuzzer, _dir) = coordinator(executor, MutationConfig::default(), options(0));
        let segv = CrashInfo::new(CrashType::Segv, None, Some(11), b"a");
        let abrt = CrashInfo::new(CrashType::Abrt, None, Some(6), b"b");
        assert!(fuzzer.handle_crash(&segv));
        assert!(!fuzzer.handle_crash(&segv));
        assert!(fuzzer.handle_crash(&abrt));
        assert_eq!(fuzzer.stats().unique_crashes, 2);
        assert_eq!(fuzzer.stats().total_crashes, 3);
    }

    #[test]
    fn select_input_refills_from_corpus() {
        let executor = FnExecutor(|input: &[u8]| {
            Ok(Execution {
                info: CrashInfo::clean(input),
                trace: Vec::new(),
            })
        });
        let (mut fuzzer, _dir) = coordinator(executor, MutationConfig::default(), options(0));
        let hashes: Vec<String> = [&b"one"[..], b"two", b"three"]
            .iter()
            .map(|seed| fuzzer.add_seed(seed).unwrap())
            .collect();
        fuzzer.scheduler_mut().clear();

        let selected = fuzzer.select_input().unwrap();
        assert!(hashes.contains(&selected));
        assert_eq!(fuzzer.scheduler().len(), 2);
    }

    #[test]
    fn empty_corpus_fails_fast() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let executor = InProcessExecutor::new(move |_data: &[u8], _trace: &mut Vec<u32>| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let (mut fuzzer, _dir) = coordinator(executor, MutationConfig::default(), options(10));
        let err = fuzzer.run().unwrap_err();
        assert!(matches!(err, CoordinatorError::CorpusEmpty));
        assert_eq!(err.to_string(), "corpus is empty");
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(fuzzer.iterations(), 0);
        assert_eq!(fuzzer.state(), CoordinatorState::Idle);
    }

    #[test]
    fn stop_flag_interrupts_cleanly() {
        let executor = FnExecutor(|input: &[u8]| {
            Ok(Execution {
                info: CrashInfo::clean(input),
                trace: Vec::new(),
            })
        });
        let sink = RecordingSink::default();
        let (fuzzer, _dir) = coordinator(executor, MutationConfig::default(), options(100));
        let mut fuzzer = fuzzer.with_stats_sink(Box::new(sink.clone()));
        fuzzer.add_seed(b"seed").unwrap();
        fuzzer.stop_handle().store(true, Ordering::SeqCst);

        let summary = fuzzer.run().unwrap();
        assert_eq!(summary.stop_reason, StopReason::Interrupted);
        assert_eq!(summary.iterations, 0);
        assert_eq!(fuzzer.state(), CoordinatorState::Stopped);
        assert_eq!(sink.snapshots.lock().unwrap().len(), 1);
        assert!(matches!(
            fuzzer.run(),
            Err(CoordinatorError::InvalidState(CoordinatorState::Stopped))
        ));
    }

    #[test]
    fn executor_failures_do_not_stop_the_loop() {
        let mut calls = 0;
        let executor = FnExecutor(move |input: &[u8]| {
            calls += 1;
            if calls % 2 == 0 {
                Err(ExecutorError::Config("flaky".to_string()))
            } else {
                Ok(Execution {
                    info: CrashInfo::clean(input),
                    trace: Vec::new(),
                })
            }
        });
        let (fuzzer, _dir) = coordinator(executor, MutationConfig::default(), options(4));
        let mut fuzzer = fuzzer.with_stats_sink(Box::new(FailingSink));
        fuzzer.add_seed(b"seed").unwrap();

        let summary = fuzzer.run().unwrap();
        assert_eq!(summary.iterations, 4);
        assert_eq!(summary.stats.total_executions, 2);
        assert_eq!(summary.stats.failed_iterations, 2);
    }

    #[test]
    fn executor_panic_still_runs_cleanup() {
        let state_dir = tempdir().unwrap();
        let state_path = state_dir.path().join("virgin.bin");
        let sink = RecordingSink::default();
        let run_options = CoordinatorOptions {
            coverage_state: Some(state_path.clone()),
            ..options(5)
        };
        let (fuzzer, _dir) = coordinator(PanickingExecutor, MutationConfig::default(), run_options);
        let mut fuzzer = fuzzer.with_stats_sink(Box::new(sink.clone()));
        fuzzer.add_seed(b"seed").unwrap();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| fuzzer.run()));
        assert!(outcome.is_err());
        assert_eq!(fuzzer.state(), CoordinatorState::Stopped);
        assert_eq!(sink.snapshots.lock().unwrap().len(), 1);
        assert!(state_path.exists());
    }

    #[test]
    fn corpus_write_failure_stops_run_after_cleanup() {
        let dir = tempdir().unwrap();
        let corpus_dir = dir.path().join("corpus");
        let doomed = corpus_dir.clone();
        let executor = InProcessExecutor::new(move |_data: &[u8], trace: &mut Vec<u32>| {
            let _ = std::fs::remove_dir_all(&doomed);
            trace.extend([4, 5, 6]);
        });
        let sink = RecordingSink::default();
        let corpus = CorpusManager::new(corpus_dir).unwrap();
        let engine = MutationEngine::new(byte_flip_only(), 1);
        let mut fuzzer = FuzzingCoordinator::new(corpus, engine, executor, options(10))
            .with_stats_sink(Box::new(sink.clone()));
        fuzzer.add_seed(b"seed").unwrap();

        let err = fuzzer.run().unwrap_err();
        assert!(matches!(err, CoordinatorError::Corpus(_)));
        assert_eq!(fuzzer.state(), CoordinatorState::Stopped);
        assert_eq!(fuzzer.stats().total_executions, 1);
        assert_eq!(sink.snapshots.lock().unwrap().len(), 1);
    }

    #[test]
    fn known_bytes_do_not_grow_splice_pool() {
        let mut location = 0u32;
        let executor = InProcessExecutor::new(move |_data: &[u8], trace: &mut Vec<u32>| {
            location += 1;
            trace.push(location * 1000);
        });
        let mut config = MutationConfig {
            enabled: Vec::new(),
            ..MutationConfig::default()
        };
        config.weights.insert("identity".to_string(), 1.0);
        let mut engine = MutationEngine::new(config, 5);
        engine.register_plugin(Box::new(IdentityMutator)).unwrap();
        let dir = tempdir().unwrap();
        let corpus = CorpusManager::new(dir.path().join("corpus")).unwrap();
        let mut fuzzer = FuzzingCoordinator::new(corpus, engine, executor, options(3));
        fuzzer.add_seed(b"stable").unwrap();

        fuzzer.run().unwrap();
        assert_eq!(fuzzer.stats().total_executions, 3);
        assert_eq!(fuzzer.corpus().len(), 1);
        assert_eq!(fuzzer.engine().splice_pool_len(), 1);
    }

    #[test]
    fn missing_payload_skips_iterations() {
        let executor = FnExecutor(|input: &[u8]| {
            Ok(Execution {
                info: CrashInfo::clean(input),
                trace: Vec::new(),
            })
        });
        let (mut fuzzer, dir) = coordinator(executor, MutationConfig::default(), options(3));
        let hash = fuzzer.add_seed(b"lost").unwrap();
        std::fs::remove_file(dir.path().join("corpus").join(&hash)).unwrap();

        let summary = fuzzer.run().unwrap();
        assert_eq!(summary.stop_reason, StopReason::MaxIterations);
        assert_eq!(summary.stats.total_executions, 0);
        assert_eq!(summary.stats.failed_iterations, 3);
    }

    #[test]
    fn coverage_state_is_checkpointed_at_cleanup() {
        let state_dir = tempdir().unwrap();
        let state_path = state_dir.path().join("virgin.bin");
        let executor = InProcessExecutor::new(|data: &[u8], trace: &mut Vec<u32>| {
            trace.extend(data.iter().map(|&b| u32::from(b)));
        });
        let run_options = CoordinatorOptions {
            coverage_state: Some(state_path.clone()),
            ..options(3)
        };
        let (mut fuzzer, _dir) = coordinator(executor, MutationConfig::default(), run_options);
        fuzzer.add_seed(b"abcdef").unwrap();
        fuzzer.run().unwrap();
        let edges = fuzzer.coverage().total_edges_found();
        assert!(state_path.exists());

        let restored = CoverageMap::load_or_new(&state_path);
        assert_eq!(restored.total_edges_found(), edges);
    }
}
