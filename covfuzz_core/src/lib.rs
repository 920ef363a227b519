pub mod config;
pub mod coordinator;
pub mod corpus;
pub mod coverage;
pub mod deterministic;
pub mod dictionary;
pub mod executor;
pub mod havoc;
pub mod mutator;
pub mod observer;
pub mod oracle;
pub mod scheduler;
pub mod splice;
pub mod stats;

pub use config::FuzzerConfig;
pub use coordinator::{
    CoordinatorError, CoordinatorOptions, CoordinatorState, FuzzingCoordinator, RunSummary,
    StopReason,
};
pub use corpus::{CorpusEntry, CorpusError, CorpusManager, CorpusStats};
pub use coverage::{CoverageError, CoverageMap, MAP_SIZE};
pub use executor::{
    CommandExecutor, CommandExecutorConfig, CrashInfo, CrashType, Execution, Executor,
    ExecutorError, InProcessExecutor, InputDelivery,
};
pub use mutator::{
    MutationConfig, MutationEngine, MutationError, MutationStrategy, Mutator, Strategy,
};
pub use observer::{CoverageObserver, NoOpObserver, TraceFileObserver};
pub use oracle::{
    CrashIdentity, CrashOracle, CrashSink, DirectoryCrashSink, Exploitability, SignatureOracle,
};
pub use scheduler::QueueScheduler;
pub use stats::{FuzzingStats, JsonLinesStatsSink, LogStatsSink, StatsSink, StatsSnapshot};
