use covfuzz_core::config::FuzzerConfig;
use covfuzz_core::coordinator::{CoordinatorOptions, FuzzingCoordinator};
use covfuzz_core::corpus::CorpusManager;
use covfuzz_core::executor::CommandExecutor;
use covfuzz_core::mutator::MutationEngine;
use covfuzz_core::observer::{CoverageObserver, NoOpObserver, TraceFileObserver};
use covfuzz_core::oracle::DirectoryCrashSink;
use covfuzz_core::stats::JsonLinesStatsSink;

use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    #[clap(long)]
    corpus_dir: Option<PathBuf>,
    /// Seed file or directory. May be repeated.
    #[clap(short, long = "seeds")]
    seeds: Vec<PathBuf>,
    #[clap(short, long)]
    iterations: Option<u64>,
    #[clap(long)]
    timeout_ms: Option<u64>,
    /// Seed for the mutation engine RNG.
    #[clap(long)]
    rng_seed: Option<u64>,
    /// Append one JSON stats snapshot per interval to this file.
    #[clap(long)]
    stats_json: Option<PathBuf>,
    /// Target command line after `--`. `@@` marks where the input file path goes
    /// when file delivery is configured.
    #[clap(last = true)]
    target_command: Vec<String>,
}

fn load_config(config_file: Option<&Path>) -> Result<FuzzerConfig, anyhow::Error> {
    match config_file {
        Some(config_path) => {
            log::info!("Loading configuration from {config_path:?}");
            FuzzerConfig::load_from_file(config_path)
        }
        None => {
            let default_config_path = PathBuf::from("covfuzz.toml");
            if default_config_path.exists() {
                log::info!("No config file specified, loading default {default_config_path:?}");
                FuzzerConfig::load_from_file(&default_config_path)
            } else {
                log::info!(
                    "No config file specified and no covfuzz.toml found, using built-in defaults"
                );
                Ok(FuzzerConfig::default())
            }
        }
    }
}

fn apply_overrides(config: &mut FuzzerConfig, cli: &Cli) {
    if !cli.target_command.is_empty() {
        config.executor.command = cli.target_command.clone();
    }
    if let Some(dir) = &cli.corpus_dir {
        config.corpus.dir = dir.clone();
    }
    if !cli.seeds.is_empty() {
        config.corpus.seed_paths = cli.seeds.clone();
    }
    if let Some(iterations) = cli.iterations {
        config.fuzzer.max_iterations = Some(iterations);
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.executor.timeout_ms = timeout_ms;
    }
    if let Some(seed) = cli.rng_seed {
        config.fuzzer.rng_seed = seed;
    }
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = load_config(cli.config_file.as_deref())?;
    apply_overrides(&mut config, &cli);
    log::debug!("Effective configuration: {config:#?}");

    let observer: Box<dyn CoverageObserver> = match &config.executor.trace_env {
        Some(env_var) => Box::new(TraceFileObserver::new(env_var.clone())?),
        None => {
            log::warn!("No trace-env configured, running without coverage feedback");
            Box::new(NoOpObserver)
        }
    };
    let executor = CommandExecutor::new(config.executor.to_command_config(), observer)?;

    let mut corpus = CorpusManager::new(config.corpus.dir.clone())?;
    let loaded = corpus.load_initial_seeds(&config.corpus.seed_paths)?;
    log::info!(
        "Corpus at {:?}: {} entries ({} new seeds)",
        corpus.dir(),
        corpus.len(),
        loaded
    );

    let engine = MutationEngine::new(config.mutation.clone(), config.fuzzer.rng_seed);
    let crash_sink = DirectoryCrashSink::new(config.corpus.crashes_dir.clone())?;
    let mut coordinator = FuzzingCoordinator::new(
        corpus,
        engine,
        executor,
        CoordinatorOptions::from(&config.fuzzer),
    )
    .with_crash_sink(Box::new(crash_sink));
    if let Some(path) = &cli.stats_json {
        coordinator = coordinator.with_stats_sink(Box::new(JsonLinesStatsSink::create(path)?));
    }

    let stop = coordinator.stop_handle();
    ctrlc::set_handler(move || {
        log::info!("Interrupt received, stopping after the current iteration");
        stop.store(true, Ordering::SeqCst);
    })?;

    let summary = coordinator.run()?;
    println!(
        "Stopped after {} iterations ({:?}): {} executions, {} unique crashes, {} unique hangs, corpus size {}",
        summary.iterations,
        summary.stop_reason,
        summary.stats.total_executions,
        summary.stats.unique_crashes,
        summary.stats.unique_hangs,
        summary.stats.corpus_size
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let cli = Cli::try_parse_from([
            "covfuzz",
            "--corpus-dir",
            "/tmp/c",
            "-s",
            "seeds/a",
            "-s",
            "seeds/b",
            "-i",
            "50",
            "--timeout-ms",
            "20",
            "--rng-seed",
            "9",
            "--",
            "./target",
            "@@",
        ])
        .unwrap();
        let mut config = FuzzerConfig::default();
        apply_overrides(&mut config, &cli);

        assert_eq!(config.executor.command, vec!["./target", "@@"]);
        assert_eq!(config.corpus.dir, PathBuf::from("/tmp/c"));
        assert_eq!(config.corpus.seed_paths.len(), 2);
        assert_eq!(config.fuzzer.max_iterations, Some(50));
        assert_eq!(config.executor.timeout_ms, 20);
        assert_eq!(config.fuzzer.rng_seed, 9);
    }

    #[test]
    fn absent_flags_keep_config_values() {
        let cli = Cli::try_parse_from(["covfuzz"]).unwrap();
        let mut config = FuzzerConfig::default();
        config.executor.command = vec!["./bin".to_string()];
        apply_overrides(&mut config, &cli);
        assert_eq!(config, {
            let mut expected = FuzzerConfig::default();
            expected.executor.command = vec!["./bin".to_string()];
            expected
        });
    }
}
