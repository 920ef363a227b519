use crate::executor::{CommandExecutorConfig, InputDelivery};
use crate::mutator::MutationConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    /// Unbounded when absent.
    #[serde(default)]
    pub max_iterations: Option<u64>,
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
    #[serde(default)]
    pub rng_seed: u64,
    /// Virgin-map checkpoint, loaded at start and saved at cleanup.
    #[serde(default)]
    pub coverage_state: Option<PathBuf>,
}

pub fn default_stats_interval_secs() -> u64 {
    5
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            max_iterations: None,
            stats_interval_secs: default_stats_interval_secs(),
            rng_seed: 0,
            coverage_state: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ExecutorSettings {
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub input_delivery: InputDelivery,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    pub working_dir: Option<PathBuf>,
    /// Environment variable through which the trace file path is exported.
    /// Coverage is not collected when unset.
    pub trace_env: Option<String>,
}

fn default_timeout_ms() -> u64 {
    1000
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            input_delivery: InputDelivery::default(),
            timeout_ms: default_timeout_ms(),
            working_dir: None,
            trace_env: None,
        }
    }
}

impl ExecutorSettings {
    pub fn to_command_config(&self) -> CommandExecutorConfig {
        CommandExecutorConfig {
            command: self.command.clone(),
            input_delivery: self.input_delivery.clone(),
            timeout: Duration::from_millis(self.timeout_ms),
            working_dir: self.working_dir.clone(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusSettings {
    #[serde(default = "default_corpus_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_crashes_dir")]
    pub crashes_dir: PathBuf,
    #[serde(default)]
    pub seed_paths: Vec<PathBuf>,
}

pub fn default_corpus_dir() -> PathBuf {
    PathBuf::from("./corpus")
}

pub fn default_crashes_dir() -> PathBuf {
    PathBuf::from("./crashes")
}

impl Default for CorpusSettings {
    fn default() -> Self {
        Self {
            dir: default_corpus_dir(),
            crashes_dir: default_crashes_dir(),
            seed_paths: Vec::new(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub executor: ExecutorSettings,
    #[serde(default)]
    pub corpus: CorpusSettings,
    #[serde(default)]
    pub mutation: MutationConfig,
}

impl FuzzerConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: FuzzerConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutator::MutationStrategy;
    use tempfile::tempdir;

    const FULL_CONFIG: &str = r#"
[fuzzer]
max-iterations = 100000
stats-interval-secs = 10
rng-seed = 7
coverage-state = "./work/virgin.bin"

[executor]
command = ["./target", "@@"]
input-delivery = { file = { template = "@@" } }
timeout-ms = 250
working-dir = "./"
trace-env = "COVFUZZ_TRACE_PATH"

[corpus]
dir = "./work/corpus"
crashes-dir = "./work/crashes"
seed-paths = ["./seeds"]

[mutation]
enabled = ["bit_flip", "havoc", "splice"]
weights = { havoc = 0.3, splice = 0.1 }
havoc-min-stack = 4
havoc-max-stack = 8
splice-parents = 2
dictionary = "http"
reward = 0.1
"#;

    #[test]
    fn parses_every_section() {
        let config: FuzzerConfig = toml::from_str(FULL_CONFIG).unwrap();
        assert_eq!(config.fuzzer.max_iterations, Some(100_000));
        assert_eq!(config.fuzzer.rng_seed, 7);
        assert_eq!(
            config.fuzzer.coverage_state.as_deref(),
            Some(Path::new("./work/virgin.bin"))
        );
        assert_eq!(
            config.executor.input_delivery,
            InputDelivery::File {
                template: "@@".to_string()
            }
        );
        assert_eq!(config.executor.trace_env.as_deref(), Some("COVFUZZ_TRACE_PATH"));
        assert_eq!(config.corpus.seed_paths, vec![PathBuf::from("./seeds")]);
        assert_eq!(
            config.mutation.enabled,
            vec![MutationStrategy::BitFlip, MutationStrategy::Havoc, MutationStrategy::Splice]
        );
        assert_eq!(config.mutation.weights.len(), 2);
        assert_eq!(config.mutation.dictionary.as_deref(), Some("http"));
        assert_eq!(config.mutation.havoc_max_stack, 8);

        let exec = config.executor.to_command_config();
        assert_eq!(exec.timeout, Duration::from_millis(250));
        assert_eq!(exec.command, vec!["./target".to_string(), "@@".to_string()]);
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config: FuzzerConfig = toml::from_str("").unwrap();
        assert_eq!(config, FuzzerConfig::default());
        assert_eq!(config.fuzzer.max_iterations, None);
        assert_eq!(config.executor.input_delivery, InputDelivery::StdIn);
        assert_eq!(config.executor.timeout_ms, 1000);
        assert_eq!(config.corpus.dir, PathBuf::from("./corpus"));
        assert_eq!(config.mutation, MutationConfig::default());
    }

    #[test]
    fn stdin_delivery_parses_from_string() {
        let config: FuzzerConfig = toml::from_str(
            "[executor]\ncommand = [\"./t\"]\ninput-delivery = \"std-in\"\n",
        )
        .unwrap();
        assert_eq!(config.executor.input_delivery, InputDelivery::StdIn);
    }

    #[test]
    fn unknown_keys_and_strategies_are_rejected() {
        assert!(toml::from_str::<FuzzerConfig>("[fuzzer]\nthreads = 4\n").is_err());
        assert!(toml::from_str::<FuzzerConfig>("[mutation]\nenabled = [\"teleport\"]\n").is_err());
    }

    #[test]
    fn load_from_file_reports_path_on_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("covfuzz.toml");
        std::fs::write(&path, FULL_CONFIG).unwrap();
        assert!(FuzzerConfig::load_from_file(&path).is_ok());

        let missing = dir.path().join("missing.toml");
        let err = FuzzerConfig::load_from_file(&missing).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
