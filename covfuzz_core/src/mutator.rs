use crate::deterministic::{
    DeterministicMutator, random_arithmetic, random_bit_flip, random_byte_flip, random_interesting,
};
use crate::dictionary::DictionaryMutator;
use crate::havoc::HavocMutator;
use crate::splice::{crossover, multi_crossover};
use rand::Rng;
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A `Mutator` transforms a byte string into a new, potentially modified byte string.
///
/// Mutators are the pluggable strategies of the fuzzing loop. Built-in strategies and
/// protocol-aware plugins both implement this trait and are dispatched by name from
/// [`MutationEngine`].
///
/// Implementations must never fail on malformed input: a mutator that cannot apply its
/// edit (no structure to work with, input too short) returns a best-effort result,
/// usually the input itself. Empty input is never passed to a mutator by the engine.
pub trait Mutator: Send {
    /// Name under which the mutator is dispatched and its effectiveness tracked.
    fn name(&self) -> &str;

    /// Produces a mutated copy of `data`.
    ///
    /// # Arguments
    /// * `data`: The bytes to mutate. Not modified.
    /// * `rng`: The engine's seeded random number generator.
    fn mutate(&mut self, data: &[u8], rng: &mut dyn RngCore) -> Vec<u8>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MutationError {
    #[error("Unknown strategy: {0}")]
    UnknownStrategy(String),
    #[error("Strategy name already registered: {0}")]
    DuplicateStrategy(String),
}

/// The built-in strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStrategy {
    BitFlip,
    ByteFlip,
    Arithmetic,
    Interesting,
    Havoc,
    Dictionary,
    Splice,
    MultiCrossover,
    Deterministic,
}

impl MutationStrategy {
    pub const ALL: [MutationStrategy; 9] = [
        MutationStrategy::BitFlip,
        MutationStrategy::ByteFlip,
        MutationStrategy::Arithmetic,
        MutationStrategy::Interesting,
        MutationStrategy::Havoc,
        MutationStrategy::Dictionary,
        MutationStrategy::Splice,
        MutationStrategy::MultiCrossover,
        MutationStrategy::Deterministic,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MutationStrategy::BitFlip => "bit_flip",
            MutationStrategy::ByteFlip => "byte_flip",
            MutationStrategy::Arithmetic => "arithmetic",
            MutationStrategy::Interesting => "interesting",
            MutationStrategy::Havoc => "havoc",
            MutationStrategy::Dictionary => "dictionary",
            MutationStrategy::Splice => "splice",
            MutationStrategy::MultiCrossover => "multi_crossover",
            MutationStrategy::Deterministic => "deterministic",
        }
    }
}

impl fmt::Display for MutationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MutationStrategy {
    type Err = MutationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MutationStrategy::ALL
            .into_iter()
            .find(|strategy| strategy.name() == s)
            .ok_or_else(|| MutationError::UnknownStrategy(s.to_string()))
    }
}

/// A resolved dispatch target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Sample a strategy from the weight table.
    Auto,
    Builtin(MutationStrategy),
    /// A registered plugin, by name.
    Plugin(String),
}

impl Strategy {
    pub fn name(&self) -> &str {
        match self {
            Strategy::Auto => "auto",
            Strategy::Builtin(strategy) => strategy.name(),
            Strategy::Plugin(name) => name,
        }
    }
}

const DEFAULT_REWARD: f64 = 0.05;
const DEFAULT_SPLICE_PARENTS: usize = 3;
/// Ceiling for a rewarded weight; keeps the sampling table finite.
const MAX_WEIGHT: f64 = 1.0e6;

fn default_weights() -> BTreeMap<String, f64> {
    [
        (MutationStrategy::BitFlip, 0.1),
        (MutationStrategy::ByteFlip, 0.1),
        (MutationStrategy::Arithmetic, 0.15),
        (MutationStrategy::Interesting, 0.15),
        (MutationStrategy::Havoc, 0.3),
        (MutationStrategy::Dictionary, 0.1),
        (MutationStrategy::Splice, 0.1),
    ]
    .into_iter()
    .map(|(strategy, weight)| (strategy.name().to_string(), weight))
    .collect()
}

/// Strategy selection and tuning. `weights` is the only part the engine changes at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct MutationConfig {
    /// Built-in strategies `auto` may sample. Explicit dispatch ignores this list.
    pub enabled: Vec<MutationStrategy>,
    /// Sampling weight per strategy or plugin name. Replaces the defaults when set.
    pub weights: BTreeMap<String, f64>,
    pub havoc_min_stack: u32,
    pub havoc_max_stack: u32,
    /// Upper bound on parents combined by `multi_crossover`.
    pub splice_parents: usize,
    /// Protocol dictionary used by the `dictionary` strategy; all of them when unset.
    pub dictionary: Option<String>,
    /// Relative weight increase applied when a strategy finds new coverage.
    pub reward: f64,
}

impl Default for MutationConfig {
    fn default() -> Self {
        let havoc = HavocMutator::default();
        Self {
            enabled: MutationStrategy::ALL
                .into_iter()
                .filter(|s| {
                    !matches!(
                        s,
                        MutationStrategy::MultiCrossover | MutationStrategy::Deterministic
                    )
                })
                .collect(),
            weights: default_weights(),
            havoc_min_stack: havoc.min_stack(),
            havoc_max_stack: havoc.max_stack(),
            splice_parents: DEFAULT_SPLICE_PARENTS,
            dictionary: None,
            reward: DEFAULT_REWARD,
        }
    }
}

/// Attempt and success counts for one strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StrategyStats {
    pub attempts: u64,
    pub successes: u64,
}

/// Dispatches mutations to built-in strategies and plugins, and adapts the sampling
/// weights toward strategies that keep finding coverage.
pub struct MutationEngine {
    config: MutationConfig,
    rng: ChaCha8Rng,
    havoc: HavocMutator,
    dictionary: DictionaryMutator,
    deterministic: DeterministicMutator,
    plugins: BTreeMap<String, Box<dyn Mutator>>,
    corpus: Vec<Vec<u8>>,
    effectiveness: BTreeMap<String, StrategyStats>,
    last_strategy: Option<String>,
}

impl fmt::Debug for MutationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationEngine")
            .field("config", &self.config)
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .field("corpus_len", &self.corpus.len())
            .field("effectiveness", &self.effectiveness)
            .finish()
    }
}

impl MutationEngine {
    pub fn new(mut config: MutationConfig, seed: u64) -> Self {
        config.reward = config.reward.max(0.0);
        let havoc = HavocMutator::new(config.havoc_min_stack, config.havoc_max_stack);
        let dictionary = DictionaryMutator::new(config.dictionary.clone());
        Self {
            config,
            rng: ChaCha8Rng::seed_from_u64(seed),
            havoc,
            dictionary,
            deterministic: DeterministicMutator::new(),
            plugins: BTreeMap::new(),
            corpus: Vec::new(),
            effectiveness: BTreeMap::new(),
            last_strategy: None,
        }
    }

    /// Registers a plugin under its own name. Built-in names and `auto` are reserved.
    pub fn register_plugin(&mut self, plugin: Box<dyn Mutator>) -> Result<(), MutationError> {
        let name = plugin.name().to_string();
        if name == "auto"
            || name.parse::<MutationStrategy>().is_ok()
            || self.plugins.contains_key(&name)
        {
            return Err(MutationError::DuplicateStrategy(name));
        }
        log::debug!("Registered mutation plugin '{name}'");
        self.plugins.insert(name, plugin);
        Ok(())
    }

    /// Turns a strategy name into a dispatch target.
    pub fn resolve(&self, name: &str) -> Result<Strategy, MutationError> {
        if name == "auto" {
            return Ok(Strategy::Auto);
        }
        if let Ok(builtin) = name.parse::<MutationStrategy>() {
            return Ok(Strategy::Builtin(builtin));
        }
        if self.plugins.contains_key(name) {
            return Ok(Strategy::Plugin(name.to_string()));
        }
        Err(MutationError::UnknownStrategy(name.to_string()))
    }

    /// Mutates `data` with `strategy`. Empty input yields empty output without
    /// dispatching.
    pub fn mutate(&mut self, data: &[u8], strategy: &Strategy) -> Result<Vec<u8>, MutationError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let chosen = match strategy {
            Strategy::Auto => self.sample_strategy(),
            other => other.clone(),
        };
        let out = match &chosen {
            Strategy::Builtin(builtin) => self.apply_builtin(*builtin, data),
            Strategy::Plugin(name) => {
                let plugin = self
                    .plugins
                    .get_mut(name)
                    .ok_or_else(|| MutationError::UnknownStrategy(name.clone()))?;
                plugin.mutate(data, &mut self.rng)
            }
            Strategy::Auto => self.apply_builtin(MutationStrategy::Havoc, data),
        };
        log::trace!("{} produced {} bytes from {}", chosen.name(), out.len(), data.len());
        self.last_strategy = Some(chosen.name().to_string());
        Ok(out)
    }

    /// Like [`MutationEngine::mutate`], resolving `name` first.
    pub fn mutate_named(&mut self, data: &[u8], name: &str) -> Result<Vec<u8>, MutationError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let strategy = self.resolve(name)?;
        self.mutate(data, &strategy)
    }

    /// `count` independent automatic mutations of `data`.
    pub fn mutate_batch(
        &mut self,
        data: &[u8],
        count: usize,
    ) -> Result<Vec<Vec<u8>>, MutationError> {
        (0..count).map(|_| self.mutate(data, &Strategy::Auto)).collect()
    }

    /// Replaces the splice parent pool.
    pub fn set_corpus(&mut self, inputs: Vec<Vec<u8>>) {
        self.corpus = inputs.into_iter().filter(|input| !input.is_empty()).collect();
    }

    /// Number of parents available to splice and multi-crossover.
    pub fn splice_pool_len(&self) -> usize {
        self.corpus.len()
    }

    pub fn push_corpus_input(&mut self, input: Vec<u8>) {
        if !input.is_empty() {
            self.corpus.push(input);
        }
    }

    /// Records one attempt of `name`. On success the strategy's weight, if it has
    /// one, grows by the configured reward up to a fixed ceiling.
    pub fn update_effectiveness(&mut self, name: &str, found_coverage: bool) {
        let stats = self.effectiveness.entry(name.to_string()).or_default();
        stats.attempts += 1;
        if found_coverage {
            stats.successes += 1;
            if let Some(weight) = self.config.weights.get_mut(name) {
                *weight = (*weight + *weight * self.config.reward).min(MAX_WEIGHT);
            }
        }
    }

    pub fn get_stats(&self) -> &BTreeMap<String, StrategyStats> {
        &self.effectiveness
    }

    pub fn weights(&self) -> &BTreeMap<String, f64> {
        &self.config.weights
    }

    /// Name of the strategy that produced the most recent mutation.
    pub fn last_strategy(&self) -> Option<&str> {
        self.last_strategy.as_deref()
    }

    pub fn config(&self) -> &MutationConfig {
        &self.config
    }

    fn sample_strategy(&mut self) -> Strategy {
        let candidates: Vec<(Strategy, f64)> = self
            .config
            .weights
            .iter()
            .filter(|(_, weight)| weight.is_finite() && **weight > 0.0)
            .filter_map(|(name, weight)| match name.parse::<MutationStrategy>() {
                Ok(builtin) if self.config.enabled.contains(&builtin) => {
                    Some((Strategy::Builtin(builtin), *weight))
                }
                Ok(_) => None,
                Err(_) if self.plugins.contains_key(name) => {
                    Some((Strategy::Plugin(name.clone()), *weight))
                }
                Err(_) => None,
            })
            .collect();
        match WeightedIndex::new(candidates.iter().map(|(_, weight)| *weight)) {
            Ok(index) => candidates[index.sample(&mut self.rng)].0.clone(),
            Err(_) => Strategy::Builtin(MutationStrategy::Havoc),
        }
    }

    fn apply_builtin(&mut self, strategy: MutationStrategy, data: &[u8]) -> Vec<u8> {
        match strategy {
            MutationStrategy::BitFlip => random_bit_flip(data, &mut self.rng),
            MutationStrategy::ByteFlip => random_byte_flip(data, &mut self.rng),
            MutationStrategy::Arithmetic => random_arithmetic(data, &mut self.rng),
            MutationStrategy::Interesting => random_interesting(data, &mut self.rng),
            MutationStrategy::Havoc => self.havoc.mutate(data, &mut self.rng),
            MutationStrategy::Dictionary => self.dictionary.mutate(data, &mut self.rng),
            MutationStrategy::Deterministic => self.deterministic.mutate(data, &mut self.rng),
            MutationStrategy::Splice => {
                if self.corpus.is_empty() {
                    return data.to_vec();
                }
                let other = &self.corpus[self.rng.random_range(0..self.corpus.len())];
                crossover(data, other, &mut self.rng)
            }
            MutationStrategy::MultiCrossover => {
                if self.corpus.is_empty() {
                    return data.to_vec();
                }
                let mut parents: Vec<&[u8]> = Vec::with_capacity(self.corpus.len() + 1);
                parents.push(data);
                parents.extend(self.corpus.iter().map(Vec::as_slice));
                multi_crossover(&parents, self.config.splice_parents, &mut self.rng)
            }
        }
    }
}
