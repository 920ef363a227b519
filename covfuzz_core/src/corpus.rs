use rand::Rng;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Defines errors that can arise during corpus operations.
///
/// These cover I/O problems with the corpus directory and failures to encode the
/// metadata index. A missing payload file is not an error: lookups report it as absent.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// The requested hash is not present in the corpus index.
    #[error("Input {0} not found in corpus index")]
    InputNotFound(String),

    /// An I/O error occurred while reading or writing the corpus directory.
    #[error("Corpus I/O error: {0}")]
    Io(String),

    /// The metadata index could not be serialized.
    #[error("Corpus serialization error: {0}")]
    Serialization(String),

    /// The metadata index could not be parsed.
    #[error("Corpus deserialization error: {0}")]
    Deserialization(String),
}

impl From<std::io::Error> for CorpusError {
    fn from(err: std::io::Error) -> Self {
        CorpusError::Io(err.to_string())
    }
}
impl From<serde_json::Error> for CorpusError {
    fn from(err: serde_json::Error) -> Self {
        CorpusError::Deserialization(format!("JSON operation error: {}", err))
    }
}

/// Hex length of a content hash.
pub const HASH_LEN: usize = 16;

/// Stable content hash of `data`: the first 16 hex digits of its MD5 digest.
pub fn content_hash(data: &[u8]) -> String {
    let mut hex = format!("{:x}", md5::compute(data));
    hex.truncate(HASH_LEN);
    hex
}

/// Metadata kept for every accepted input.
///
/// Persisted in the corpus index; the payload bytes live in a separate file
/// named by `hash`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CorpusEntry {
    pub hash: String,
    pub size: usize,
    pub execution_count: u64,
    /// Edge count of the run that got this input accepted.
    pub coverage_edges: usize,
    pub found_new_coverage: bool,
}

#[derive(Serialize, Debug, Clone, PartialEq, Default)]
pub struct CorpusStats {
    pub corpus_size: usize,
    pub total_size_bytes: u64,
    pub avg_input_size: f64,
    pub new_coverage_inputs: usize,
}

/// A content-addressed, on-disk store of accepted inputs.
///
/// Each input is written once to `<dir>/<hash>`; the metadata of all entries is
/// kept in a JSON index (`metadata.json`) that is reloaded on construction.
/// Re-adding identical bytes is a no-op, so the corpus only grows.
#[derive(Debug)]
pub struct CorpusManager {
    corpus_dir_path: PathBuf,
    index_file_path: PathBuf,
    /// Entries in insertion order.
    entries: Vec<CorpusEntry>,
    /// Hash to position in `entries`.
    positions: HashMap<String, usize>,
    /// Execution counts changed since the index was last written.
    dirty: bool,
}

impl CorpusManager {
    /// Filename of the JSON metadata index inside the corpus directory.
    pub const INDEX_FILENAME: &'static str = "metadata.json";

    /// Opens the corpus at `corpus_dir_path`, creating the directory if needed.
    ///
    /// An unreadable or corrupt index is logged and replaced by an empty corpus
    /// rather than failing construction.
    pub fn new(corpus_dir_path: impl Into<PathBuf>) -> Result<Self, CorpusError> {
        let corpus_dir_path = corpus_dir_path.into();
        if !corpus_dir_path.exists() {
            fs::create_dir_all(&corpus_dir_path).map_err(|e| {
                CorpusError::Io(format!(
                    "Failed to create corpus directory at {:?}: {}",
                    corpus_dir_path, e
                ))
            })?;
        } else if !corpus_dir_path.is_dir() {
            return Err(CorpusError::Io(format!(
                "Corpus path {:?} exists but is not a directory",
                corpus_dir_path
            )));
        }

        let index_file_path = corpus_dir_path.join(Self::INDEX_FILENAME);
        let entries = match Self::load_index(&index_file_path) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!(
                    "Ignoring corpus index {:?}, starting with an empty corpus: {}",
                    index_file_path,
                    e
                );
                Vec::new()
            }
        };

        let mut corpus = Self {
            corpus_dir_path,
            index_file_path,
            entries: Vec::new(),
            positions: HashMap::new(),
            dirty: false,
        };
        for entry in entries {
            if !corpus.positions.contains_key(&entry.hash) {
                corpus.positions.insert(entry.hash.clone(), corpus.entries.len());
                corpus.entries.push(entry);
            }
        }
        log::debug!(
            "Opened corpus at {:?} with {} entries",
            corpus.corpus_dir_path,
            corpus.entries.len()
        );
        Ok(corpus)
    }

    fn load_index(index_file_path: &Path) -> Result<Vec<CorpusEntry>, CorpusError> {
        if !index_file_path.is_file() {
            return Ok(Vec::new());
        }
        let file = File::open(index_file_path)?;
        if file.metadata()?.len() == 0 {
            return Ok(Vec::new());
        }
        let entries = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            CorpusError::Deserialization(format!(
                "Failed to parse JSON from index file {:?}: {}. The file might be corrupted.",
                index_file_path, e
            ))
        })?;
        Ok(entries)
    }

    fn save_index(&self) -> Result<(), CorpusError> {
        let file = File::create(&self.index_file_path).map_err(|e| {
            CorpusError::Io(format!(
                "Failed to create or truncate index file {:?}: {}",
                self.index_file_path, e
            ))
        })?;
        serde_json::to_writer_pretty(BufWriter::new(file), &self.entries).map_err(|e| {
            CorpusError::Serialization(format!(
                "Failed to serialize corpus index to JSON for {:?}: {}",
                self.index_file_path, e
            ))
        })
    }

    fn payload_path(&self, hash: &str) -> PathBuf {
        self.corpus_dir_path.join(hash)
    }

    pub fn dir(&self) -> &Path {
        &self.corpus_dir_path
    }

    /// Stores `data` and returns its hash. Bytes already in the corpus return the
    /// existing hash and leave the corpus unchanged.
    pub fn add_input(
        &mut self,
        data: &[u8],
        coverage_edges: usize,
        found_new_coverage: bool,
    ) -> Result<String, CorpusError> {
        let hash = content_hash(data);
        if self.positions.contains_key(&hash) {
            return Ok(hash);
        }

        let file_path = self.payload_path(&hash);
        fs::write(&file_path, data).map_err(|e| {
            CorpusError::Io(format!("Failed to write input file {:?}: {}", file_path, e))
        })?;

        self.positions.insert(hash.clone(), self.entries.len());
        self.entries.push(CorpusEntry {
            hash: hash.clone(),
            size: data.len(),
            execution_count: 0,
            coverage_edges,
            found_new_coverage,
        });
        self.save_index()?;
        self.dirty = false;
        log::debug!("Added {} ({} bytes) to corpus", hash, data.len());
        Ok(hash)
    }

    /// Payload bytes for `hash`. `None` for unknown hashes and for entries whose
    /// payload file has gone missing.
    pub fn get_input(&self, hash: &str) -> Option<Vec<u8>> {
        if !self.positions.contains_key(hash) {
            return None;
        }
        let file_path = self.payload_path(hash);
        match fs::read(&file_path) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                log::warn!("Corpus payload {:?} unreadable: {}", file_path, e);
                None
            }
        }
    }

    /// A uniformly chosen entry and its bytes.
    pub fn get_random_input(&self, rng: &mut dyn RngCore) -> Option<(String, Vec<u8>)> {
        if self.entries.is_empty() {
            return None;
        }
        let hash = &self.entries[rng.random_range(0..self.entries.len())].hash;
        self.get_input(hash).map(|bytes| (hash.clone(), bytes))
    }

    /// Every hash, in insertion order.
    pub fn get_all_hashes(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.hash.clone()).collect()
    }

    /// Bumps the execution count of `hash`. Unknown hashes are ignored.
    ///
    /// The change is kept in memory until the next [`CorpusManager::flush`] or
    /// [`CorpusManager::add_input`].
    pub fn increment_execution_count(&mut self, hash: &str) {
        if let Some(&position) = self.positions.get(hash) {
            self.entries[position].execution_count += 1;
            self.dirty = true;
        }
    }

    pub fn get_metadata(&self, hash: &str) -> Option<&CorpusEntry> {
        self.positions.get(hash).map(|&position| &self.entries[position])
    }

    pub fn export_stats(&self) -> CorpusStats {
        let corpus_size = self.entries.len();
        let total_size_bytes: u64 = self.entries.iter().map(|e| e.size as u64).sum();
        CorpusStats {
            corpus_size,
            total_size_bytes,
            avg_input_size: if corpus_size == 0 {
                0.0
            } else {
                total_size_bytes as f64 / corpus_size as f64
            },
            new_coverage_inputs: self.entries.iter().filter(|e| e.found_new_coverage).count(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes pending execution-count changes to the index.
    pub fn flush(&mut self) -> Result<(), CorpusError> {
        if self.dirty {
            self.save_index()?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Adds raw seed files. Each path is a file or a directory whose immediate
    /// files are read; dotfiles and the corpus index are skipped.
    ///
    /// Returns the number of seeds that were new to the corpus.
    pub fn load_initial_seeds(&mut self, seed_paths: &[PathBuf]) -> Result<usize, CorpusError> {
        let mut files = Vec::new();
        for path in seed_paths {
            if path.is_file() {
                files.push(path.clone());
            } else if path.is_dir() {
                let read_dir = fs::read_dir(path).map_err(|e| {
                    CorpusError::Io(format!("Failed to read seed directory {:?}: {}", path, e))
                })?;
                for entry in read_dir {
                    let entry = entry.map_err(|e| {
                        CorpusError::Io(format!("Error reading entry in {:?}: {}", path, e))
                    })?;
                    files.push(entry.path());
                }
            } else {
                log::warn!("Seed path {:?} does not exist", path);
            }
        }
        files.sort();

        let mut loaded = 0;
        for file_path in files {
            let skip = file_path.file_name().and_then(|n| n.to_str()).is_none_or(|name| {
                name == Self::INDEX_FILENAME || name.starts_with('.')
            });
            if skip || !file_path.is_file() {
                continue;
            }
            let bytes = fs::read(&file_path).map_err(|e| {
                CorpusError::Io(format!("Failed to read seed file {:?}: {}", file_path, e))
            })?;
            if bytes.is_empty() {
                log::debug!("Skipping empty seed {:?}", file_path);
                continue;
            }
            let before = self.entries.len();
            self.add_input(&bytes, 0, false)?;
            if self.entries.len() > before {
                loaded += 1;
            }
        }
        log::info!("Loaded {} seed inputs", loaded);
        Ok(loaded)
    }
}
