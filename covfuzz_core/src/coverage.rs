use bincode::{
    Decode, Encode,
    config::{Configuration, Fixint, LittleEndian, Limit},
    error::{DecodeError, EncodeError},
};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Number of slots in both the per-run bitmap and the virgin map.
pub const MAP_SIZE: usize = 65_536;

/// Upper bound on a decoded checkpoint: the virgin map plus its framing.
const STATE_SIZE_LIMIT: usize = MAP_SIZE + 64;

#[derive(Error, Debug)]
pub enum CoverageError {
    #[error("Coverage state I/O error: {0}")]
    Io(String),
    #[error("Coverage state serialization error: {0}")]
    Serialization(String),
    #[error("Coverage state deserialization error: {0}")]
    Deserialization(String),
}

impl From<std::io::Error> for CoverageError {
    fn from(err: std::io::Error) -> Self {
        CoverageError::Io(err.to_string())
    }
}
impl From<EncodeError> for CoverageError {
    fn from(err: EncodeError) -> Self {
        CoverageError::Serialization(format!("Bincode encoding error: {err}"))
    }
}
impl From<DecodeError> for CoverageError {
    fn from(err: DecodeError) -> Self {
        CoverageError::Deserialization(format!("Bincode decoding error: {err}"))
    }
}

/// On-disk form of the campaign-wide novelty baseline.
#[derive(Encode, Decode, Debug)]
struct VirginState {
    total_edges_found: u64,
    virgin_map: Vec<u8>,
}

/// Hit-count bitmap for the current execution plus the cumulative virgin map.
///
/// `bitmap` is cleared before every execution by [`CoverageMap::reset`]. The
/// virgin map starts all-ones and only loses bits through
/// [`CoverageMap::update_virgin_map`], so a set bit means "this hit-count class
/// has never been observed at this location during the campaign".
pub struct CoverageMap {
    bitmap: Box<[u8]>,
    virgin_map: Box<[u8]>,
    prev_location: u32,
    total_edges_found: u64,
}

impl std::fmt::Debug for CoverageMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoverageMap")
            .field("edges_in_run", &self.get_edge_count())
            .field("prev_location", &self.prev_location)
            .field("total_edges_found", &self.total_edges_found)
            .finish()
    }
}

impl Default for CoverageMap {
    fn default() -> Self {
        Self::new()
    }
}

impl CoverageMap {
    pub fn new() -> Self {
        Self {
            bitmap: vec![0u8; MAP_SIZE].into_boxed_slice(),
            virgin_map: vec![0xFFu8; MAP_SIZE].into_boxed_slice(),
            prev_location: 0,
            total_edges_found: 0,
        }
    }

    fn bincode_config() -> Configuration<LittleEndian, Fixint, Limit<STATE_SIZE_LIMIT>> {
        bincode::config::standard()
            .with_little_endian()
            .with_fixed_int_encoding()
            .with_limit::<STATE_SIZE_LIMIT>()
    }

    /// Clears the per-run state. Must be called before every execution.
    pub fn reset(&mut self) {
        self.bitmap.fill(0);
        self.prev_location = 0;
    }

    /// Records a visit to `location`, chaining it with the previous location
    /// into an order-sensitive edge id.
    pub fn record_edge(&mut self, location: u32) {
        let edge_id = (location ^ (self.prev_location >> 1)) as usize % MAP_SIZE;
        self.bitmap[edge_id] = self.bitmap[edge_id].saturating_add(1);
        self.prev_location = location >> 1;
    }

    pub fn record_trace(&mut self, locations: &[u32]) {
        for &location in locations {
            self.record_edge(location);
        }
    }

    /// Maps a raw hit count to its bucket bit.
    pub fn count_class(count: u8) -> u8 {
        match count {
            0 => 0,
            1 => 1,
            2 => 2,
            3 => 4,
            4..=7 => 8,
            8..=15 => 16,
            16..=31 => 32,
            32..=127 => 64,
            _ => 128,
        }
    }

    /// Returns the bucketed view of the current bitmap.
    pub fn classify_counts(&self) -> Vec<u8> {
        self.bitmap.iter().map(|&c| Self::count_class(c)).collect()
    }

    /// True if any location in the current run hit a bucket never seen before.
    pub fn has_new_coverage(&self) -> bool {
        self.bitmap
            .iter()
            .zip(self.virgin_map.iter())
            .any(|(&count, &virgin)| count != 0 && Self::count_class(count) & virgin != 0)
    }

    /// Number of locations whose bucket in this run is still virgin.
    pub fn count_new_bits(&self) -> usize {
        self.bitmap
            .iter()
            .zip(self.virgin_map.iter())
            .filter(|&(&count, &virgin)| count != 0 && Self::count_class(count) & virgin != 0)
            .count()
    }

    /// Folds the current run into the virgin map and returns how many
    /// locations were observed for the first time in this campaign.
    pub fn update_virgin_map(&mut self) -> usize {
        let mut first_time = 0;
        for (&count, virgin) in self.bitmap.iter().zip(self.virgin_map.iter_mut()) {
            if count == 0 {
                continue;
            }
            if *virgin == 0xFF {
                first_time += 1;
            }
            *virgin &= !Self::count_class(count);
        }
        self.total_edges_found += first_time as u64;
        first_time
    }

    /// Number of distinct locations hit in the current run.
    pub fn get_edge_count(&self) -> usize {
        self.bitmap.iter().filter(|&&c| c != 0).count()
    }

    pub fn total_edges_found(&self) -> u64 {
        self.total_edges_found
    }

    pub fn prev_location(&self) -> u32 {
        self.prev_location
    }

    pub fn bitmap(&self) -> &[u8] {
        &self.bitmap
    }

    /// Persists the virgin map so a restarted campaign keeps its baseline.
    pub fn save_state(&self, path: &Path) -> Result<(), CoverageError> {
        let state = VirginState {
            total_edges_found: self.total_edges_found,
            virgin_map: self.virgin_map.to_vec(),
        };
        let bytes = bincode::encode_to_vec(&state, Self::bincode_config())?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, bytes)?;
        Ok(())
    }

    /// Restores a checkpoint written by [`CoverageMap::save_state`].
    pub fn load_state(&mut self, path: &Path) -> Result<(), CoverageError> {
        let bytes = fs::read(path)?;
        let (state, _len): (VirginState, usize) =
            bincode::decode_from_slice(&bytes, Self::bincode_config())?;
        if state.virgin_map.len() != MAP_SIZE {
            return Err(CoverageError::Deserialization(format!(
                "virgin map in {:?} has {} slots, expected {}",
                path,
                state.virgin_map.len(),
                MAP_SIZE
            )));
        }
        self.virgin_map.copy_from_slice(&state.virgin_map);
        self.total_edges_found = state.total_edges_found;
        Ok(())
    }

    /// Load-or-default: a missing or corrupt checkpoint yields a fresh map.
    pub fn load_or_new(path: &Path) -> Self {
        let mut map = Self::new();
        if path.exists() {
            if let Err(e) = map.load_state(path) {
                log::warn!("Ignoring unreadable coverage state {path:?}: {e}");
                map = Self::new();
            }
        }
        map
    }
}
