use crate::coverage::MAP_SIZE;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};

/// Campaign counters. Rates are derived from wall time since construction or the
/// last [`FuzzingStats::reset`].
#[derive(Debug, Clone)]
pub struct FuzzingStats {
    start_time: Instant,
    pub total_executions: u64,
    pub unique_crashes: u64,
    pub unique_hangs: u64,
    /// Every crash or hang, duplicates included.
    pub total_crashes: u64,
    pub failed_iterations: u64,
    pub total_edges: u64,
    pub corpus_size: usize,
    pub queue_depth: usize,
}

impl Default for FuzzingStats {
    fn default() -> Self {
        Self {
            start_time: Instant::now(),
            total_executions: 0,
            unique_crashes: 0,
            unique_hangs: 0,
            total_crashes: 0,
            failed_iterations: 0,
            total_edges: 0,
            corpus_size: 0,
            queue_depth: 0,
        }
    }
}

impl FuzzingStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zeroes every counter and restarts the clock.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn execs_per_sec(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.total_executions as f64 / secs
        } else {
            0.0
        }
    }

    /// Share of the coverage map that has been hit at least once.
    pub fn coverage_percent(&self) -> f64 {
        self.total_edges as f64 * 100.0 / MAP_SIZE as f64
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            elapsed_secs: self.elapsed().as_secs_f64(),
            total_executions: self.total_executions,
            execs_per_sec: self.execs_per_sec(),
            unique_crashes: self.unique_crashes,
            unique_hangs: self.unique_hangs,
            total_crashes: self.total_crashes,
            failed_iterations: self.failed_iterations,
            total_edges: self.total_edges,
            coverage_percent: self.coverage_percent(),
            corpus_size: self.corpus_size,
            queue_depth: self.queue_depth,
        }
    }
}

impl fmt::Display for FuzzingStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "==================== FUZZING STATISTICS ====================")?;
        writeln!(f, "  run time        : {:.1}s", self.elapsed().as_secs_f64())?;
        writeln!(f, "  executions      : {}", self.total_executions)?;
        writeln!(f, "  execs/sec       : {:.2}", self.execs_per_sec())?;
        writeln!(f, "  unique crashes  : {}", self.unique_crashes)?;
        writeln!(f, "  unique hangs    : {}", self.unique_hangs)?;
        writeln!(f, "  total crashes   : {}", self.total_crashes)?;
        writeln!(f, "  failed iters    : {}", self.failed_iterations)?;
        writeln!(
            f,
            "  edges           : {} ({:.2}%)",
            self.total_edges,
            self.coverage_percent()
        )?;
        writeln!(f, "  corpus size     : {}", self.corpus_size)?;
        writeln!(f, "  queue depth     : {}", self.queue_depth)?;
        write!(f, "============================================================")
    }
}

/// Point-in-time copy of [`FuzzingStats`] handed to a [`StatsSink`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub elapsed_secs: f64,
    pub total_executions: u64,
    pub execs_per_sec: f64,
    pub unique_crashes: u64,
    pub unique_hangs: u64,
    pub total_crashes: u64,
    pub failed_iterations: u64,
    pub total_edges: u64,
    pub coverage_percent: f64,
    pub corpus_size: usize,
    pub queue_depth: usize,
}

/// Destination of periodic statistics. A failing sink never stops the campaign;
/// the coordinator logs the error and carries on.
pub trait StatsSink: Send {
    fn emit(&mut self, snapshot: &StatsSnapshot) -> Result<(), anyhow::Error>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatsSink;

impl StatsSink for LogStatsSink {
    fn emit(&mut self, snapshot: &StatsSnapshot) -> Result<(), anyhow::Error> {
        log::info!(
            "execs: {} ({:.1}/s) | edges: {} ({:.2}%) | corpus: {} | queue: {} | crashes: {} | hangs: {}",
            snapshot.total_executions,
            snapshot.execs_per_sec,
            snapshot.total_edges,
            snapshot.coverage_percent,
            snapshot.corpus_size,
            snapshot.queue_depth,
            snapshot.unique_crashes,
            snapshot.unique_hangs,
        );
        Ok(())
    }
}

/// Appends one JSON object per snapshot.
#[derive(Debug)]
pub struct JsonLinesStatsSink<W: Write + Send> {
    writer: W,
}

impl JsonLinesStatsSink<BufWriter<File>> {
    /// Opens `path` for appending, creating it if needed.
    pub fn create(path: &Path) -> Result<Self, anyhow::Error> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send> JsonLinesStatsSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> StatsSink for JsonLinesStatsSink<W> {
    fn emit(&mut self, snapshot: &StatsSnapshot) -> Result<(), anyhow::Error> {
        serde_json::to_writer(&mut self.writer, snapshot)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn snapshot_copies_counters() {
        let mut stats = FuzzingStats::new();
        stats.total_executions = 10;
        stats.unique_crashes = 2;
        stats.total_edges = 655;
        stats.corpus_size = 4;

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_executions, 10);
        assert_eq!(snapshot.unique_crashes, 2);
        assert_eq!(snapshot.corpus_size, 4);
        assert!((snapshot.coverage_percent - 655.0 * 100.0 / 65536.0).abs() < 1e-9);
        assert!(snapshot.execs_per_sec >= 0.0);
    }

    #[test]
    fn reset_zeroes_counters() {
        let mut stats = FuzzingStats::new();
        stats.total_executions = 5;
        stats.failed_iterations = 1;
        stats.reset();
        assert_eq!(stats.total_executions, 0);
        assert_eq!(stats.failed_iterations, 0);
    }

    #[test]
    fn display_renders_banner() {
        let mut stats = FuzzingStats::new();
        stats.unique_hangs = 3;
        let rendered = stats.to_string();
        assert!(rendered.contains("FUZZING STATISTICS"));
        assert!(rendered.contains("unique hangs    : 3"));
    }

    #[test]
    fn json_lines_sink_writes_one_line_per_snapshot() {
        let mut sink = JsonLinesStatsSink::new(Vec::new());
        let mut stats = FuzzingStats::new();
        sink.emit(&stats.snapshot()).unwrap();
        stats.total_executions = 7;
        sink.emit(&stats.snapshot()).unwrap();

        let output = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: StatsSnapshot = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.total_executions, 7);
    }

    #[test]
    fn json_lines_sink_appends_to_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stats.jsonl");
        for _ in 0..2 {
            let mut sink = JsonLinesStatsSink::create(&path).unwrap();
            sink.emit(&FuzzingStats::new().snapshot()).unwrap();
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);
    }
}
