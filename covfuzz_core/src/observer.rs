use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::Command;
use tempfile::NamedTempFile;

/// A `CoverageObserver` collects the coverage sample of one target execution.
///
/// Observers are invoked by a `CommandExecutor` before the target is spawned
/// (`pre_exec`), where they may configure the command (environment, arguments),
/// and after it has exited (`post_exec`), where they return the ordered sequence
/// of locations the target visited.
///
/// How the target is instrumented is outside the fuzzer's concern; an observer only
/// has to turn whatever the instrumentation leaves behind into `u32` locations.
pub trait CoverageObserver: Send {
    /// Returns a static string name identifying the observer, used in error messages.
    fn name(&self) -> &'static str;

    /// Called immediately before the target is spawned.
    ///
    /// Implementations reset state left over from the previous execution here.
    fn pre_exec(&mut self, command: &mut Command) -> Result<(), anyhow::Error>;

    /// Called after the target has exited or been killed.
    ///
    /// # Returns
    /// The visited locations, in execution order. An empty sample is valid.
    fn post_exec(&mut self) -> Result<Vec<u32>, anyhow::Error>;
}

/// Collects nothing. Every execution yields an empty coverage sample.
#[derive(Default, Debug, Clone, Copy)]
pub struct NoOpObserver;

impl CoverageObserver for NoOpObserver {
    fn name(&self) -> &'static str {
        "NoOpObserver"
    }

    fn pre_exec(&mut self, _command: &mut Command) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn post_exec(&mut self) -> Result<Vec<u32>, anyhow::Error> {
        Ok(Vec::new())
    }
}

/// Reads locations from a trace file written by the target.
///
/// The path of a private temp file is exported to the target through `env_var`.
/// An instrumented target appends each visited location as a little-endian `u32`.
/// The file is truncated before every execution; a trailing partial record is ignored.
#[derive(Debug)]
pub struct TraceFileObserver {
    env_var: String,
    trace_file: NamedTempFile,
}

impl TraceFileObserver {
    pub fn new(env_var: impl Into<String>) -> Result<Self, anyhow::Error> {
        Ok(Self {
            env_var: env_var.into(),
            trace_file: NamedTempFile::new()?,
        })
    }

    pub fn path(&self) -> &Path {
        self.trace_file.path()
    }

    pub fn env_var(&self) -> &str {
        &self.env_var
    }

    pub fn decode_trace(bytes: &[u8]) -> Vec<u32> {
        let records = bytes.chunks_exact(4);
        if !records.remainder().is_empty() {
            log::trace!(
                "Ignoring {} trailing bytes of trace file",
                records.remainder().len()
            );
        }
        records
            .map(|record| u32::from_le_bytes([record[0], record[1], record[2], record[3]]))
            .collect()
    }
}

impl CoverageObserver for TraceFileObserver {
    fn name(&self) -> &'static str {
        "TraceFileObserver"
    }

    fn pre_exec(&mut self, command: &mut Command) -> Result<(), anyhow::Error> {
        let file = self.trace_file.as_file_mut();
        file.set_len(0)?;
        file.flush()?;
        command.env(&self.env_var, self.trace_file.path());
        Ok(())
    }

    fn post_exec(&mut self) -> Result<Vec<u32>, anyhow::Error> {
        let bytes = fs::read(self.trace_file.path())?;
        Ok(Self::decode_trace(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_observer_yields_empty_sample() {
        let mut observer = NoOpObserver;
        let mut command = Command::new("true");
        observer.pre_exec(&mut command).unwrap();
        assert!(observer.post_exec().unwrap().is_empty());
    }

    #[test]
    fn decode_trace_reads_little_endian_records() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        bytes.extend_from_slice(&[0xAA, 0xBB]);
        assert_eq!(TraceFileObserver::decode_trace(&bytes), vec![1, 0xDEAD_BEEF]);
        assert!(TraceFileObserver::decode_trace(&[]).is_empty());
    }

    #[test]
    fn trace_file_is_exported_and_truncated_between_runs() {
        let mut observer = TraceFileObserver::new("COVFUZZ_TRACE_TEST").unwrap();
        let mut command = Command::new("true");
        observer.pre_exec(&mut command).unwrap();

        let exported = command
            .get_envs()
            .find(|(key, _)| *key == "COVFUZZ_TRACE_TEST")
            .and_then(|(_, value)| value);
        assert_eq!(exported, Some(observer.path().as_os_str()));

        fs::write(observer.path(), 7u32.to_le_bytes()).unwrap();
        assert_eq!(observer.post_exec().unwrap(), vec![7]);

        observer.pre_exec(&mut command).unwrap();
        assert!(observer.post_exec().unwrap().is_empty());
    }
}
