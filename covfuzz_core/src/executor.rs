use crate::observer::CoverageObserver;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Upper bound on the sleep between two polls of a running target.
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Invalid executor configuration: {0}")]
    Config(String),
    #[error("Failed to spawn command {command:?}: {source}")]
    Spawn {
        command: Vec<String>,
        source: std::io::Error,
    },
    #[error("Executor I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Observer '{name}' failed: {message}")]
    Observer { name: &'static str, message: String },
}

/// Verdict class of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CrashType {
    #[default]
    None,
    Segv,
    Abrt,
    Bus,
    Ill,
    Fpe,
    Hang,
    Asan,
    Msan,
    Ubsan,
}

impl CrashType {
    pub fn name(self) -> &'static str {
        match self {
            CrashType::None => "NONE",
            CrashType::Segv => "SEGV",
            CrashType::Abrt => "ABRT",
            CrashType::Bus => "BUS",
            CrashType::Ill => "ILL",
            CrashType::Fpe => "FPE",
            CrashType::Hang => "HANG",
            CrashType::Asan => "ASAN",
            CrashType::Msan => "MSAN",
            CrashType::Ubsan => "UBSAN",
        }
    }

    /// Fault type for a terminating signal. Signals that do not indicate a fault
    /// (SIGKILL, SIGTERM, ...) map to `None`.
    pub fn from_signal(signal: i32) -> Option<CrashType> {
        match signal {
            4 => Some(CrashType::Ill),
            6 => Some(CrashType::Abrt),
            7 => Some(CrashType::Bus),
            8 => Some(CrashType::Fpe),
            11 => Some(CrashType::Segv),
            _ => None,
        }
    }

    /// Sanitizer named by a report in `stderr`, if any.
    pub fn from_sanitizer_report(stderr: &[u8]) -> Option<CrashType> {
        let text = String::from_utf8_lossy(stderr);
        if text.contains("AddressSanitizer") {
            Some(CrashType::Asan)
        } else if text.contains("MemorySanitizer") {
            Some(CrashType::Msan)
        } else if text.contains("UndefinedBehaviorSanitizer") || text.contains("runtime error:") {
            Some(CrashType::Ubsan)
        } else {
            None
        }
    }

    /// Classifies a finished process.
    ///
    /// Sanitizer reports win over the raw exit status, since sanitizers usually
    /// exit with a plain nonzero code or abort. Exit codes above 128 are read as
    /// `128 + signal`, the way shells report signal deaths. A nonzero exit with
    /// no other evidence is not a crash.
    pub fn classify(exit_code: Option<i32>, signal: Option<i32>, stderr: &[u8]) -> CrashType {
        if let Some(sanitizer) = Self::from_sanitizer_report(stderr) {
            if exit_code != Some(0) {
                return sanitizer;
            }
        }
        if let Some(fault) = signal.and_then(Self::from_signal) {
            return fault;
        }
        exit_code
            .filter(|code| *code > 128)
            .and_then(|code| Self::from_signal(code - 128))
            .unwrap_or(CrashType::None)
    }
}

impl fmt::Display for CrashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The execution monitor's verdict for one input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CrashInfo {
    pub crashed: bool,
    pub crash_type: CrashType,
    pub exit_code: Option<i32>,
    pub signal_number: Option<i32>,
    #[serde(with = "lossy_bytes")]
    pub stdout: Vec<u8>,
    #[serde(with = "lossy_bytes")]
    pub stderr: Vec<u8>,
    #[serde(skip)]
    pub input_data: Vec<u8>,
}

impl CrashInfo {
    pub fn new(
        crash_type: CrashType,
        exit_code: Option<i32>,
        signal_number: Option<i32>,
        input_data: &[u8],
    ) -> Self {
        Self {
            crashed: crash_type != CrashType::None,
            crash_type,
            exit_code,
            signal_number,
            stdout: Vec::new(),
            stderr: Vec::new(),
            input_data: input_data.to_vec(),
        }
    }

    pub fn clean(input_data: &[u8]) -> Self {
        Self::new(CrashType::None, Some(0), None, input_data)
    }

    pub fn hang(input_data: &[u8]) -> Self {
        Self::new(CrashType::Hang, None, None, input_data)
    }

    pub fn with_output(mut self, stdout: Vec<u8>, stderr: Vec<u8>) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }
}

/// Captured output is stored as text in reports.
mod lossy_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        Ok(String::deserialize(deserializer)?.into_bytes())
    }
}

/// A verdict plus the coverage sample taken during the same run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Execution {
    pub info: CrashInfo,
    pub trace: Vec<u32>,
}

/// Runs the target once per input.
///
/// Target faults and timeouts are reported in the returned [`CrashInfo`]; an `Err`
/// means the execution itself could not be carried out.
pub trait Executor {
    fn execute(&mut self, input: &[u8]) -> Result<Execution, ExecutorError>;
}

/// Runs a harness closure in-process.
///
/// The closure receives the input and a buffer to push visited locations into.
/// A panic is caught and reported as an `ABRT` crash carrying the panic message
/// on stderr.
pub struct InProcessExecutor<F>
where
    F: FnMut(&[u8], &mut Vec<u32>),
{
    harness_fn: F,
}

impl<F> InProcessExecutor<F>
where
    F: FnMut(&[u8], &mut Vec<u32>),
{
    pub fn new(harness_fn: F) -> Self {
        Self { harness_fn }
    }
}

impl<F> Executor for InProcessExecutor<F>
where
    F: FnMut(&[u8], &mut Vec<u32>),
{
    fn execute(&mut self, input: &[u8]) -> Result<Execution, ExecutorError> {
        let mut trace = Vec::new();
        let result = catch_unwind(AssertUnwindSafe(|| {
            (self.harness_fn)(input, &mut trace);
        }));

        let info = match result {
            Ok(()) => CrashInfo::clean(input),
            Err(panic_payload) => {
                let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic type".to_string()
                };
                CrashInfo::new(CrashType::Abrt, None, Some(6), input)
                    .with_output(Vec::new(), msg.into_bytes())
            }
        };
        Ok(Execution { info, trace })
    }
}

/// How the input reaches the target process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum InputDelivery {
    /// The input is the target's stdin.
    #[default]
    StdIn,
    /// The input is written to a temp file whose path replaces `template` in every
    /// command argument. The path is appended if no argument contains the template.
    File { template: String },
}

#[derive(Debug, Clone)]
pub struct CommandExecutorConfig {
    pub command: Vec<String>,
    pub input_delivery: InputDelivery,
    pub timeout: Duration,
    pub working_dir: Option<PathBuf>,
}

/// Runs an external target process per input.
///
/// stdout and stderr go to anonymous temp files rather than pipes, so a chatty
/// target can never block on a full pipe while the executor polls for exit.
pub struct CommandExecutor {
    config: CommandExecutorConfig,
    observer: Box<dyn CoverageObserver>,
}

impl CommandExecutor {
    pub fn new(
        config: CommandExecutorConfig,
        observer: Box<dyn CoverageObserver>,
    ) -> Result<Self, ExecutorError> {
        if config.command.is_empty() {
            return Err(ExecutorError::Config("command is empty".to_string()));
        }
        Ok(Self { config, observer })
    }

    pub fn config(&self) -> &CommandExecutorConfig {
        &self.config
    }

    /// Polls the child until it exits or `timeout` passes. On timeout the child is
    /// killed and reaped, and `None` is returned.
    fn wait_with_timeout(
        &self,
        child: &mut Child,
        timeout: Duration,
    ) -> Result<Option<ExitStatus>, ExecutorError> {
        let start_time = Instant::now();
        let mut poll_interval = Duration::from_millis(1);
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Some(status));
            }
            if start_time.elapsed() > timeout {
                log::trace!("Target timed out after {:?}, killing", timeout);
                if let Err(e) = child.kill() {
                    log::warn!("Failed to kill timed-out target: {e}");
                }
                child.wait()?;
                return Ok(None);
            }
            std::thread::sleep(poll_interval);
            poll_interval = (poll_interval * 2).min(MAX_POLL_INTERVAL);
        }
    }

    fn build_command(&self, input_path: Option<&str>) -> Command {
        let mut args: Vec<String> = self.config.command[1..].to_vec();
        if let (InputDelivery::File { template }, Some(path)) =
            (&self.config.input_delivery, input_path)
        {
            let mut substituted = false;
            for arg in args.iter_mut() {
                if arg.contains(template.as_str()) {
                    *arg = arg.replace(template.as_str(), path);
                    substituted = true;
                }
            }
            if !substituted {
                args.push(path.to_string());
            }
        }

        let mut cmd = Command::new(&self.config.command[0]);
        cmd.args(args);
        if let Some(cwd) = &self.config.working_dir {
            cmd.current_dir(cwd);
        }
        cmd
    }
}

fn read_back(mut file: File) -> Result<Vec<u8>, ExecutorError> {
    file.seek(SeekFrom::Start(0))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(bytes)
}

#[cfg(unix)]
fn termination_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn termination_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

impl Executor for CommandExecutor {
    fn execute(&mut self, input: &[u8]) -> Result<Execution, ExecutorError> {
        let input_file = match &self.config.input_delivery {
            InputDelivery::StdIn => None,
            InputDelivery::File { .. } => {
                let mut named_temp_file = NamedTempFile::new()?;
                named_temp_file.write_all(input)?;
                named_temp_file.flush()?;
                Some(named_temp_file)
            }
        };
        let input_path = match &input_file {
            Some(file) => Some(file.path().to_str().ok_or_else(|| {
                ExecutorError::Config("Temp file path is not valid UTF-8".to_string())
            })?),
            None => None,
        };
        let mut cmd = self.build_command(input_path);

        match &self.config.input_delivery {
            InputDelivery::StdIn => {
                let mut stdin_file = tempfile::tempfile()?;
                stdin_file.write_all(input)?;
                stdin_file.seek(SeekFrom::Start(0))?;
                cmd.stdin(Stdio::from(stdin_file));
            }
            InputDelivery::File { .. } => {
                cmd.stdin(Stdio::null());
            }
        }

        let stdout_file = tempfile::tempfile()?;
        let stderr_file = tempfile::tempfile()?;
        cmd.stdout(Stdio::from(stdout_file.try_clone()?));
        cmd.stderr(Stdio::from(stderr_file.try_clone()?));

        self.observer
            .pre_exec(&mut cmd)
            .map_err(|e| ExecutorError::Observer {
                name: self.observer.name(),
                message: e.to_string(),
            })?;

        let mut child = cmd.spawn().map_err(|source| ExecutorError::Spawn {
            command: self.config.command.clone(),
            source,
        })?;
        // The parent's copies of the redirected handles are released with `cmd`.
        drop(cmd);

        let status = self.wait_with_timeout(&mut child, self.config.timeout)?;
        let stdout = read_back(stdout_file)?;
        let stderr = read_back(stderr_file)?;
        drop(input_file);

        let trace = self
            .observer
            .post_exec()
            .map_err(|e| ExecutorError::Observer {
                name: self.observer.name(),
                message: e.to_string(),
            })?;

        let info = match status {
            None => CrashInfo::hang(input),
            Some(status) => {
                let exit_code = status.code();
                let signal = termination_signal(&status);
                let crash_type = CrashType::classify(exit_code, signal, &stderr);
                CrashInfo::new(crash_type, exit_code, signal, input)
            }
        }
        .with_output(stdout, stderr);
        Ok(Execution { info, trace })
    }
}

#[cfg(test)]
mod in_process_executor_tests {
    use super::*;

    #[test]
    fn in_process_executor_runs_harness_and_collects_trace() {
        let mut executor = InProcessExecutor::new(|data: &[u8], trace: &mut Vec<u32>| {
            trace.extend(data.iter().map(|&b| u32::from(b)));
        });
        let execution = executor.execute(&[1, 2, 3]).unwrap();
        assert!(!execution.info.crashed);
        assert_eq!(execution.info.crash_type, CrashType::None);
        assert_eq!(execution.info.input_data, vec![1, 2, 3]);
        assert_eq!(execution.trace, vec![1, 2, 3]);
    }

    #[test]
    fn in_process_executor_reports_panic_as_abort() {
        let mut executor = InProcessExecutor::new(|data: &[u8], trace: &mut Vec<u32>| {
            trace.push(42);
            if data.first() == Some(&0xFF) {
                panic!("Boom!");
            }
        });
        let execution = executor.execute(&[0xFF]).unwrap();
        assert!(execution.info.crashed);
        assert_eq!(execution.info.crash_type, CrashType::Abrt);
        assert_eq!(execution.info.signal_number, Some(6));
        assert!(String::from_utf8_lossy(&execution.info.stderr).contains("Boom!"));
        assert_eq!(execution.trace, vec![42]);

        assert!(!executor.execute(&[0x00]).unwrap().info.crashed);
    }

    #[test]
    fn classify_maps_signals_exit_codes_and_sanitizers() {
        assert_eq!(CrashType::classify(Some(0), None, b""), CrashType::None);
        assert_eq!(CrashType::classify(Some(1), None, b""), CrashType::None);
        assert_eq!(CrashType::classify(None, Some(11), b""), CrashType::Segv);
        assert_eq!(CrashType::classify(None, Some(6), b""), CrashType::Abrt);
        assert_eq!(CrashType::classify(None, Some(7), b""), CrashType::Bus);
        assert_eq!(CrashType::classify(None, Some(4), b""), CrashType::Ill);
        assert_eq!(CrashType::classify(None, Some(8), b""), CrashType::Fpe);
        assert_eq!(CrashType::classify(None, Some(9), b""), CrashType::None);
        assert_eq!(CrashType::classify(Some(139), None, b""), CrashType::Segv);
        assert_eq!(CrashType::classify(Some(134), None, b""), CrashType::Abrt);
        assert_eq!(
            CrashType::classify(
                Some(1),
                None,
                b"==1==ERROR: AddressSanitizer: heap-use-after-free"
            ),
            CrashType::Asan
        );
        assert_eq!(
            CrashType::classify(
                None,
                Some(6),
                b"WARNING: MemorySanitizer: use-of-uninitialized-value"
            ),
            CrashType::Msan
        );
        assert_eq!(
            CrashType::classify(Some(1), None, b"x.c:3:5: runtime error: signed integer overflow"),
            CrashType::Ubsan
        );
        assert_eq!(
            CrashType::classify(Some(0), None, b"AddressSanitizer mentioned in a log line"),
            CrashType::None
        );
    }

    #[test]
    fn crash_type_serializes_in_upper_case() {
        assert_eq!(serde_json::to_string(&CrashType::Segv).unwrap(), "\"SEGV\"");
        assert_eq!(CrashType::Hang.to_string(), "HANG");
    }
}
