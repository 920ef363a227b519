use crate::executor::{CrashInfo, CrashType};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Hex digits kept from a crash signature digest.
const SIGNATURE_LEN: usize = 16;
/// Number of stderr lines that take part in a signature.
const SIGNATURE_STDERR_LINES: usize = 32;

/// Rough rating of how useful a crash is to an attacker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Exploitability {
    None,
    Low,
    Medium,
    High,
    Critical,
}

/// Deduplication key of a crash plus its rating.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CrashIdentity {
    pub signature: String,
    pub exploitability: Exploitability,
}

/// A `CrashOracle` turns a crash verdict into a stable identity.
///
/// Two verdicts that describe the same underlying bug should produce the same
/// signature; the coordinator counts each signature once.
pub trait CrashOracle: Send {
    /// Computes the identity of a crashed execution.
    ///
    /// # Arguments
    /// * `info`: The verdict reported by the executor. `info.crashed` is always true.
    fn identify(&self, info: &CrashInfo) -> CrashIdentity;
}

/// Identifies crashes by a digest of the crash type, the terminating signal and
/// the leading stderr lines with numbers masked out, so that addresses and pids
/// do not split one bug into many.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignatureOracle;

impl SignatureOracle {
    pub fn new() -> Self {
        SignatureOracle
    }

    /// Masks every run of digits, including `0x` prefixed hex, with `#`.
    pub fn normalize_line(line: &str) -> String {
        let mut out = String::with_capacity(line.len());
        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            if c.is_ascii_digit() {
                if c == '0' && chars.peek() == Some(&'x') {
                    chars.next();
                    while chars.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
                        chars.next();
                    }
                } else {
                    while chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                        chars.next();
                    }
                }
                out.push('#');
            } else {
                out.push(c);
            }
        }
        out
    }

    pub fn rate(info: &CrashInfo) -> Exploitability {
        match info.crash_type {
            CrashType::None | CrashType::Hang => Exploitability::None,
            CrashType::Asan => {
                let report = String::from_utf8_lossy(&info.stderr);
                if report.contains("WRITE") || report.contains("double-free") {
                    Exploitability::Critical
                } else {
                    Exploitability::High
                }
            }
            CrashType::Segv => Exploitability::High,
            CrashType::Bus | CrashType::Ill | CrashType::Msan => Exploitability::Medium,
            CrashType::Abrt | CrashType::Fpe | CrashType::Ubsan => Exploitability::Low,
        }
    }
}

impl CrashOracle for SignatureOracle {
    fn identify(&self, info: &CrashInfo) -> CrashIdentity {
        let mut context = md5::Context::new();
        context.consume(info.crash_type.name().as_bytes());
        context.consume(info.signal_number.unwrap_or(0).to_le_bytes());
        let stderr = String::from_utf8_lossy(&info.stderr);
        for line in stderr.lines().take(SIGNATURE_STDERR_LINES) {
            context.consume(Self::normalize_line(line).as_bytes());
            context.consume(b"\n");
        }
        let mut signature = format!("{:x}", context.compute());
        signature.truncate(SIGNATURE_LEN);
        CrashIdentity {
            signature,
            exploitability: Self::rate(info),
        }
    }
}

/// Receives every unique crash for reporting.
pub trait CrashSink: Send {
    fn report(&mut self, info: &CrashInfo, identity: &CrashIdentity) -> Result<(), anyhow::Error>;
}

/// JSON sidecar written next to a saved crash input.
#[derive(Debug, Serialize, Deserialize)]
pub struct CrashRecord {
    pub identity: CrashIdentity,
    pub input_size: usize,
    pub verdict: CrashInfo,
}

/// Saves each crash input as `<dir>/<CRASH_TYPE>_<signature>.bin` with a
/// `.json` sidecar holding the verdict and rating.
#[derive(Debug)]
pub struct DirectoryCrashSink {
    dir: PathBuf,
}

impl DirectoryCrashSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, anyhow::Error> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_stem(info: &CrashInfo, identity: &CrashIdentity) -> String {
        format!("{}_{}", info.crash_type.name(), identity.signature)
    }
}

impl CrashSink for DirectoryCrashSink {
    fn report(&mut self, info: &CrashInfo, identity: &CrashIdentity) -> Result<(), anyhow::Error> {
        let stem = Self::file_stem(info, identity);
        fs::write(self.dir.join(format!("{stem}.bin")), &info.input_data)?;
        let record = CrashRecord {
            identity: identity.clone(),
            input_size: info.input_data.len(),
            verdict: info.clone(),
        };
        fs::write(
            self.dir.join(format!("{stem}.json")),
            serde_json::to_vec_pretty(&record)?,
        )?;
        log::debug!("Saved crash {} to {:?}", stem, self.dir);
        Ok(())
    }
}
