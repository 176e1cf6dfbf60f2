use std::backtrace::{Backtrace, BacktraceStatus};
use std::error::Error as StdError;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::AgentError;

/// One failure written to `<root>/debug/debug_<millis>.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DumpRecord {
    pub date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    pub stack: Vec<String>,
}

impl DumpRecord {
    pub fn from_error(err: &AgentError) -> Self {
        let backtrace = Backtrace::capture();
        let mut stack = error_chain(err);
        if backtrace.status() == BacktraceStatus::Captured {
            stack.extend(backtrace.to_string().lines().map(str::to_string));
        }
        Self {
            date: Utc::now(),
            code: Some(err.code().to_string()),
            message: err.to_string(),
            stack,
        }
    }

    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let mut stack: Vec<String> = err.chain().map(|e| e.to_string()).collect();
        let backtrace = err.backtrace();
        if backtrace.status() == BacktraceStatus::Captured {
            stack.extend(backtrace.to_string().lines().map(str::to_string));
        }
        Self {
            date: Utc::now(),
            code: err.downcast_ref::<AgentError>().map(|e| e.code().to_string()),
            message: err.to_string(),
            stack,
        }
    }
}

fn error_chain(err: &(dyn StdError + 'static)) -> Vec<String> {
    let mut lines = vec![err.to_string()];
    let mut source = err.source();
    while let Some(cause) = source {
        lines.push(format!("caused by: {cause}"));
        source = cause.source();
    }
    lines
}

/// Writes crash dumps without blocking the failing path.
#[derive(Debug)]
pub struct Dumper {
    dir: PathBuf,
    last_stamp: AtomicI64,
}

impl Dumper {
    pub fn new(root: &Path) -> Self {
        Self {
            dir: root.join("debug"),
            last_stamp: AtomicI64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Milliseconds since the epoch, bumped so that no two dumps share a name.
    fn next_stamp(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let previous = self
            .last_stamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
            .unwrap_or(now);
        now.max(previous + 1)
    }

    pub fn dump_error(&self, err: &AgentError) -> PathBuf {
        error!(code = err.code(), "{err}");
        self.write(DumpRecord::from_error(err))
    }

    pub fn dump_anyhow(&self, err: &anyhow::Error) -> PathBuf {
        error!("{err:#}");
        self.write(DumpRecord::from_anyhow(err))
    }

    /// Schedule the write and return the file it will land in.
    pub fn write(&self, record: DumpRecord) -> PathBuf {
        let path = self.dir.join(format!("debug_{}.json", self.next_stamp()));
        let dir = self.dir.clone();
        let target = path.clone();
        let body = match serde_json::to_string_pretty(&record) {
            Ok(body) => body,
            Err(e) => {
                warn!("could not serialize dump: {e}");
                return path;
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                        warn!("could not create {}: {e}", dir.display());
                        return;
                    }
                    if let Err(e) = tokio::fs::write(&target, body).await {
                        warn!("could not write dump {}: {e}", target.display());
                    }
                });
            }
            Err(_) => {
                let written = std::fs::create_dir_all(&dir).and_then(|_| std::fs::write(&target, body));
                if let Err(e) = written {
                    warn!("could not write dump {}: {e}", target.display());
                }
            }
        }
        path
    }
}
