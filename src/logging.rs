//! Logger setup and the per-run log file.
//!
//! The global logger writes every formatted record to stderr. Records logged on a thread
//! that has entered a run (through [`RunLog::attach`] or [`RunLogHandle::enter`]) are also
//! written to that run's `train.log`, so concurrent runs in one process keep separate
//! files. Worker threads receive a [`RunLogHandle`] and enter it before doing any work.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::cell::Cell;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

pub const RUN_LOG_FILE: &str = "train.log";

static RUN_LOGS: OnceLock<Mutex<HashMap<u64, BufWriter<File>>>> = OnceLock::new();
static NEXT_RUN_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_RUN: Cell<Option<u64>> = const { Cell::new(None) };
}

fn run_logs() -> &'static Mutex<HashMap<u64, BufWriter<File>>> {
    RUN_LOGS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn current_run() -> Option<u64> {
    CURRENT_RUN.with(Cell::get)
}

/// Installs the global logger. `verbose` lowers the default filter to `debug`; `RUST_LOG`
/// still wins when set.
pub fn init(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let env = env_logger::Env::default().default_filter_or(default_filter);
    let _ = env_logger::Builder::from_env(env)
        .target(env_logger::Target::Pipe(Box::new(TeeWriter)))
        .try_init();
}

/// Sends log output to stderr and to the run log of the calling thread, if any.
struct TeeWriter;

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        if let Some(id) = current_run() {
            if let Ok(mut logs) = run_logs().lock() {
                if let Some(writer) = logs.get_mut(&id) {
                    writer.write_all(buf)?;
                }
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        if let Some(id) = current_run() {
            if let Ok(mut logs) = run_logs().lock() {
                if let Some(writer) = logs.get_mut(&id) {
                    writer.flush()?;
                }
            }
        }
        Ok(())
    }
}

/// Cheap, sendable reference to an attached run log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLogHandle {
    id: u64,
}

impl RunLogHandle {
    /// Routes this thread's records into the run log until the scope is dropped.
    pub fn enter(&self) -> RunLogScope {
        let previous = CURRENT_RUN.with(|current| current.replace(Some(self.id)));
        RunLogScope {
            previous,
            _not_send: PhantomData,
        }
    }
}

/// Restores the thread's previous run log on drop.
pub struct RunLogScope {
    previous: Option<u64>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for RunLogScope {
    fn drop(&mut self) {
        CURRENT_RUN.with(|current| current.set(self.previous));
    }
}

/// Owner of one run's `train.log`. The attaching thread is entered for the guard's
/// lifetime; the file is finished and closed on drop.
pub struct RunLog {
    path: PathBuf,
    handle: RunLogHandle,
    _scope: RunLogScope,
}

impl RunLog {
    pub fn attach(dir: &Path) -> Result<Self> {
        let path = dir.join(RUN_LOG_FILE);
        let file = File::create(&path)
            .with_context(|| format!("Failed to create run log {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "training run started {}", Utc::now().to_rfc3339())
            .with_context(|| format!("Failed to write run log {}", path.display()))?;

        let handle = RunLogHandle {
            id: NEXT_RUN_ID.fetch_add(1, Ordering::SeqCst),
        };
        run_logs()
            .lock()
            .map_err(|_| anyhow!("Run log lock poisoned"))?
            .insert(handle.id, writer);
        Ok(Self {
            path,
            handle,
            _scope: handle.enter(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn handle(&self) -> RunLogHandle {
        self.handle
    }
}

impl Drop for RunLog {
    fn drop(&mut self) {
        if let Ok(mut logs) = run_logs().lock() {
            if let Some(mut writer) = logs.remove(&self.handle.id) {
                let finished = Utc::now().to_rfc3339();
                let _ = writeln!(writer, "training run finished {finished}");
                let _ = writer.flush();
            }
        }
    }
}
