//! External commit wake channel
//!
//! Every coordinator owns a wake channel anchored at `<path>.note`. Commits
//! signal it: the running signal count is written to the note file as a
//! little-endian `u64`, and when automatic change notifications are enabled
//! a listener thread turns each signal into a coordinator pass. Signals
//! arriving while a pass runs are coalesced into one follow-up pass.

use parking_lot::{Condvar, Mutex};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::thread::{JoinHandle, ThreadId};

use strata_core::{StrataError, StrataResult};
use strata_storage::sibling;
use tracing::{debug, trace, warn};

use crate::coordinator::Coordinator;

#[derive(Debug, Default)]
struct Signal {
    pending: u64,
    total: u64,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct WakeShared {
    signal: Mutex<Signal>,
    cond: Condvar,
}

struct Listener {
    thread: JoinHandle<()>,
    id: ThreadId,
}

/// Commit signal shared by every handle on one file
pub struct ExternalWake {
    note_path: PathBuf,
    note: File,
    shared: Arc<WakeShared>,
    listener: Mutex<Option<Listener>>,
}

impl ExternalWake {
    /// Create the channel for the database at `path`
    ///
    /// Fails when `<path>.note` cannot be created, e.g. because a directory
    /// exists under that name.
    pub fn new(path: &Path) -> StrataResult<Self> {
        let note_path = sibling(path, "note");
        let note_error = |e: io::Error| {
            StrataError::WakeChannel(format!(
                "failed to create notification file '{}': {}",
                note_path.display(),
                e
            ))
        };
        let note = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&note_path)
            .map_err(note_error)?;
        let total = read_count(&note).map_err(note_error)?;
        let shared = WakeShared {
            signal: Mutex::new(Signal {
                total,
                ..Signal::default()
            }),
            cond: Condvar::new(),
        };
        Ok(ExternalWake {
            note_path,
            note,
            shared: Arc::new(shared),
            listener: Mutex::new(None),
        })
    }

    /// Path of the `.note` file
    pub fn note_path(&self) -> &Path {
        &self.note_path
    }

    /// Signal that a commit happened
    pub fn notify(&self) {
        let mut signal = self.shared.signal.lock();
        signal.pending += 1;
        signal.total += 1;
        if let Err(e) = write_count(&self.note, signal.total) {
            warn!(
                target: "strata::coord",
                note = %self.note_path.display(),
                error = %e,
                "Failed to record wake signal"
            );
        }
        trace!(target: "strata::coord", pending = signal.pending, "Wake signalled");
        self.shared.cond.notify_all();
    }

    /// Signals recorded in the note file so far
    pub fn signal_count(&self) -> u64 {
        self.shared.signal.lock().total
    }

    /// Whether a listener thread is running
    pub fn is_listening(&self) -> bool {
        self.listener.lock().is_some()
    }

    /// Start the listener thread if it is not running yet
    ///
    /// The listener holds only a weak reference and exits when the
    /// coordinator is gone.
    pub(crate) fn start_listener(&self, coordinator: Weak<Coordinator>) -> StrataResult<()> {
        let mut listener = self.listener.lock();
        if listener.is_some() {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let thread = std::thread::Builder::new()
            .name("strata-wake".to_string())
            .spawn(move || listen(&shared, &coordinator))
            .map_err(|e| StrataError::WakeChannel(format!("failed to spawn listener: {}", e)))?;
        let id = thread.thread().id();
        *listener = Some(Listener { thread, id });
        debug!(target: "strata::coord", note = %self.note_path.display(), "Wake listener started");
        Ok(())
    }

    fn stop_listener(&self) {
        {
            let mut signal = self.shared.signal.lock();
            signal.shutdown = true;
            self.shared.cond.notify_all();
        }
        if let Some(listener) = self.listener.lock().take() {
            // The listener may hold the last coordinator reference itself.
            if listener.id != std::thread::current().id() {
                let _ = listener.thread.join();
            }
        }
    }
}

impl Drop for ExternalWake {
    fn drop(&mut self) {
        self.stop_listener();
    }
}

fn read_count(mut file: &File) -> io::Result<u64> {
    let mut bytes = [0u8; 8];
    file.seek(SeekFrom::Start(0))?;
    match file.read_exact(&mut bytes) {
        Ok(()) => Ok(u64::from_le_bytes(bytes)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(0),
        Err(e) => Err(e),
    }
}

fn write_count(mut file: &File, count: u64) -> io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&count.to_le_bytes())
}

fn listen(shared: &WakeShared, coordinator: &Weak<Coordinator>) {
    loop {
        {
            let mut signal = shared.signal.lock();
            while signal.pending == 0 && !signal.shutdown {
                shared.cond.wait(&mut signal);
            }
            if signal.shutdown {
                return;
            }
            signal.pending = 0;
        }
        match coordinator.upgrade() {
            Some(coordinator) => coordinator.on_change(),
            None => return,
        }
    }
}
