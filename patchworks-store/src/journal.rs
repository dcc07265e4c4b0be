//! The journal is a stream of JSON Patch (RFC 6902) events. Replaying all
//! events from an empty document yields the store state.
//!
//! Events are appended, never rewritten, so the file doubles as a record of
//! every write the engine made.

use anyhow::{bail, Result};
use chrono::Utc;
use serde_json::{de::IoRead, Deserializer, StreamDeserializer};
use std::{
    fs::{File, OpenOptions},
    io::{self, Read as _, Seek as _, Write},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::memory::STATE_TYPE;

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct JournalEvent {
    pub index: u64,
    pub meta: JournalEventMeta,
    pub patch: json_patch::Patch,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct JournalEventMeta {
    pub time: String,
    #[serde(flatten)]
    pub other_fields: serde_json::Value,
}

impl JournalEvent {
    pub fn new(index: u64, operation: &str, patch: json_patch::Patch) -> JournalEvent {
        JournalEvent {
            index,
            meta: JournalEventMeta {
                time: Utc::now().to_rfc3339(),
                other_fields: serde_json::json!({ "operation": operation }),
            },
            patch,
        }
    }
}

/// The events of a journal file, checked to start with the initial event.
pub struct JournalEventStream<'a, R: io::Read> {
    pending_first: Option<JournalEvent>,
    rest: StreamDeserializer<'a, IoRead<R>, JournalEvent>,
}

impl<'a, R: io::Read> JournalEventStream<'a, R> {
    pub fn open_from_reader(reader: R) -> Result<JournalEventStream<'a, R>> {
        let mut rest = Deserializer::from_reader(reader).into_iter::<JournalEvent>();
        let first = match rest.next() {
            None => bail!("store journal is empty"),
            Some(Err(e)) => bail!("store journal does not start with a valid event: {}", e),
            Some(Ok(first)) => first,
        };
        if first.index != 0 {
            bail!(
                "store journal starts at event {} instead of 0; it may be truncated",
                first.index
            );
        }
        Ok(JournalEventStream {
            pending_first: Some(first),
            rest,
        })
    }
}

impl<'a, R: io::Read> Iterator for JournalEventStream<'a, R> {
    type Item = Result<JournalEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.pending_first.take() {
            Some(first) => Some(Ok(first)),
            None => self.rest.next().map(|r| Ok(r?)),
        }
    }
}

/// Logs while a lock acquisition is taking long, for instance because
/// another process holds the journal.
///
/// Quiet for the first half second, then reports every five seconds until
/// dropped.
pub struct SlowWaitLogger {
    finished: Arc<AtomicBool>,
}

impl SlowWaitLogger {
    const GRACE: Duration = Duration::from_millis(500);
    const REPEAT: Duration = Duration::from_secs(5);

    pub fn start(what: &'static str) -> SlowWaitLogger {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        std::thread::spawn(move || {
            let started = Instant::now();
            let mut report_at = started + Self::GRACE;
            while !flag.load(Ordering::Relaxed) {
                std::thread::sleep(report_at.saturating_duration_since(Instant::now()));
                if flag.load(Ordering::Relaxed) {
                    return;
                }
                tracing::info!(waited_secs = started.elapsed().as_secs(), "{}", what);
                report_at += Self::REPEAT;
            }
        });
        SlowWaitLogger { finished }
    }
}

impl Drop for SlowWaitLogger {
    fn drop(&mut self) {
        self.finished.store(true, Ordering::Relaxed);
    }
}

pub struct JournalHandle {
    file: Arc<File>,
    locking: fd_lock::RwLock<Arc<File>>,
    /// The end of the last event this handle read or wrote
    known_size: u64,
}

impl JournalHandle {
    /// Opens the journal at `path`, creating it with the initial event if it
    /// does not exist. Returns whether it was created.
    pub fn open_or_create<P: AsRef<Path>>(path: P) -> Result<(JournalHandle, bool)> {
        let created = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(true)
            .open(path.as_ref());
        match created {
            Ok(file) => {
                let mut handle = Self::from_file(file);
                handle.lock()?.append(&[&Self::init_event()])?;
                Ok((handle, true))
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let file = OpenOptions::new().read(true).append(true).open(path)?;
                Ok((Self::from_file(file), false))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn from_file(file: File) -> JournalHandle {
        let file = Arc::new(file);
        JournalHandle {
            locking: fd_lock::RwLock::new(file.clone()),
            file,
            known_size: 0,
        }
    }

    /// The state described by the initial event of a new journal.
    pub fn initial_state() -> serde_json::Value {
        serde_json::json!({
            "_type": STATE_TYPE,
            "objects": {},
        })
    }

    fn init_event() -> JournalEvent {
        JournalEvent::new(
            0,
            "init",
            json_patch::Patch(vec![json_patch::PatchOperation::Add(
                json_patch::AddOperation {
                    path: "".parse().expect("empty path"),
                    value: Self::initial_state(),
                },
            )]),
        )
    }

    /// Whether another writer appended since this handle last looked.
    pub fn has_unread_events(&self) -> Result<bool> {
        Ok(self.file.metadata()?.len() != self.known_size)
    }

    /// Takes the exclusive lock that every reader-then-writer of the journal
    /// holds, across processes.
    pub fn lock(&mut self) -> Result<JournalLock<'_>> {
        let JournalHandle {
            file,
            locking,
            known_size,
        } = self;
        let _waiting = SlowWaitLogger::start("Waiting for the store journal lock");
        let guard = locking.write()?;
        Ok(JournalLock {
            _guard: guard,
            file: &**file,
            known_size,
        })
    }
}

/// Exclusive access to the journal file, released on drop.
pub struct JournalLock<'a> {
    _guard: fd_lock::RwLockWriteGuard<'a, Arc<File>>,
    file: &'a File,
    known_size: &'a mut u64,
}

impl JournalLock<'_> {
    /// Reads the events appended since the handle last read or wrote. When
    /// nothing has been read yet, this is the whole journal, which must
    /// start with the initial event.
    pub fn read_new_events(&mut self) -> Result<Vec<JournalEvent>> {
        let mut file = self.file;
        file.seek(io::SeekFrom::Start(*self.known_size))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let events = if *self.known_size == 0 {
            JournalEventStream::open_from_reader(bytes.as_slice())?.collect::<Result<Vec<_>>>()?
        } else {
            Deserializer::from_slice(&bytes)
                .into_iter::<JournalEvent>()
                .collect::<std::result::Result<Vec<_>, _>>()?
        };
        *self.known_size += bytes.len() as u64;
        Ok(events)
    }

    pub fn append(&mut self, events: &[&JournalEvent]) -> Result<()> {
        let mut file = self.file;
        let pos = file.seek(io::SeekFrom::End(0))?;
        if pos != *self.known_size {
            tracing::error!(
                foreign_bytes_start = *self.known_size,
                foreign_bytes_end = pos,
                "Detected concurrent writing to the journal; the store may need manual repair"
            );
            bail!("store journal has events that were not read before writing");
        }
        let mut writer = io::BufWriter::new(file);
        for event in events {
            // Pretty printed for humans; the journal is the audit record.
            serde_json::to_writer_pretty(&mut writer, event)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        drop(writer);

        *self.known_size = file.stream_position()?;
        Ok(())
    }
}

pub fn apply_journal_event(state: &mut serde_json::Value, event: &JournalEvent) -> Result<()> {
    json_patch::patch(state, event.patch.0.as_slice()).map_err(Into::into)
}

pub fn apply_journal_events(
    state: &mut serde_json::Value,
    events: impl Iterator<Item = Result<JournalEvent>>,
) -> Result<u64> {
    let mut count = 0;
    for event in events {
        apply_journal_event(state, &event?)?;
        count += 1;
    }
    Ok(count)
}
