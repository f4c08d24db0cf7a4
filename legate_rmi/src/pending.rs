use legate_amqp::{unix_now, Envelope};
use legate_core::AgentContext;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::select;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

/// How long the drain worker dozes when the store is empty. An
/// [`add`](PendingStore::add) wakes it early, so this only bounds how long a
/// stale clock reading can linger.
const IDLE_NAP: Duration = Duration::from_secs(3600);

/// A durable, time-ordered store of requests waiting for their delivery
/// window to open.
///
/// Entries are ordered by `eligible_at` (the window's `begin`); the drain
/// worker releases them strictly in that order, handing each back to the
/// request consumer for dispatch. The backing journal is append-only — one
/// record per added envelope and one per dispatched serial number — and is
/// compacted on startup by dropping every entry whose serial number was
/// already dispatched.
///
/// The store is bounded: adding beyond the configured limit fails with
/// [`PendingError::Full`].
pub struct PendingStore {
    name: Arc<str>,
    path: PathBuf,
    limit: usize,
    inner: Mutex<PendingState>,
    wakeup: Notify,
}

struct PendingState {
    entries: Vec<PendingEntry>,
    journal: File,
}

struct PendingEntry {
    eligible_at: u64,
    envelope: Envelope,
}

impl PendingEntry {
    fn new(envelope: Envelope) -> Self {
        // A windowless envelope should not reach the store, but if one does,
        // it is eligible immediately
        let eligible_at = envelope
            .window
            .map(|window| window.begin)
            .unwrap_or_else(unix_now);

        Self {
            eligible_at,
            envelope,
        }
    }
}

/// One line of the backing journal.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum JournalRecord {
    /// An envelope entered the store.
    Added {
        /// The stored envelope.
        envelope: Envelope,
    },
    /// The request with this serial number was handed over for dispatch.
    Done {
        /// The dispatched serial number.
        sn: String,
    },
}

/// Represents a failure of the pending store.
#[derive(Error, Debug)]
pub enum PendingError {
    /// The store is at capacity.
    #[error("pending store '{name}' is full ({limit} entries); rejected request {sn}")]
    Full {
        /// The store name.
        name: String,
        /// The configured bound.
        limit: usize,
        /// The rejected serial number.
        sn: String,
    },
    /// The journal could not be read or written.
    #[error("pending journal failure: {0}")]
    Journal(#[from] std::io::Error),
}

impl PendingStore {
    /// Opens (or creates) the store journaled under `dir/<name>.journal`,
    /// replaying and compacting the journal.
    pub fn open(dir: &Path, name: &str, limit: usize) -> Result<Self, PendingError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.journal", name));

        // Replay whatever the journal holds from the previous run
        let survivors = Self::replay(&path)?;

        // Compact: rewrite the journal with only the surviving entries
        let mut journal = File::create(&path)?;
        for envelope in &survivors {
            Self::append(&mut journal, &JournalRecord::Added {
                envelope: envelope.clone(),
            })?;
        }
        drop(journal);

        // Re-open for appending
        let journal = OpenOptions::new().append(true).open(&path)?;

        let mut entries = survivors
            .into_iter()
            .map(PendingEntry::new)
            .collect::<Vec<_>>();
        entries.sort_by_key(|entry| entry.eligible_at);

        if !entries.is_empty() {
            info!(
                store = name,
                entries = entries.len(),
                "Recovered pending requests from the journal",
            );
        }

        Ok(Self {
            name: Arc::from(name),
            path,
            limit,
            inner: Mutex::new(PendingState { entries, journal }),
            wakeup: Notify::new(),
        })
    }

    /// Reads the journal and returns the added envelopes that were never
    /// marked dispatched, in journal order. Malformed lines are logged and
    /// skipped.
    fn replay(path: &Path) -> Result<Vec<Envelope>, PendingError> {
        if !path.exists() {
            return Ok(Vec::new());
        }

        let mut added: Vec<Envelope> = Vec::new();
        let mut done: Vec<String> = Vec::new();

        let reader = BufReader::new(File::open(path)?);
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<JournalRecord>(&line) {
                Ok(JournalRecord::Added { envelope }) => added.push(envelope),
                Ok(JournalRecord::Done { sn }) => done.push(sn),
                Err(error) => {
                    warn!(
                        path = %path.display(),
                        ?error,
                        "Skipped a malformed pending journal line",
                    );
                }
            }
        }

        added.retain(|envelope| !done.contains(&envelope.sn));

        Ok(added)
    }

    fn append(journal: &mut File, record: &JournalRecord) -> Result<(), PendingError> {
        let mut line = serde_json::to_string(record).map_err(|error| {
            PendingError::Journal(std::io::Error::other(error))
        })?;
        line.push('\n');

        journal.write_all(line.as_bytes())?;
        journal.flush()?;

        Ok(())
    }
}

impl PendingStore {
    /// Reports the name of this store.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reports the journal path of this store.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reports how many entries are currently waiting.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Reports whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts the given envelope, ordered by its window's `begin`. Journals
    /// the entry before admitting it, so a crash cannot lose an accepted
    /// request.
    pub fn add(&self, envelope: Envelope) -> Result<(), PendingError> {
        let mut inner = self.inner.lock();

        if inner.entries.len() >= self.limit {
            return Err(PendingError::Full {
                name: self.name.to_string(),
                limit: self.limit,
                sn: envelope.sn.clone(),
            });
        }

        Self::append(&mut inner.journal, &JournalRecord::Added {
            envelope: envelope.clone(),
        })?;

        let entry = PendingEntry::new(envelope);
        let position = inner
            .entries
            .partition_point(|existing| existing.eligible_at <= entry.eligible_at);

        debug!(
            store = self.name.as_ref(),
            sn = entry.envelope.sn.as_str(),
            eligible_at = entry.eligible_at,
            "Parked a future-windowed request",
        );

        inner.entries.insert(position, entry);
        drop(inner);

        // The head may have changed; the drain worker recomputes its nap
        self.wakeup.notify_one();

        Ok(())
    }

    /// Removes and returns the head entry, provided its window has opened by
    /// `now`.
    fn take_due(&self, now: u64) -> Option<Envelope> {
        let mut inner = self.inner.lock();

        match inner.entries.first() {
            Some(head) if head.eligible_at <= now => Some(inner.entries.remove(0).envelope),
            _ => None,
        }
    }

    /// Reports when the head entry becomes eligible, if any.
    fn next_eligible_at(&self) -> Option<u64> {
        self.inner
            .lock()
            .entries
            .first()
            .map(|entry| entry.eligible_at)
    }

    /// Journals that the request with the given serial number has been handed
    /// over for dispatch, so it will not be replayed after a restart.
    pub fn dispatched(&self, sn: &str) {
        let mut inner = self.inner.lock();
        let record = JournalRecord::Done { sn: sn.to_string() };

        if let Err(error) = Self::append(&mut inner.journal, &record) {
            warn!(
                store = self.name.as_ref(),
                sn,
                ?error,
                "Failed to journal a dispatched pending request",
            );
        }
    }

    /// Starts the drain worker: a single task that sleeps until the head
    /// entry's window opens, pops it, and sends it into the returned channel.
    /// The worker stops when the context terminates.
    pub fn start_drain(self: &Arc<Self>, context: &AgentContext) -> mpsc::Receiver<Envelope> {
        let (released, receiver) = mpsc::channel(1);
        let store = Arc::clone(self);
        let worker_context = context.clone();
        let token = context.register(&format!("pending:{}", self.name));

        tokio::spawn(async move {
            store.drain(worker_context, released).await;
            token.complete();
        });

        receiver
    }

    /// The drain loop.
    async fn drain(&self, context: AgentContext, released: mpsc::Sender<Envelope>) {
        loop {
            let nap = match self.next_eligible_at() {
                Some(eligible_at) => {
                    Duration::from_secs(eligible_at.saturating_sub(unix_now()))
                }
                None => IDLE_NAP,
            };

            select! {
                biased;
                _ = context.terminated() => break,
                _ = self.wakeup.notified() => continue,
                _ = tokio::time::sleep(nap) => {}
            }

            // Release everything whose window has opened, in order
            while let Some(envelope) = self.take_due(unix_now()) {
                debug!(
                    store = self.name.as_ref(),
                    sn = envelope.sn.as_str(),
                    "Released a pending request",
                );

                if released.send(envelope).await.is_err() {
                    // The consumer is gone; nothing left to drain for
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use legate_amqp::{Request, Window};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn windowed(sn: &str, begin: u64) -> Envelope {
        Envelope::for_request(Request::function("noop"))
            .with_sn(sn)
            .with_window(Window {
                begin,
                duration: 60,
            })
    }

    #[test]
    fn entries_are_released_in_eligibility_order() {
        // Given
        let dir = TempDir::new().unwrap();
        let store = PendingStore::open(dir.path(), "agent-1", 10).unwrap();

        // When: added out of order
        store.add(windowed("late", 300)).unwrap();
        store.add(windowed("early", 100)).unwrap();
        store.add(windowed("middle", 200)).unwrap();

        // Then: taken in order, honoring `now`
        assert_eq!(store.take_due(50), None);
        assert_eq!(store.take_due(150).unwrap().sn, "early");
        assert_eq!(store.take_due(150), None);
        assert_eq!(store.take_due(400).unwrap().sn, "middle");
        assert_eq!(store.take_due(400).unwrap().sn, "late");
    }

    #[test]
    fn equal_eligibility_preserves_arrival_order() {
        // Given
        let dir = TempDir::new().unwrap();
        let store = PendingStore::open(dir.path(), "agent-1", 10).unwrap();

        // When
        store.add(windowed("first", 100)).unwrap();
        store.add(windowed("second", 100)).unwrap();

        // Then
        assert_eq!(store.take_due(100).unwrap().sn, "first");
        assert_eq!(store.take_due(100).unwrap().sn, "second");
    }

    #[test]
    fn the_bound_is_enforced() {
        // Given
        let dir = TempDir::new().unwrap();
        let store = PendingStore::open(dir.path(), "agent-1", 2).unwrap();
        store.add(windowed("a", 100)).unwrap();
        store.add(windowed("b", 100)).unwrap();

        // When
        let error = store.add(windowed("c", 100)).unwrap_err();

        // Then
        assert!(matches!(error, PendingError::Full { limit: 2, .. }));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn restart_recovers_undispatched_entries() {
        // Given
        let dir = TempDir::new().unwrap();
        {
            let store = PendingStore::open(dir.path(), "agent-1", 10).unwrap();
            store.add(windowed("done", 100)).unwrap();
            store.add(windowed("kept", 200)).unwrap();
            store.dispatched("done");
        }

        // When
        let store = PendingStore::open(dir.path(), "agent-1", 10).unwrap();

        // Then
        assert_eq!(store.len(), 1);
        assert_eq!(store.take_due(300).unwrap().sn, "kept");
    }

    #[test]
    fn compaction_rewrites_the_journal() {
        // Given
        let dir = TempDir::new().unwrap();
        {
            let store = PendingStore::open(dir.path(), "agent-1", 10).unwrap();
            store.add(windowed("done", 100)).unwrap();
            store.add(windowed("kept", 200)).unwrap();
            store.dispatched("done");
        }

        // When
        let store = PendingStore::open(dir.path(), "agent-1", 10).unwrap();
        let journal = std::fs::read_to_string(store.path()).unwrap();

        // Then: one surviving record, no tombstones
        assert_eq!(journal.lines().count(), 1);
        assert!(journal.contains("kept"));
        assert!(!journal.contains("done"));
    }

    #[tokio::test]
    async fn drain_worker_releases_due_entries() {
        // Given
        let dir = TempDir::new().unwrap();
        let store = Arc::new(PendingStore::open(dir.path(), "agent-1", 10).unwrap());
        let context = AgentContext::new();
        let mut released = store.start_drain(&context);

        // When: the window opened in the past, so release is immediate
        store.add(windowed("due", unix_now() - 1)).unwrap();

        // Then
        let envelope = tokio::time::timeout(Duration::from_secs(2), released.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.sn, "due");

        // Finally
        context.terminate();
    }
}
