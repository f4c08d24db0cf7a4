use legate_amqp::{unix_now, Destination, Envelope, Producer, Return};
use legate_core::AgentContext;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// How long the patrol dozes when nothing is tracked. A
/// [`track`](Watchdog::track) wakes it early.
const IDLE_NAP: Duration = Duration::from_secs(3600);

/// Tracks outstanding asynchronous requests and synthesizes timeout replies
/// for the ones that never come back.
///
/// Every tracked request carries two deadlines: the STARTED deadline
/// (`now + T_started`) and the FINAL deadline (`now + T_started + T_final`).
/// An observed STARTED reply cancels the first; an observed FINAL reply
/// removes the entry. A single patrol worker sleeps until the nearest
/// remaining deadline and, for each overdue entry, delivers a fabricated
/// `RequestTimeout` failure reply to the caller's reply queue — a reply the
/// caller cannot tell apart from a remote-produced one.
///
/// The watchdog never attempts to cancel the remote handler; fabricating the
/// reply is the whole mechanism.
#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<WatchdogInner>,
}

struct WatchdogInner {
    name: Arc<str>,
    table: Mutex<WatchdogTable>,
    wakeup: Notify,
    producer: Producer,
}

/// One tracked request.
struct WatchdogEntry {
    sn: String,
    replyto: String,
    any: Value,
    deadline_started: u64,
    deadline_final: u64,
    started_seen: bool,
}

/// The deadline bookkeeping, kept separate from the I/O so it can be
/// exercised with a hand-rolled clock.
#[derive(Default)]
struct WatchdogTable {
    entries: HashMap<String, WatchdogEntry>,
}

impl WatchdogTable {
    fn track(&mut self, sn: &str, replyto: &str, any: Value, timeout: (u64, u64), now: u64) {
        let (started, finished) = timeout;

        let entry = WatchdogEntry {
            sn: sn.to_string(),
            replyto: replyto.to_string(),
            any,
            deadline_started: now + started,
            deadline_final: now + started + finished,
            started_seen: false,
        };

        self.entries.insert(sn.to_string(), entry);
    }

    /// Marks the STARTED reply as seen, cancelling the first deadline.
    fn started(&mut self, sn: &str) -> bool {
        match self.entries.get_mut(sn) {
            Some(entry) => {
                entry.started_seen = true;
                true
            }
            None => false,
        }
    }

    /// Removes the entry on a FINAL reply.
    fn completed(&mut self, sn: &str) -> bool {
        self.entries.remove(sn).is_some()
    }

    /// Reports the nearest deadline still in force.
    fn next_deadline(&self) -> Option<u64> {
        self.entries
            .values()
            .map(|entry| {
                if entry.started_seen {
                    entry.deadline_final
                } else {
                    entry.deadline_started
                }
            })
            .min()
    }

    /// Removes and returns every overdue entry, paired with the phase index
    /// that expired (`0` for STARTED, `1` for FINAL).
    fn collect_overdue(&mut self, now: u64) -> Vec<(WatchdogEntry, u8)> {
        let overdue_sns = self
            .entries
            .values()
            .filter(|entry| entry.is_overdue(now))
            .map(|entry| entry.sn.clone())
            .collect::<Vec<_>>();

        overdue_sns
            .into_iter()
            .filter_map(|sn| {
                self.entries.remove(&sn).map(|entry| {
                    let index = entry.overdue_phase();
                    (entry, index)
                })
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

impl WatchdogEntry {
    fn is_overdue(&self, now: u64) -> bool {
        if self.started_seen {
            self.deadline_final <= now
        } else {
            self.deadline_started <= now
        }
    }

    fn overdue_phase(&self) -> u8 {
        if self.started_seen {
            1
        } else {
            0
        }
    }
}

impl Watchdog {
    /// Creates the watchdog and starts its patrol worker. The worker stops
    /// when the context terminates.
    pub fn start(producer: Producer, context: &AgentContext) -> Self {
        let name: Arc<str> = Arc::from("rmi:watchdog");

        let watchdog = Self {
            inner: Arc::new(WatchdogInner {
                name: Arc::clone(&name),
                table: Mutex::new(WatchdogTable::default()),
                wakeup: Notify::new(),
                producer,
            }),
        };

        let patrol = Arc::clone(&watchdog.inner);
        let worker_context = context.clone();
        let token = context.register(name.as_ref());

        tokio::spawn(async move {
            patrol.patrol(worker_context).await;
            token.complete();
        });

        watchdog
    }

    /// Starts tracking the request with the given serial number, reply
    /// address, caller data, and `(T_started, T_final)` bounds.
    pub fn track(&self, sn: &str, replyto: &str, any: Value, timeout: (u64, u64)) {
        debug!(
            watchdog = self.inner.name.as_ref(),
            sn, replyto, "Tracking an asynchronous request",
        );

        self.inner
            .table
            .lock()
            .track(sn, replyto, any, timeout, unix_now());

        // The nearest deadline may have moved; the patrol recomputes its nap
        self.inner.wakeup.notify_one();
    }

    /// Records an observed STARTED reply, cancelling the STARTED deadline.
    pub fn started(&self, sn: &str) {
        if self.inner.table.lock().started(sn) {
            debug!(watchdog = self.inner.name.as_ref(), sn, "Request started");
        }
    }

    /// Records an observed FINAL reply, ending the tracking.
    pub fn completed(&self, sn: &str) {
        if self.inner.table.lock().completed(sn) {
            debug!(watchdog = self.inner.name.as_ref(), sn, "Request completed");
        }
    }

    /// Reports how many requests are currently tracked.
    pub fn tracked(&self) -> usize {
        self.inner.table.lock().len()
    }
}

impl WatchdogInner {
    /// The patrol loop: sleep until the nearest deadline, then fabricate
    /// timeout replies for everything overdue.
    async fn patrol(&self, context: AgentContext) {
        info!(watchdog = self.name.as_ref(), "Watchdog patrol started");

        loop {
            let nap = match self.table.lock().next_deadline() {
                Some(deadline) => Duration::from_secs(deadline.saturating_sub(unix_now())),
                None => IDLE_NAP,
            };

            select! {
                biased;
                _ = context.terminated() => break,
                _ = self.wakeup.notified() => continue,
                _ = tokio::time::sleep(nap) => {}
            }

            let overdue = self.table.lock().collect_overdue(unix_now());

            for (entry, index) in overdue {
                self.synthesize_timeout(entry, index).await;
            }
        }

        info!(watchdog = self.name.as_ref(), "Watchdog patrol stopped");
    }

    /// Delivers a fabricated timeout reply for the given overdue entry.
    async fn synthesize_timeout(&self, entry: WatchdogEntry, index: u8) {
        warn!(
            watchdog = self.name.as_ref(),
            sn = entry.sn.as_str(),
            index,
            "Request overdue; synthesizing a timeout reply",
        );

        let destination = match entry.replyto.parse::<Destination>() {
            Ok(destination) => destination,
            Err(error) => {
                warn!(
                    watchdog = self.name.as_ref(),
                    sn = entry.sn.as_str(),
                    ?error,
                    "Cannot deliver a timeout reply to a malformed reply address",
                );
                return;
            }
        };

        let reply = Envelope::for_reply(
            &entry.sn,
            entry.any,
            Return::request_timeout(&entry.sn, index),
        );

        if let Err(error) = self.producer.send(&destination, reply).await {
            warn!(
                watchdog = self.name.as_ref(),
                sn = entry.sn.as_str(),
                ?error,
                error_message = %error,
                "Failed to deliver a synthesized timeout reply",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn table_with(sn: &str, timeout: (u64, u64), now: u64) -> WatchdogTable {
        let mut table = WatchdogTable::default();
        table.track(sn, "c1", json!(null), timeout, now);
        table
    }

    #[test]
    fn started_deadline_expires_first() {
        // Given: tracked at t=100 with (10, 20)
        let mut table = table_with("sn-1", (10, 20), 100);

        // Then
        assert_eq!(table.next_deadline(), Some(110));
        assert!(table.collect_overdue(109).is_empty());

        // When
        let overdue = table.collect_overdue(110);

        // Then: phase 0, entry gone
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].1, 0);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn observed_start_moves_the_deadline_to_final() {
        // Given
        let mut table = table_with("sn-1", (10, 20), 100);

        // When
        assert!(table.started("sn-1"));

        // Then: the STARTED deadline no longer applies
        assert_eq!(table.next_deadline(), Some(130));
        assert!(table.collect_overdue(115).is_empty());

        // When: the FINAL deadline passes
        let overdue = table.collect_overdue(130);

        // Then: phase 1
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].1, 1);
    }

    #[test]
    fn completion_ends_the_tracking() {
        // Given
        let mut table = table_with("sn-1", (10, 20), 100);

        // When
        assert!(table.completed("sn-1"));

        // Then
        assert_eq!(table.len(), 0);
        assert_eq!(table.next_deadline(), None);
        assert!(table.collect_overdue(u64::MAX).is_empty());
    }

    #[test]
    fn unknown_serials_are_ignored() {
        // Given
        let mut table = table_with("sn-1", (10, 20), 100);

        // Then
        assert!(!table.started("sn-2"));
        assert!(!table.completed("sn-2"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn nearest_deadline_wins_across_entries() {
        // Given
        let mut table = WatchdogTable::default();
        table.track("slow", "c1", json!(null), (100, 100), 1000);
        table.track("fast", "c1", json!(null), (5, 100), 1000);

        // Then
        assert_eq!(table.next_deadline(), Some(1005));

        // When: only the fast one is overdue
        let overdue = table.collect_overdue(1005);

        // Then
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].0.sn, "fast");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn overdue_entries_carry_their_reply_address() {
        // Given
        let mut table = WatchdogTable::default();
        table.track("sn-1", "replies-for-c1", json!({"tag": 1}), (1, 1), 0);

        // When
        let overdue = table.collect_overdue(100);

        // Then
        assert_eq!(overdue[0].0.replyto, "replies-for-c1");
        assert_eq!(overdue[0].0.any, json!({"tag": 1}));
    }
}
