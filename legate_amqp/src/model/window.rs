use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// A declarative delivery-eligibility interval on a request.
///
/// The window opens at `begin` (Unix seconds) and stays open for `duration`
/// seconds. Relative to a clock reading, a window is in exactly one of three
/// states: [`Future`](Eligibility::Future) (not yet open),
/// [`Present`](Eligibility::Present) (open), or [`Past`](Eligibility::Past)
/// (already closed). A request without a window is always present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    /// When the window opens, in Unix seconds.
    pub begin: u64,
    /// How long the window stays open, in seconds.
    pub duration: u64,
}

/// The state of a [`Window`] relative to a clock reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    /// The window has already closed.
    Past,
    /// The window is open.
    Present,
    /// The window has not opened yet.
    Future,
}

impl Window {
    /// Reports whether this window has already closed at the given time.
    pub fn past(&self, now: u64) -> bool {
        now > self.begin.saturating_add(self.duration)
    }

    /// Reports whether this window has not yet opened at the given time.
    pub fn future(&self, now: u64) -> bool {
        now < self.begin
    }

    /// Evaluates this window against the given time.
    pub fn eligibility(&self, now: u64) -> Eligibility {
        if self.future(now) {
            Eligibility::Future
        } else if self.past(now) {
            Eligibility::Past
        } else {
            Eligibility::Present
        }
    }

    /// Evaluates an optional window against the given time; an absent window
    /// is always present.
    pub fn eligibility_of(window: Option<&Window>, now: u64) -> Eligibility {
        match window {
            Some(window) => window.eligibility(now),
            None => Eligibility::Present,
        }
    }
}

/// Reads the system clock as Unix seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const WINDOW: Window = Window {
        begin: 100,
        duration: 60,
    };

    #[test]
    fn exactly_one_state_holds() {
        for now in [0, 99, 100, 130, 160, 161, 10_000] {
            let states = [
                WINDOW.future(now),
                WINDOW.eligibility(now) == Eligibility::Present,
                WINDOW.past(now),
            ];

            assert_eq!(
                states.iter().filter(|held| **held).count(),
                1,
                "now={}",
                now,
            );
        }
    }

    #[test]
    fn boundaries_are_inclusive() {
        // Open exactly at `begin`
        assert_eq!(WINDOW.eligibility(100), Eligibility::Present);
        // Still open exactly at `begin + duration`
        assert_eq!(WINDOW.eligibility(160), Eligibility::Present);
        // Closed one second later
        assert_eq!(WINDOW.eligibility(161), Eligibility::Past);
    }

    #[test]
    fn absent_window_is_always_present() {
        assert_eq!(Window::eligibility_of(None, 0), Eligibility::Present);
        assert_eq!(
            Window::eligibility_of(None, u64::MAX),
            Eligibility::Present,
        );
    }

    #[test]
    fn wire_round_trip() {
        let text = serde_json::to_string(&WINDOW).unwrap();
        let decoded: Window = serde_json::from_str(&text).unwrap();

        assert_eq!(decoded, WINDOW);
    }
}
