use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// The outcome of a dispatched request, as carried in the `result` field of a
/// reply envelope.
///
/// The two variants are mutually exclusive on the wire: a succeeded outcome
/// carries only `retval`, a failed one carries the exception descriptor
/// (`exval` message, `xclass` kind, `xmodule` origin, `xstate` structured
/// state including the captured trace, `xargs` raw arguments).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Return {
    /// The handler returned a value.
    Succeeded {
        /// The returned value.
        retval: Value,
    },
    /// The handler (or the dispatch machinery) failed.
    Failed {
        /// The human-readable failure message.
        exval: String,
        /// The module path where the failure originated, when known.
        #[serde(default, skip_serializing_if = "String::is_empty")]
        xmodule: String,
        /// The failure kind (error type name).
        #[serde(default, skip_serializing_if = "String::is_empty")]
        xclass: String,
        /// Structured failure state; `xstate["trace"]` carries the trace text.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        xstate: BTreeMap<String, Value>,
        /// Raw failure arguments.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        xargs: Vec<Value>,
    },
}

/// Failure kind raised when the dispatch target cannot be resolved.
pub const KIND_NOT_FOUND: &str = "NotFound";
/// Failure kind raised when a request's delivery window has already closed.
pub const KIND_WINDOW_MISSED: &str = "WindowMissed";
/// Failure kind synthesized by the watchdog for overdue requests.
pub const KIND_REQUEST_TIMEOUT: &str = "RequestTimeout";
/// Failure kind raised when the pending store is at capacity.
pub const KIND_PENDING_FULL: &str = "PendingFull";

impl Return {
    /// Creates a succeeded outcome carrying the given value.
    pub fn succeeded(retval: Value) -> Self {
        Self::Succeeded { retval }
    }

    /// Creates a failed outcome from a captured handler failure.
    pub fn exception(
        kind: impl Into<String>,
        message: impl Into<String>,
        trace: Option<String>,
    ) -> Self {
        let message = message.into();
        let mut xstate = BTreeMap::new();
        if let Some(trace) = trace {
            xstate.insert("trace".to_string(), Value::String(trace));
        }

        Self::Failed {
            exval: message.clone(),
            xmodule: String::new(),
            xclass: kind.into(),
            xstate,
            xargs: vec![Value::String(message)],
        }
    }

    /// Creates the failed outcome for an unresolved dispatch target.
    pub fn not_found(target: &str) -> Self {
        let mut outcome = Self::exception(
            KIND_NOT_FOUND,
            format!("target '{}' is not registered", target),
            None,
        );
        if let Self::Failed { xstate, .. } = &mut outcome {
            xstate.insert("target".to_string(), json!(target));
        }

        outcome
    }

    /// Creates the failed outcome for a request whose window has passed.
    pub fn window_missed(sn: &str) -> Self {
        let mut outcome = Self::exception(
            KIND_WINDOW_MISSED,
            format!("window missed for request {}", sn),
            None,
        );
        if let Self::Failed { xstate, .. } = &mut outcome {
            xstate.insert("sn".to_string(), json!(sn));
        }

        outcome
    }

    /// Creates the failed outcome synthesized for a timed-out request. The
    /// `index` names the phase that timed out: `0` for STARTED, `1` for FINAL.
    pub fn request_timeout(sn: &str, index: u8) -> Self {
        let mut outcome = Self::exception(
            KIND_REQUEST_TIMEOUT,
            format!("request {} timed out (phase {})", sn, index),
            None,
        );
        if let Self::Failed { xstate, xargs, .. } = &mut outcome {
            xstate.insert("sn".to_string(), json!(sn));
            xstate.insert("index".to_string(), json!(index));
            *xargs = vec![json!(sn), json!(index)];
        }

        outcome
    }

    /// Creates the failed outcome for a request rejected by a full pending
    /// store.
    pub fn pending_full(sn: &str) -> Self {
        let mut outcome = Self::exception(
            KIND_PENDING_FULL,
            format!("pending store is full; request {} rejected", sn),
            None,
        );
        if let Self::Failed { xstate, .. } = &mut outcome {
            xstate.insert("sn".to_string(), json!(sn));
        }

        outcome
    }
}

impl Return {
    /// Reports whether this outcome represents success.
    pub fn is_succeeded(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    /// Reports whether this outcome represents failure.
    pub fn failed(&self) -> bool {
        !self.is_succeeded()
    }

    /// Exposes the returned value of a succeeded outcome.
    pub fn retval(&self) -> Option<&Value> {
        match self {
            Self::Succeeded { retval } => Some(retval),
            Self::Failed { .. } => None,
        }
    }

    /// Exposes the failure kind of a failed outcome.
    pub fn kind(&self) -> Option<&str> {
        match self {
            Self::Succeeded { .. } => None,
            Self::Failed { xclass, .. } => Some(xclass),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn variants_are_mutually_exclusive() {
        let good = Return::succeeded(json!(42));
        let bad = Return::exception("ValueError", "bad", None);

        assert!(good.is_succeeded() && !good.failed());
        assert!(bad.failed() && !bad.is_succeeded());
        assert_eq!(good.retval(), Some(&json!(42)));
        assert_eq!(bad.retval(), None);
    }

    #[test]
    fn wire_shape_of_success() {
        let outcome = Return::succeeded(json!("hi"));

        let text = serde_json::to_string(&outcome).unwrap();

        assert_eq!(text, r#"{"retval":"hi"}"#);
    }

    #[test]
    fn wire_shape_of_failure_discriminates_on_decode() {
        let outcome = Return::exception("ValueError", "bad", Some("trace text".to_string()));

        let text = serde_json::to_string(&outcome).unwrap();
        let decoded: Return = serde_json::from_str(&text).unwrap();

        assert_eq!(decoded, outcome);
        assert_eq!(decoded.kind(), Some("ValueError"));
    }

    #[test]
    fn null_retval_still_means_success() {
        let decoded: Return = serde_json::from_str(r#"{"retval":null}"#).unwrap();

        assert!(decoded.is_succeeded());
    }

    #[test]
    fn timeout_outcome_carries_phase_index() {
        let outcome = Return::request_timeout("sn-1", 1);

        match &outcome {
            Return::Failed { xstate, xclass, .. } => {
                assert_eq!(xclass, KIND_REQUEST_TIMEOUT);
                assert_eq!(xstate.get("index"), Some(&json!(1)));
                assert_eq!(xstate.get("sn"), Some(&json!("sn-1")));
            }
            Return::Succeeded { .. } => panic!("expected a failed outcome"),
        }
    }
}
