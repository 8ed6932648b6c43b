//! WebSocket push protocol.
//!
//! All frames are JSON text messages tagged by `type`. The server originates
//! `connected`, `update`, `reload`, `error`, `state:init` and `state:update`;
//! clients originate `state:subscribe`, `state:unsubscribe` and
//! `state:change`. Binary frames are not part of the protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message on the hot-reload / shared-state channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HmrMessage {
    /// Greeting sent immediately after the upgrade completes
    #[serde(rename = "connected")]
    Connected {
        /// Milliseconds since the Unix epoch
        timestamp: i64,
    },

    /// A watched file was added or changed; clients hot-swap the module
    #[serde(rename = "update")]
    Update {
        /// Path of the changed file, relative to the watched root
        path: String,
        timestamp: i64,
    },

    /// A watched file was removed; module graphs are stale, full reload
    #[serde(rename = "reload")]
    Reload {
        /// Path of the removed file
        path: String,
        timestamp: i64,
    },

    /// Server-side error surfaced to connected clients
    #[serde(rename = "error")]
    Error {
        /// Human-readable description
        error: String,
        timestamp: i64,
    },

    /// Snapshot sent to a connection right after it subscribes to a key
    #[serde(rename = "state:init")]
    StateInit {
        key: String,
        value: Value,
        timestamp: i64,
    },

    /// A shared-state key changed; sent to subscribed connections only
    #[serde(rename = "state:update")]
    StateUpdate {
        key: String,
        value: Value,
        timestamp: i64,
    },

    /// Client requests updates for a key
    #[serde(rename = "state:subscribe")]
    StateSubscribe { key: String },

    /// Client stops receiving updates for a key
    #[serde(rename = "state:unsubscribe")]
    StateUnsubscribe { key: String },

    /// Client proposes a new value; routed through the same validated `set`
    /// path as server-side writes
    #[serde(rename = "state:change")]
    StateChange { key: String, value: Value },
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    // The JSON shapes below are consumed by the browser client; these are
    // wire-contract tests, not round-trips.

    #[test]
    fn test_connected_json_contract() {
        let msg = HmrMessage::Connected { timestamp: 1000 };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"connected","timestamp":1000}"#);
    }

    #[test]
    fn test_update_json_contract() {
        let msg = HmrMessage::Update {
            path: "src/app.ts".to_string(),
            timestamp: 42,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"type":"update","path":"src/app.ts","timestamp":42}"#
        );
    }

    #[test]
    fn test_state_update_json_contract() {
        let msg = HmrMessage::StateUpdate {
            key: "counter".to_string(),
            value: serde_json::json!(7),
            timestamp: 42,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"type":"state:update","key":"counter","value":7,"timestamp":42}"#
        );
    }

    #[test]
    fn test_client_subscribe_parses() {
        let msg: HmrMessage =
            serde_json::from_str(r#"{"type":"state:subscribe","key":"theme"}"#).unwrap();
        assert_eq!(
            msg,
            HmrMessage::StateSubscribe {
                key: "theme".to_string()
            }
        );
    }

    #[test]
    fn test_client_change_parses() {
        let msg: HmrMessage =
            serde_json::from_str(r#"{"type":"state:change","key":"theme","value":"dark"}"#)
                .unwrap();
        assert_eq!(
            msg,
            HmrMessage::StateChange {
                key: "theme".to_string(),
                value: serde_json::json!("dark"),
            }
        );
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result: Result<HmrMessage, _> =
            serde_json::from_str(r#"{"type":"frobnicate","key":"x"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_now_millis_monotonic_enough() {
        let a = now_millis();
        let b = now_millis();
        assert!(b >= a);
    }
}
