//! Channel payload shapes and wire frames.
//!
//! Three fixed logical channels carry kernel-to-frontend traffic:
//!
//! - `config`: the full requirement state (paths + shims), always sent as
//!   one atomic message
//! - `execute`: a script with its library requirements and the parameter
//!   names to bind inside the frontend wrapper
//! - `safe_execute`: a bare, replayable script with no requirement gating
//!
//! Frames for the framed stream binding are JSON with single-level tagging,
//! `{"type": "comm_msg", ...}` via `#[serde(tag = "type")]`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Target name of the requirement-configuration channel.
pub const CONFIG_TARGET: &str = "config";

/// Target name of the interactive execution channel.
pub const EXECUTE_TARGET: &str = "execute";

/// Target name of the silent/replayable execution channel.
pub const SAFE_EXECUTE_TARGET: &str = "safe_execute";

/// The three channel targets, in the order they are brought up.
pub const CHANNEL_TARGETS: [&str; 3] = [CONFIG_TARGET, EXECUTE_TARGET, SAFE_EXECUTE_TARGET];

/// Full requirement state for the `config` channel.
///
/// The kernel-side store is the single source of truth, so every config
/// message carries the entire merged state rather than a delta. That keeps
/// the frontend's cumulative `require.config` convergent with the kernel
/// even after partial frontend reloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigPayload {
    /// Library key to source path/URL (no `.js` suffix).
    pub paths: IndexMap<String, String>,
    /// Library key to ordered dependency keys that must load first.
    pub shim: IndexMap<String, Vec<String>>,
}

/// A script dispatch on the `execute` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutePayload {
    /// Rendered script text.
    pub script: String,
    /// Suppress frontend display of the execution.
    pub silent: bool,
    /// Library keys the frontend must resolve before running the script.
    pub require: Vec<String>,
    /// Identifier names binding each required library inside the wrapper.
    pub parameters: Vec<String>,
}

/// A script dispatch on the `safe_execute` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafeExecutePayload {
    /// Rendered, block-scoped script text.
    pub script: String,
}

/// Wire frames exchanged over a framed stream binding.
///
/// `comm_open` announces a new channel generation bound to a target name;
/// `comm_msg` carries payload traffic for an already-open channel. Frames
/// flow in both directions: the frontend also opens comms toward the kernel
/// (event traffic) and acknowledges dispatches with `comm_msg` replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireFrame {
    CommOpen {
        comm_id: String,
        target_name: String,
        data: Value,
    },

    CommMsg {
        comm_id: String,
        data: Value,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip_frame(frame: &WireFrame) -> WireFrame {
        let bytes = serde_json::to_vec(frame).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_config_payload_shape() {
        let mut payload = ConfigPayload::default();
        payload
            .paths
            .insert("d3".to_string(), "https://cdn/d3.v5.min".to_string());
        payload
            .shim
            .insert("d3-hexbin".to_string(), vec!["d3".to_string()]);

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json,
            json!({
                "paths": {"d3": "https://cdn/d3.v5.min"},
                "shim": {"d3-hexbin": ["d3"]}
            })
        );
    }

    #[test]
    fn test_execute_payload_shape() {
        let payload = ExecutePayload {
            script: "console.log(d3)".to_string(),
            silent: false,
            require: vec!["d3".to_string()],
            parameters: vec!["d3".to_string()],
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json,
            json!({
                "script": "console.log(d3)",
                "silent": false,
                "require": ["d3"],
                "parameters": ["d3"]
            })
        );
    }

    #[test]
    fn test_comm_open_frame_roundtrip() {
        let frame = WireFrame::CommOpen {
            comm_id: "config.ab12cd34#1700000000000".to_string(),
            target_name: "config".to_string(),
            data: json!({}),
        };

        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("comm_open"));
        assert_eq!(roundtrip_frame(&frame), frame);
    }

    #[test]
    fn test_comm_msg_frame_roundtrip() {
        let frame = WireFrame::CommMsg {
            comm_id: "execute.ab12cd34#1700000000001".to_string(),
            data: json!({"script": "1+1", "silent": true, "require": [], "parameters": []}),
        };

        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("comm_msg"));
        assert_eq!(roundtrip_frame(&frame), frame);
    }

    #[test]
    fn test_config_paths_preserve_insertion_order() {
        let mut payload = ConfigPayload::default();
        for key in ["zeta", "alpha", "mid"] {
            payload.paths.insert(key.to_string(), "p".to_string());
        }

        let json = serde_json::to_string(&payload).unwrap();
        let zeta = json.find("zeta").unwrap();
        let alpha = json.find("alpha").unwrap();
        let mid = json.find("mid").unwrap();
        assert!(zeta < alpha && alpha < mid);
    }
}
