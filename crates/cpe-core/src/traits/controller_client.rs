// # Controller Client Trait
//
// Defines the interface for calls to the upstream controller.
//
// ## Purpose
//
// The agent pushes liveness transitions, WAN address changes, HA role
// changes and heartbeats to the controller, and pulls the full
// configuration document from it.
//
// ## Success Rule
//
// A call succeeds only when the transport returns HTTP 200 AND the body is
// a JSON envelope with `success == true` and `ret == 0`. Anything else is
// an error; callers keep their own dirty flags and retry on the next tick.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Response envelope used by every controller endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerReply {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub ret: i64,
    #[serde(default)]
    pub code: Value,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub data: Value,
}

impl ControllerReply {
    /// Check the body-level success rule and hand back `data`
    pub fn into_data(self) -> Result<Value, crate::Error> {
        if self.success && self.ret == 0 {
            Ok(self.data)
        } else {
            Err(crate::Error::controller(format!(
                "controller rejected request: ret={} code={} msg={}",
                self.ret, self.code, self.msg
            )))
        }
    }
}

/// Trait for controller client implementations
///
/// # Trust Level: Untrusted (Network Boundary)
///
/// ## Allowed Capabilities
/// - ✅ Perform HTTP(S) calls to the configured controller only
/// - ✅ Parse the response envelope
///
/// ## Forbidden Capabilities
/// - ❌ Retry or back off (owned by the calling loop)
/// - ❌ Cache responses
/// - ❌ Access the config store
#[async_trait]
pub trait ControllerClient: Send + Sync {
    /// PUT a JSON body to an API path
    ///
    /// # Parameters
    ///
    /// - `path`: Absolute API path, e.g. `/api/cpeConfig/cpes/{sn}/heartbeat`
    /// - `body`: JSON body
    ///
    /// # Returns
    ///
    /// - `Ok(Value)`: The envelope's `data` member
    /// - `Err(Error::Controller)`: Transport, status, or envelope failure
    async fn put(&self, path: &str, body: &Value) -> Result<Value, crate::Error>;

    /// GET an API path
    ///
    /// # Returns
    ///
    /// - `Ok(Value)`: The envelope's `data` member
    /// - `Err(Error::Controller)`: Transport, status, or envelope failure
    async fn get(&self, path: &str) -> Result<Value, crate::Error>;
}

/// Helper trait for constructing controller clients from configuration
pub trait ControllerClientFactory: Send + Sync {
    /// Create a ControllerClient instance from configuration
    fn create(&self, config: &Value) -> Result<Box<dyn ControllerClient>, crate::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_success_requires_ret_zero() {
        let ok: ControllerReply =
            serde_json::from_value(json!({"success": true, "ret": 0, "data": {"v": 1}})).unwrap();
        assert_eq!(ok.into_data().unwrap(), json!({"v": 1}));

        let bad_ret: ControllerReply =
            serde_json::from_value(json!({"success": true, "ret": 3})).unwrap();
        assert!(bad_ret.into_data().is_err());

        let not_success: ControllerReply =
            serde_json::from_value(json!({"success": false, "ret": 0, "msg": "denied"})).unwrap();
        let err = not_success.into_data().unwrap_err();
        assert!(err.to_string().contains("denied"));
    }
}
