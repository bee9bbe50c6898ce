//! Outbound protocol messages

use serde::Serialize;
use serde_json::{json, Value};

/// Reply sent for every printer heartbeat
pub const HEARTBEAT_REPLY: &str = "ok";

/// `{"method": ..., "params": {...}}` envelope
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    pub method: Method,
    pub params: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Get,
    Set,
}

impl Request {
    pub fn get(params: Value) -> Self {
        Self {
            method: Method::Get,
            params,
        }
    }

    pub fn set(params: Value) -> Self {
        Self {
            method: Method::Set,
            params,
        }
    }

    /// Full printer parameter dump; doubles as the liveness probe.
    pub fn printer_info() -> Self {
        Self::get(json!({ "reqPrinterPara": 1 }))
    }

    /// CFS box and slot dump
    pub fn cfs_info() -> Self {
        Self::get(json!({ "boxsInfo": 1 }))
    }

    pub fn to_text(&self) -> String {
        // Serialising a struct of a unit enum and a Value cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        assert_eq!(
            Request::printer_info().to_text(),
            r#"{"method":"get","params":{"reqPrinterPara":1}}"#
        );
        assert_eq!(
            Request::set(json!({ "pause": 1 })).to_text(),
            r#"{"method":"set","params":{"pause":1}}"#
        );
    }
}
