//! Relay call request/response structures

use mibridge_core::{RpcError, StateMap, StateValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::IpAddr;

/// Device information method, answered by every device
pub const METHOD_INFO: &str = "miIO.info";

/// Property read method
pub const METHOD_GET_PROP: &str = "get_prop";

/// Body of `POST {relay}/call`
#[derive(Debug, Serialize)]
pub struct CallRequest<'a> {
    pub address: IpAddr,
    pub port: u16,
    pub token: &'a str,
    pub id: u32,
    pub method: &'a str,
    pub params: &'a [Value],
}

#[derive(Debug, Deserialize)]
pub struct CallResponse {
    #[serde(default)]
    pub id: Option<u32>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<CallError>,
}

#[derive(Debug, Deserialize)]
pub struct CallError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// Subset of the `miIO.info` reply we use
#[derive(Debug, Deserialize)]
pub struct InfoResult {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub fw_ver: Option<String>,
}

impl CallResponse {
    /// Check the reply belongs to call `id` and extract its result
    pub fn into_result(self, id: u32) -> Result<Value, RpcError> {
        if let Some(error) = self.error {
            return Err(RpcError::Rejected {
                code: error.code,
                message: error.message,
            });
        }
        if let Some(resp_id) = self.id {
            if resp_id != id {
                return Err(RpcError::InvalidResponse(format!(
                    "Call id mismatch: expected {}, got {}",
                    id, resp_id
                )));
            }
        }
        self.result
            .ok_or_else(|| RpcError::InvalidResponse("Reply has neither result nor error".into()))
    }
}

/// Pair a `get_prop` result array back up with the keys that were asked for.
/// Null entries mean the device does not know the property and are skipped.
pub fn zip_properties(keys: &[&str], result: Value) -> Result<StateMap, RpcError> {
    let Value::Array(values) = result else {
        return Err(RpcError::InvalidResponse("get_prop result is not an array".into()));
    };
    if values.len() != keys.len() {
        return Err(RpcError::InvalidResponse(format!(
            "get_prop returned {} values for {} keys",
            values.len(),
            keys.len()
        )));
    }

    let mut state = StateMap::new();
    for (key, value) in keys.iter().zip(values) {
        if value.is_null() {
            continue;
        }
        let value: StateValue = serde_json::from_value(value)
            .map_err(|e| RpcError::InvalidResponse(format!("{}: {}", key, e)))?;
        state.insert(key.to_string(), value);
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_encoding() {
        let params = [json!("power")];
        let req = CallRequest {
            address: "192.168.1.40".parse().unwrap(),
            port: 54321,
            token: "00112233445566778899aabbccddeeff",
            id: 7,
            method: METHOD_GET_PROP,
            params: &params,
        };
        let encoded = serde_json::to_value(&req).unwrap();
        assert_eq!(encoded["address"], "192.168.1.40");
        assert_eq!(encoded["method"], "get_prop");
        assert_eq!(encoded["params"], json!(["power"]));
        assert_eq!(encoded["id"], 7);
    }

    #[test]
    fn test_error_reply() {
        let resp: CallResponse =
            serde_json::from_value(json!({"id": 3, "error": {"code": -5001, "message": "busy"}}))
                .unwrap();
        match resp.into_result(3) {
            Err(RpcError::Rejected { code, message }) => {
                assert_eq!(code, -5001);
                assert_eq!(message, "busy");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_id_mismatch() {
        let resp: CallResponse = serde_json::from_value(json!({"id": 4, "result": ["ok"]})).unwrap();
        assert!(matches!(resp.into_result(3), Err(RpcError::InvalidResponse(_))));
    }

    #[test]
    fn test_zip_properties() {
        let state = zip_properties(&["power", "temperature", "mode"], json!(["on", 41, null])).unwrap();
        assert_eq!(state.get("power"), Some(&StateValue::Text("on".into())));
        assert_eq!(state.get("temperature"), Some(&StateValue::Int(41)));
        assert!(!state.contains_key("mode"));

        assert!(zip_properties(&["power"], json!(["on", "off"])).is_err());
        assert!(zip_properties(&["power"], json!({"power": "on"})).is_err());
    }
}
