//! JSON-RPC frames exchanged over the persistent channel.
//!
//! Three frame shapes travel over the wire:
//! - request: `{"id": <int>, "method": <string>, "params": <any>}`
//! - response: `{"id": <int>, "result": <any>}` or `{"id": <int>, "error": <any>}`
//! - notice: `{"method": "notice", "params": [<subscribeId>, <payload>]}`

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::TypesError;

/// Method name carried by server-push notifications.
pub const NOTICE_METHOD: &str = "notice";

/// A request frame sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, unique per channel.
    pub id: u64,
    /// Remote method name.
    pub method: String,
    /// Method parameters.
    pub params: Value,
}

impl Request {
    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TypesError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TypesError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A response frame correlated to a request by id.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Id of the request this answers.
    pub id: u64,
    /// `Ok(result)` or `Err(error payload)`.
    pub outcome: Result<Value, Value>,
}

impl Response {
    /// A successful response.
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            outcome: Ok(result),
        }
    }

    /// An error response.
    pub fn err(id: u64, error: Value) -> Self {
        Self {
            id,
            outcome: Err(error),
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TypesError> {
        let frame = match &self.outcome {
            Ok(result) => json!({ "id": self.id, "result": result }),
            Err(error) => json!({ "id": self.id, "error": error }),
        };
        Ok(serde_json::to_vec(&frame)?)
    }
}

/// A server-push notification routed to a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    /// The subscription id the server was given at subscribe time.
    pub subscribe_id: u64,
    /// Notification payload.
    pub payload: Value,
}

impl Notice {
    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TypesError> {
        let frame = json!({
            "method": NOTICE_METHOD,
            "params": [self.subscribe_id, self.payload],
        });
        Ok(serde_json::to_vec(&frame)?)
    }
}

/// Any frame the client can receive.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Answer to a pending request.
    Response(Response),
    /// Push notification for a subscription.
    Notice(Notice),
}

impl Inbound {
    /// Parse an inbound frame.
    ///
    /// A frame whose `method` is `"notice"` is a notice; anything else must
    /// carry a numeric `id` and exactly one of `result` / `error`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TypesError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let mut object = match value {
            Value::Object(map) => map,
            other => {
                return Err(TypesError::InvalidFrame(format!(
                    "expected object, got {}",
                    kind_of(&other)
                )))
            }
        };

        if object.get("method").and_then(Value::as_str) == Some(NOTICE_METHOD) {
            return parse_notice(&mut object).map(Inbound::Notice);
        }

        let id = object
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| TypesError::InvalidFrame("missing numeric id".into()))?;

        match (object.remove("result"), object.remove("error")) {
            (_, Some(error)) if !error.is_null() => Ok(Inbound::Response(Response::err(id, error))),
            (Some(result), _) => Ok(Inbound::Response(Response::ok(id, result))),
            _ => Err(TypesError::InvalidFrame(format!(
                "response {} has neither result nor error",
                id
            ))),
        }
    }
}

fn parse_notice(object: &mut Map<String, Value>) -> Result<Notice, TypesError> {
    let params = match object.remove("params") {
        Some(Value::Array(params)) => params,
        _ => return Err(TypesError::InvalidFrame("notice params must be an array".into())),
    };
    let mut params = params.into_iter();
    let subscribe_id = params
        .next()
        .and_then(|v| v.as_u64())
        .ok_or_else(|| TypesError::InvalidFrame("notice missing subscribe id".into()))?;
    let payload = params.next().unwrap_or(Value::Null);
    Ok(Notice {
        subscribe_id,
        payload,
    })
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Params wrapper for a subscribe call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeParams {
    /// Id the server must echo in notices.
    pub subscribe_id: u64,
    /// Caller-chosen logical key.
    pub subscribe_key: String,
    /// The method's own params.
    pub params: Value,
}

/// Params wrapper for an unsubscribe call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeParams {
    /// Id of the subscription being cancelled.
    pub unsubscribe_id: u64,
    /// Caller-chosen logical key.
    pub subscribe_key: String,
    /// The method's own params.
    pub params: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_shape() {
        let request = Request {
            id: 7,
            method: "fetchWallet".into(),
            params: json!({"publicKey": "02ab"}),
        };
        let value: Value = serde_json::from_slice(&request.to_bytes().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"id": 7, "method": "fetchWallet", "params": {"publicKey": "02ab"}})
        );
    }

    #[test]
    fn parses_result_response() {
        let inbound = Inbound::from_bytes(br#"{"id":3,"result":{"ok":true}}"#).unwrap();
        assert_eq!(inbound, Inbound::Response(Response::ok(3, json!({"ok": true}))));
    }

    #[test]
    fn null_result_is_still_a_result() {
        let inbound = Inbound::from_bytes(br#"{"id":3,"result":null}"#).unwrap();
        assert_eq!(inbound, Inbound::Response(Response::ok(3, Value::Null)));
    }

    #[test]
    fn parses_error_response() {
        let inbound = Inbound::from_bytes(br#"{"id":4,"error":"Conflict"}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::Response(Response::err(4, json!("Conflict")))
        );
    }

    #[test]
    fn parses_notice() {
        let inbound =
            Inbound::from_bytes(br#"{"method":"notice","params":[12,{"status":"Ok"}]}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::Notice(Notice {
                subscribe_id: 12,
                payload: json!({"status": "Ok"}),
            })
        );
    }

    #[test]
    fn response_without_id_is_invalid() {
        let result = Inbound::from_bytes(br#"{"result":1}"#);
        assert!(matches!(result, Err(TypesError::InvalidFrame(_))));
    }

    #[test]
    fn non_object_frame_is_invalid() {
        let result = Inbound::from_bytes(b"[1,2,3]");
        assert!(matches!(result, Err(TypesError::InvalidFrame(_))));
    }

    #[test]
    fn garbage_is_json_error() {
        let result = Inbound::from_bytes(b"not json");
        assert!(matches!(result, Err(TypesError::Json(_))));
    }

    #[test]
    fn response_and_notice_serialize_to_parseable_frames() {
        let response = Response::err(9, json!({"message": "NotFound"}));
        let parsed = Inbound::from_bytes(&response.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, Inbound::Response(response));

        let notice = Notice {
            subscribe_id: 2,
            payload: json!("changed"),
        };
        let parsed = Inbound::from_bytes(&notice.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, Inbound::Notice(notice));
    }

    #[test]
    fn subscribe_params_use_camel_case() {
        let params = SubscribeParams {
            subscribe_id: 1,
            subscribe_key: "k".into(),
            params: json!([]),
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(
            value,
            json!({"subscribeId": 1, "subscribeKey": "k", "params": []})
        );
    }
}
