//! Bridge Wire Frames
//!
//! The unit of exchange with the native CTP engine. Every ZeroMQ message
//! carries exactly one JSON-encoded [`Frame`], which is either a request
//! (`req` populated) or a response (`res` populated), never both.
//!
//! # Wire Format
//!
//! ```json
//! {"request_id": 7, "req": {"method": "ReqQryTrade", "params": {}}}
//! {"request_id": 7, "res": {"error_code": 0, "error_message": "", "event": "OnRspQryTrade", "value": {}, "is_last": true}}
//! ```
//!
//! Unsolicited engine events (login, settlement, order returns) arrive as
//! response frames with `request_id = 0`.
//!
//! # Return Codes
//!
//! | Code | Meaning | Effect |
//! |------|---------|--------|
//! | `0` | Success | delivered |
//! | `> 0` | Engine business error (`ErrorID`) | delivered in-band |
//! | `-1` | Send failed at the network layer | request fails, engine restart |
//! | `-2` | Unprocessed-request queue saturated | request fails, engine restart |
//! | `-3` | Native request rate exceeded | request fails |
//! | other `< 0` | Protocol fault | request fails |

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Frame
// =============================================================================

/// Request id used by the engine for unsolicited events.
pub const UNSOLICITED_REQUEST_ID: i32 = 0;

/// A single wire frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Correlation id, assigned by the bridge and echoed by the engine.
    pub request_id: i32,
    /// Request body (outbound frames only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req: Option<RequestBody>,
    /// Response body (inbound frames only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub res: Option<ResponseBody>,
}

/// Request half of a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestBody {
    /// Native API method, e.g. `ReqQryTrade`.
    pub method: String,
    /// Method parameters as sent to the engine.
    #[serde(default)]
    pub params: Value,
}

/// Response half of a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseBody {
    /// Engine return code, see [`ReturnCode`].
    pub error_code: i32,
    /// Engine error message (UTF-8 converted by the engine).
    #[serde(default)]
    pub error_message: String,
    /// Native callback name, e.g. `OnRspQryTrade`.
    #[serde(default)]
    pub event: String,
    /// Callback payload, omitted when the engine has none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Whether this frame terminates the reply stream.
    #[serde(default)]
    pub is_last: bool,
}

impl Frame {
    /// Build an outbound request frame.
    #[must_use]
    pub fn request(request_id: i32, method: impl Into<String>, params: Value) -> Self {
        Self {
            request_id,
            req: Some(RequestBody {
                method: method.into(),
                params,
            }),
            res: None,
        }
    }

    /// Build a response frame.
    #[must_use]
    pub const fn response(request_id: i32, res: ResponseBody) -> Self {
        Self {
            request_id,
            req: None,
            res: Some(res),
        }
    }

    /// Decode a frame from raw message bytes.
    ///
    /// # Errors
    ///
    /// Returns `FrameError` if the bytes are not valid JSON for a frame or
    /// if the frame does not carry exactly one of `req` / `res`.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let frame: Self = serde_json::from_slice(bytes)?;
        match (&frame.req, &frame.res) {
            (Some(_), Some(_)) => Err(FrameError::Ambiguous(frame.request_id)),
            (None, None) => Err(FrameError::Empty(frame.request_id)),
            _ => Ok(frame),
        }
    }

    /// Encode the frame to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::Json` if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Whether this is a response frame.
    #[must_use]
    pub const fn is_response(&self) -> bool {
        self.res.is_some()
    }

    /// Whether this response frame ends its reply stream.
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.res.as_ref().is_some_and(|res| res.is_last)
    }

    /// Whether this is an unsolicited engine event.
    #[must_use]
    pub const fn is_unsolicited(&self) -> bool {
        self.request_id == UNSOLICITED_REQUEST_ID && self.res.is_some()
    }

    /// Callback event name, if this is a response frame.
    #[must_use]
    pub fn event(&self) -> Option<&str> {
        self.res.as_ref().map(|res| res.event.as_str())
    }

    /// Response payload, if present.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        self.res.as_ref().and_then(|res| res.value.as_ref())
    }

    /// Request method, if this is a request frame.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        self.req.as_ref().map(|req| req.method.as_str())
    }

    /// Classified return code of a response frame.
    #[must_use]
    pub fn return_code(&self) -> Option<ReturnCode> {
        self.res
            .as_ref()
            .map(|res| ReturnCode::from_code(res.error_code))
    }
}

impl ResponseBody {
    /// Successful terminal response carrying `value`.
    #[must_use]
    pub fn ok(event: impl Into<String>, value: Option<Value>, is_last: bool) -> Self {
        Self {
            error_code: 0,
            error_message: String::new(),
            event: event.into(),
            value,
            is_last,
        }
    }

    /// Error response with the given code.
    #[must_use]
    pub fn error(event: impl Into<String>, error_code: i32, message: impl Into<String>) -> Self {
        Self {
            error_code,
            error_message: message.into(),
            event: event.into(),
            value: None,
            is_last: true,
        }
    }
}

// =============================================================================
// Return Codes
// =============================================================================

/// Classified engine return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    /// `0`: request accepted / callback succeeded.
    Success,
    /// `> 0`: business error reported by the counter, delivered in-band.
    Business(i32),
    /// `-1`: the engine could not send the request over its network link.
    NetworkFailure,
    /// `-2`: the engine's unprocessed-request queue is saturated.
    QueueOverflow,
    /// `-3`: the engine is actively rate limiting requests.
    RateLimited,
    /// Any other negative code.
    Rejected(i32),
}

impl ReturnCode {
    /// Classify a raw `error_code`.
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Success,
            -1 => Self::NetworkFailure,
            -2 => Self::QueueOverflow,
            -3 => Self::RateLimited,
            c if c > 0 => Self::Business(c),
            c => Self::Rejected(c),
        }
    }

    /// Raw code value.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::NetworkFailure => -1,
            Self::QueueOverflow => -2,
            Self::RateLimited => -3,
            Self::Business(c) | Self::Rejected(c) => c,
        }
    }

    /// Whether the request carrying this code has failed.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        self.code() < 0
    }

    /// Whether this code must escalate to an engine restart.
    #[must_use]
    pub const fn triggers_restart(self) -> bool {
        matches!(self, Self::NetworkFailure | Self::QueueOverflow)
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Frame decoding / encoding errors.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Invalid JSON or wrong field types.
    #[error("invalid frame JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Both `req` and `res` were populated.
    #[error("frame {0} carries both a request and a response")]
    Ambiguous(i32),

    /// Neither `req` nor `res` was populated.
    #[error("frame {0} carries neither a request nor a response")]
    Empty(i32),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    #[test]
    fn request_frame_omits_response() {
        let frame = Frame::request(7, "ReqQryTrade", json!({"InvestorID": "1001"}));
        let text = String::from_utf8(frame.encode().unwrap()).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value["request_id"], 7);
        assert_eq!(value["req"]["method"], "ReqQryTrade");
        assert_eq!(value["req"]["params"]["InvestorID"], "1001");
        assert!(value.get("res").is_none());
    }

    #[test]
    fn decode_engine_response() {
        let raw = br#"{"request_id":3,"res":{"error_code":0,"error_message":"","event":"OnRspQryTrade","value":{"TradeID":"1"},"is_last":false}}"#;
        let frame = Frame::decode(raw).unwrap();

        assert_eq!(frame.request_id, 3);
        assert_eq!(frame.event(), Some("OnRspQryTrade"));
        assert_eq!(frame.value().unwrap()["TradeID"], "1");
        assert!(!frame.is_last());
        assert!(frame.is_response());
        assert!(!frame.is_unsolicited());
    }

    #[test]
    fn decode_without_value_or_message() {
        let raw = br#"{"request_id":0,"res":{"error_code":4097,"event":"OnFrontDisconnected","is_last":true}}"#;
        let frame = Frame::decode(raw).unwrap();

        assert!(frame.is_unsolicited());
        assert!(frame.value().is_none());
        assert_eq!(frame.return_code(), Some(ReturnCode::Business(4097)));
    }

    #[test]
    fn decode_rejects_ambiguous_frame() {
        let raw = br#"{"request_id":1,"req":{"method":"X","params":{}},"res":{"error_code":0,"is_last":true}}"#;
        assert!(matches!(Frame::decode(raw), Err(FrameError::Ambiguous(1))));
    }

    #[test]
    fn decode_rejects_empty_frame() {
        assert!(matches!(
            Frame::decode(br#"{"request_id":5}"#),
            Err(FrameError::Empty(5))
        ));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(Frame::decode(b"not json"), Err(FrameError::Json(_))));
        assert!(matches!(
            Frame::decode(br#"{"request_id":"abc","res":{}}"#),
            Err(FrameError::Json(_))
        ));
    }

    #[test_case(0, ReturnCode::Success, false, false; "success")]
    #[test_case(-1, ReturnCode::NetworkFailure, true, true; "network failure")]
    #[test_case(-2, ReturnCode::QueueOverflow, true, true; "queue overflow")]
    #[test_case(-3, ReturnCode::RateLimited, true, false; "rate limited")]
    #[test_case(-9, ReturnCode::Rejected(-9), true, false; "other negative")]
    #[test_case(31, ReturnCode::Business(31), false, false; "business error")]
    fn return_code_classification(code: i32, expected: ReturnCode, failure: bool, restart: bool) {
        let classified = ReturnCode::from_code(code);
        assert_eq!(classified, expected);
        assert_eq!(classified.code(), code);
        assert_eq!(classified.is_failure(), failure);
        assert_eq!(classified.triggers_restart(), restart);
    }
}
