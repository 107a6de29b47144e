//! The HTTP/1.1 side of the bridge.
//!
//! Requests are assembled, not parsed: the start line and headers come
//! straight from SPDY stream state, body bytes pass through untouched.
//! Responses are the opposite: an incremental parser that eats whatever
//! the origin socket produced and emits head/body/completion events.

mod encode;
mod parse;

pub use encode::encode_request;
pub use parse::{ParseError, ResponseEvent, ResponseHead, ResponseParser};
