//! Well-known message type numbers.
//!
//! Positive numbers are commands (the sender expects a reply), negative
//! numbers are replies or pushed data.  `0` is never used by applications.

// Commands understood by every data-producing module.
pub const ON: i8 = 1;
pub const OFF: i8 = 2;
/// Payload: `u32` timestamp, `0` for the newest sample.
pub const GET_DATA: i8 = 3;
/// Payload: `u32` requested period in ms, `u32` data mailbox address.
pub const GET_CONT_DATA: i8 = 4;
/// Payload: `u32` data mailbox address.
pub const STOP_CONT_DATA: i8 = 5;
pub const SET_LOG: i8 = 6;
pub const GET_STATUS: i8 = 7;
/// Payload: `u32` data mailbox address.  Delivers the next sample once.
pub const GET_NEXT_DATA: i8 = 8;

// Replies.
pub const OK: i8 = -1;
pub const ERROR: i8 = -2;
pub const TIMEOUT: i8 = -3;
pub const NOT_AVAILABLE: i8 = -4;
pub const ENABLED: i8 = -5;
pub const DISABLED: i8 = -6;
pub const DATA: i8 = -7;
/// Payload: `u32` achieved period in ms.
pub const CONT_DATA: i8 = -8;

/// Human-readable name for logs.
pub fn name(msg_type: i8) -> &'static str {
    match msg_type {
        ON => "ON",
        OFF => "OFF",
        GET_DATA => "GET_DATA",
        GET_CONT_DATA => "GET_CONT_DATA",
        STOP_CONT_DATA => "STOP_CONT_DATA",
        SET_LOG => "SET_LOG",
        GET_STATUS => "GET_STATUS",
        GET_NEXT_DATA => "GET_NEXT_DATA",
        OK => "OK",
        ERROR => "ERROR",
        TIMEOUT => "TIMEOUT",
        NOT_AVAILABLE => "NOT_AVAILABLE",
        ENABLED => "ENABLED",
        DISABLED => "DISABLED",
        DATA => "DATA",
        CONT_DATA => "CONT_DATA",
        t if t > 0 => "COMMAND",
        _ => "REPLY",
    }
}
