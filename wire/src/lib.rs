//! Binary wire format spoken over the GEM slow-control DAQ link.
//!
//! Three framing layers, innermost first:
//!
//! * LVDATA — one timestamped record: a 16-byte LabVIEW timestamp followed
//!   by a fixed-width payload.
//! * LVBANK (`GEB1`) — an 88-byte header plus the concatenated LVDATA
//!   records of one named variable.
//! * superbank (`GEA1`) — a 16-byte header plus concatenated LVBANK
//!   records, shipped as a single event.
//!
//! All integers are little-endian. Strings are truncated, UTF-8 encoded and
//! right-padded with NUL to their header field width.

pub mod bank_format;
pub mod payload;
pub mod timestamp;

pub use {
    bank_format::{host_byte_order, BankHeader, ParsedBank, SuperBankHeader, WireError},
    payload::{DataType, Payload},
    timestamp::{LvTimestamp, LV_TIMESTAMP_LEN},
};
