//! Client-side shipper streaming slow-control measurements to a MIDAS
//! data-acquisition server.
//!
//! Producers submit named, timestamped values through [`DataPacker`];
//! submissions accumulate in per-variable banks and a background loop
//! packs them into LVBANK / GEA1 events (see the `fegem-wire` crate) and
//! ships them over short-lived TCP connections, honouring the event size
//! the server advertises.

pub mod bank;
pub mod packer;
pub mod service;
pub mod sink;
mod transport;

pub use {
    bank::DataBank,
    fegem_wire::{LvTimestamp, Payload},
    packer::{DataPacker, FatalError, RUN_NUMBER_UNKNOWN},
    service::LoadProbe,
    sink::{GzCsvSink, Sink},
};
