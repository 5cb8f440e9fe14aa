//! The packer: an ordered registry of banks plus the negotiated session
//! state. Create one [`DataPacker`] per process and share it across
//! producer threads.

use {
    crate::{
        bank::DataBank,
        service::{FlushService, LoadMonitorService, LoadProbe},
        sink::{GzCsvSink, Sink},
        transport,
    },
    fegem_wire::{
        bank_format::{pad_fixed, SuperBankHeader, CATEGORY_LEN, SUPERBANK_HEADER_LEN, VARNAME_LEN},
        LvTimestamp, Payload,
    },
    log::*,
    std::{
        collections::BTreeSet,
        sync::{
            atomic::{AtomicBool, AtomicU32, Ordering},
            Arc, Condvar, Mutex,
        },
        thread,
    },
    thiserror::Error,
};

/// Flush budget assumed until the server advertises its event size.
const DEFAULT_EVENT_SIZE: usize = 10_000;

/// Consecutive overflowing ticks tolerated before complaining on the
/// speaker and starting over.
const BUFFER_OVERFLOW_ANNOUNCE_THRESHOLD: u32 = 100;

/// Run number sentinel: never observed.
pub const RUN_NUMBER_UNKNOWN: i32 = -99;

/// Variable names whose submissions never coalesce into an existing bank.
/// Speaker messages and command requests are order-sensitive.
const ORDERED_VARNAMES: [&str; 2] = ["TALK", "COMMAND"];

/// Conditions the client does not try to survive. Routed through a hook so
/// tests can observe them; the default hook logs and exits the process.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FatalError {
    #[error("server signalled a fatal error: {0}")]
    ServerError(String),
    #[error("outgoing packet of {len} bytes exceeds the advertised event size of {max_event_size}")]
    OversizedPacket { len: usize, max_event_size: usize },
}

pub type FatalHook = Box<dyn Fn(&FatalError) + Send + Sync>;

fn default_fatal_hook(error: &FatalError) {
    error!("{error}");
    std::process::exit(1);
}

/// Session fields negotiated with the server and refreshed by every reply.
pub(crate) struct SessionState {
    pub run_number: i32,
    pub run_status: String,
    pub max_event_size: i64,
    /// Worker endpoint for data traffic; starts at the supervisor and may
    /// be rebound by `SendToAddress` / `SendToPort`.
    pub address: String,
    pub port: u16,
    pub frontend_status: String,
    pub midas_time: f64,
}

pub(crate) struct PackerCore {
    pub(crate) server_host: String,
    pub(crate) supervisor_port: u16,
    /// Ordered bank list; order fixes the superbank layout.
    banks: Mutex<Vec<Arc<DataBank>>>,
    pub(crate) session: Mutex<SessionState>,
    pub(crate) session_changed: Condvar,
    periodic_requests: Mutex<BTreeSet<&'static str>>,
    buffer_overflow_count: AtomicU32,
    bank_array_id: AtomicU32,
    sink: Mutex<Option<Box<dyn Sink>>>,
    pub(crate) pause_logging: AtomicBool,
    pub(crate) exit: AtomicBool,
    fatal_hook: FatalHook,
}

impl PackerCore {
    pub(crate) fn new(server_host: &str, supervisor_port: u16) -> Self {
        Self {
            server_host: server_host.to_string(),
            supervisor_port,
            banks: Mutex::new(Vec::new()),
            session: Mutex::new(SessionState {
                run_number: RUN_NUMBER_UNKNOWN,
                run_status: String::new(),
                max_event_size: -1,
                address: server_host.to_string(),
                port: supervisor_port,
                frontend_status: String::new(),
                midas_time: 0.0,
            }),
            session_changed: Condvar::new(),
            periodic_requests: Mutex::new(BTreeSet::new()),
            buffer_overflow_count: AtomicU32::new(0),
            bank_array_id: AtomicU32::new(0),
            sink: Mutex::new(None),
            pause_logging: AtomicBool::new(false),
            exit: AtomicBool::new(false),
            fatal_hook: Box::new(default_fatal_hook),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_fatal_hook(mut self, hook: FatalHook) -> Self {
        self.fatal_hook = hook;
        self
    }

    pub(crate) fn fatal(&self, error: FatalError) {
        (self.fatal_hook)(&error);
    }

    /// Route one measurement into its bank, creating the bank on first
    /// sight. Never returns an error to the producer.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn add_data(
        &self,
        category: &str,
        varname: &str,
        description: &str,
        history_settings: i16,
        history_rate: i16,
        timestamp: LvTimestamp,
        payload: Payload,
        insert_front: bool,
    ) {
        if let Some(sink) = self.sink.lock().unwrap().as_mut() {
            sink.write_row(&timestamp, category, varname, &payload);
        }

        let category_padded: [u8; CATEGORY_LEN] = pad_fixed(category);
        let varname_padded: [u8; VARNAME_LEN] = pad_fixed(varname);
        let data = payload.to_bytes();

        let mut banks = self.banks.lock().unwrap();
        if !ORDERED_VARNAMES.contains(&varname) {
            if let Some(bank) = banks
                .iter()
                .find(|bank| bank.matches(&category_padded, &varname_padded))
                .cloned()
            {
                drop(banks);
                bank.append(timestamp, &data);
                return;
            }
        }

        let bank = Arc::new(DataBank::new(
            payload.data_type(),
            category,
            varname,
            description,
            history_settings,
            history_rate,
        ));
        bank.append(timestamp, &data);
        if insert_front {
            banks.insert(0, bank);
        } else {
            banks.push(bank);
        }
    }

    pub(crate) fn announce_on_speaker(&self, category: &str, message: &str) {
        info!("speaker [{category}]: {message}");
        self.add_data(
            category,
            "TALK",
            "\0",
            0,
            0,
            LvTimestamp::now(),
            Payload::from(message),
            true,
        );
    }

    /// Queue a control command for the next packet.
    pub(crate) fn queue_command(&self, command: &str, payload: Payload) {
        self.add_data(
            "THISHOST",
            "COMMAND",
            command,
            0,
            0,
            LvTimestamp::now(),
            payload,
            false,
        );
    }

    pub(crate) fn add_periodic_request(&self, token: &'static str) {
        if self.periodic_requests.lock().unwrap().insert(token) {
            debug!("periodic request registered: {token}");
        }
    }

    /// Queue one command per registered periodic token so the next packet
    /// carries the requests.
    pub(crate) fn inject_periodic_requests(&self) {
        let tokens: Vec<&'static str> = self
            .periodic_requests
            .lock()
            .unwrap()
            .iter()
            .copied()
            .collect();
        for token in tokens {
            self.queue_command(token, Payload::Bytes(vec![0]));
        }
    }

    pub(crate) fn banks_to_flush(&self) -> usize {
        self.banks
            .lock()
            .unwrap()
            .iter()
            .filter(|bank| bank.pending() > 0)
            .count()
    }

    fn flush_budget(&self) -> usize {
        let max_event_size = self.session.lock().unwrap().max_event_size;
        if max_event_size > 0 {
            max_event_size as usize
        } else {
            DEFAULT_EVENT_SIZE
        }
    }

    /// Pack pending records from `banks` into zero, one, or one superbank
    /// of bytes. A single bank ships as a bare LVBANK; several pending
    /// banks are wrapped in a GEA1 container in list order.
    pub(crate) fn flush_banks(&self, banks: &[Arc<DataBank>]) -> Vec<u8> {
        // One tick without overflow pays one unit of the counter back.
        let _ = self
            .buffer_overflow_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                count.checked_sub(1)
            });

        let budget = self.flush_budget();
        if banks.is_empty() {
            return Vec::new();
        }
        if banks.len() == 1 {
            return banks[0].flush(self, budget);
        }
        {
            let mut pending = banks.iter().filter(|bank| bank.pending() > 0);
            if let (Some(only), None) = (pending.next(), pending.next()) {
                return only.flush(self, budget);
            }
        }

        let mut remaining = budget.saturating_sub(SUPERBANK_HEADER_LEN);
        let mut lump = Vec::new();
        let mut bank_count = 0_u32;
        for bank in banks {
            if bank.pending() == 0 {
                continue;
            }
            // A bank whose smallest record no longer fits is skipped; the
            // rest of the list still gets its chance.
            let chunk = bank.flush(self, remaining);
            if chunk.is_empty() {
                continue;
            }
            remaining = remaining.saturating_sub(chunk.len());
            lump.extend_from_slice(&chunk);
            bank_count += 1;
        }

        let header = SuperBankHeader {
            array_id: self.bank_array_id.fetch_add(1, Ordering::Relaxed),
            payload_len: lump.len() as u32,
            bank_count,
        };
        debug!(
            "superbank {}: {} banks, {} payload bytes",
            header.array_id,
            bank_count,
            lump.len(),
        );
        let mut packet = Vec::with_capacity(SUPERBANK_HEADER_LEN + lump.len());
        header.encode_into(&mut packet);
        packet.extend_from_slice(&lump);
        packet
    }

    /// Flush the live bank list.
    pub(crate) fn flush(&self) -> Vec<u8> {
        let banks = self.banks.lock().unwrap().clone();
        self.flush_banks(&banks)
    }

    /// A packet larger than the advertised event size means the producer is
    /// outrunning the link by configuration; give up rather than ship data
    /// the server will reject.
    pub(crate) fn check_packet_length(&self, len: usize) {
        let max_event_size = self.session.lock().unwrap().max_event_size;
        if max_event_size > 0 && len > max_event_size as usize {
            error!(
                "safety limit: logging too much data too fast ({}kB > {}kB); raise the event size in the ODB",
                len / 1000,
                max_event_size / 1000,
            );
            self.fatal(FatalError::OversizedPacket {
                len,
                max_event_size: max_event_size as usize,
            });
        }
    }

    pub(crate) fn note_buffer_overflow(&self) {
        let count = self.buffer_overflow_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count > BUFFER_OVERFLOW_ANNOUNCE_THRESHOLD {
            self.announce_on_speaker(
                "THISHOST",
                "DataPacker limited by data rate for more than a minute",
            );
            self.buffer_overflow_count.store(0, Ordering::Relaxed);
        }
    }

    pub(crate) fn buffer_overflow_count(&self) -> u32 {
        self.buffer_overflow_count.load(Ordering::Relaxed)
    }

    pub(crate) fn get_run_number(&self) -> i32 {
        self.add_periodic_request("GET_RUNNO");
        let session = self.session.lock().unwrap();
        let session = self
            .session_changed
            .wait_while(session, |session| session.run_number < 0)
            .unwrap();
        session.run_number
    }

    pub(crate) fn get_run_status(&self) -> String {
        self.add_periodic_request("GET_STATUS");
        let session = self.session.lock().unwrap();
        let session = self
            .session_changed
            .wait_while(session, |session| session.run_status.is_empty())
            .unwrap();
        session.run_status.clone()
    }

    pub(crate) fn set_sink(&self, sink: Box<dyn Sink>) {
        *self.sink.lock().unwrap() = Some(sink);
    }
}

/// Thread-safe entry point for producers. One per process; clones of the
/// inner state are shared with the background services.
pub struct DataPacker {
    core: Arc<PackerCore>,
    flush_service: Option<FlushService>,
    load_monitor: Option<LoadMonitorService>,
}

impl DataPacker {
    /// Negotiate a session with the supervisor endpoint and start the
    /// background flush loop. Blocks until the server answers the
    /// handshake. `max_event_size` of zero leaves the limit to the server.
    pub fn new(server_host: &str, initial_port: u16, max_event_size: i64) -> Self {
        let core = Arc::new(PackerCore::new(server_host, initial_port));
        transport::run_handshake(&core, max_event_size);
        let flush_service = FlushService::new(Arc::clone(&core));
        Self {
            core,
            flush_service: Some(flush_service),
            load_monitor: None,
        }
    }

    /// Queue one measurement. `insert_front` makes the variable's bank the
    /// first of the next superbank. Accepts anything convertible into a
    /// [`Payload`]; errors are never reported back to the producer.
    #[allow(clippy::too_many_arguments)]
    pub fn add_data(
        &self,
        category: &str,
        varname: &str,
        description: &str,
        history_settings: i16,
        history_rate: i16,
        timestamp: LvTimestamp,
        payload: impl Into<Payload>,
        insert_front: bool,
    ) {
        self.core.add_data(
            category,
            varname,
            description,
            history_settings,
            history_rate,
            timestamp,
            payload.into(),
            insert_front,
        );
    }

    /// Put a message on the MIDAS speaker ahead of the queued data.
    pub fn announce_on_speaker(&self, category: &str, message: &str) {
        self.core.announce_on_speaker(category, message);
    }

    /// Current run number. The first call blocks until the server has
    /// answered a `GET_RUNNO` request; later calls return the cached value.
    pub fn get_run_number(&self) -> i32 {
        self.core.get_run_number()
    }

    /// Current run status, with the same first-call behaviour as
    /// [`Self::get_run_number`].
    pub fn get_run_status(&self) -> String {
        self.core.get_run_status()
    }

    /// Tee every accepted submission into a local gzip-compressed CSV log.
    pub fn turn_on_test_mode(&self) {
        self.core.set_sink(Box::new(GzCsvSink::new()));
    }

    pub fn turn_on_debug_mode(&self) {
        self.core
            .queue_command("ENABLE_DEBUG_MODE", Payload::Bytes(vec![0]));
    }

    pub fn turn_off_debug_mode(&self) {
        self.core
            .queue_command("DISABLE_DEBUG_MODE", Payload::Bytes(vec![0]));
    }

    /// Suspend the background flush loop; queued data stays in memory.
    pub fn pause_logging(&self) {
        self.core.pause_logging.store(true, Ordering::Relaxed);
    }

    pub fn resume_logging(&self) {
        self.core.pause_logging.store(false, Ordering::Relaxed);
    }

    /// Start the once-per-minute CPU/memory self-telemetry, fed by `probe`.
    pub fn spawn_load_monitor(&mut self, probe: Box<dyn LoadProbe>) {
        if self.load_monitor.is_none() {
            self.load_monitor = Some(LoadMonitorService::new(Arc::clone(&self.core), probe));
        }
    }

    /// Ask the background services to exit at their next check point.
    /// In-flight and queued data is not drained.
    pub fn stop(&self) {
        self.core.exit.store(true, Ordering::Relaxed);
    }

    /// Stop and wait for the background services to wind down.
    pub fn join(mut self) -> thread::Result<()> {
        self.stop();
        if let Some(service) = self.flush_service.take() {
            service.join()?;
        }
        if let Some(service) = self.load_monitor.take() {
            service.join()?;
        }
        Ok(())
    }
}

impl Drop for DataPacker {
    fn drop(&mut self) {
        self.core.exit.store(true, Ordering::Relaxed);
    }
}
