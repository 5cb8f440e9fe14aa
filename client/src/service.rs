//! Background workers: the periodic flush loop and the optional host-load
//! sampler.

use {
    crate::{packer::PackerCore, transport},
    fegem_wire::{LvTimestamp, Payload},
    gethostname::gethostname,
    log::*,
    std::{
        sync::{atomic::Ordering, Arc},
        thread::{self, sleep, Builder, JoinHandle},
        time::{Duration, Instant},
    },
};

/// Cadence of the background flush loop.
const FLUSH_TICK: Duration = Duration::from_secs(1);

/// Cadence of the CPU/memory self-telemetry submissions.
const LOAD_SAMPLE_INTERVAL: Duration = Duration::from_secs(60);

/// Sampler for host load, e.g. backed by procfs or a sysinfo wrapper.
/// Returns per-CPU busy percentages followed by the memory use percentage.
/// Any `FnMut() -> Vec<f64> + Send` qualifies.
pub trait LoadProbe: Send {
    fn sample(&mut self) -> Vec<f64>;
}

impl<F> LoadProbe for F
where
    F: FnMut() -> Vec<f64> + Send,
{
    fn sample(&mut self) -> Vec<f64> {
        self()
    }
}

/// Drains the bank registry once per tick and ships the packed event.
pub(crate) struct FlushService {
    thread_hdl: JoinHandle<()>,
}

impl FlushService {
    pub(crate) fn new(core: Arc<PackerCore>) -> Self {
        let thread_hdl = Builder::new()
            .name("gemFlush".to_string())
            .spawn(move || Self::run(&core))
            .unwrap();
        Self { thread_hdl }
    }

    fn run(core: &PackerCore) {
        let host = gethostname().into_string().unwrap_or_default();
        let program = std::env::args().next().unwrap_or_default();
        core.announce_on_speaker(
            "THISHOST",
            &format!("New connection from {host} PROGRAM:{program}"),
        );

        while !core.exit.load(Ordering::Relaxed) {
            if core.pause_logging.load(Ordering::Relaxed) {
                sleep(FLUSH_TICK);
                continue;
            }

            let packing_start = Instant::now();
            core.inject_periodic_requests();

            let pending = core.banks_to_flush();
            if pending == 0 {
                trace!("nothing to flush");
                sleep(FLUSH_TICK);
                continue;
            }

            let packet = core.flush();
            core.check_packet_length(packet.len());

            let packing_time = packing_start.elapsed();
            debug!(
                "packed {pending} banks into {} bytes, {:.1}% of the tick",
                packet.len(),
                100.0 * packing_time.as_secs_f64() / FLUSH_TICK.as_secs_f64(),
            );
            sleep(FLUSH_TICK.saturating_sub(packing_time));
            transport::send_with_timeout(core, &packet, transport::SEND_TIMEOUT);
        }
        trace!("flush loop exit");
    }

    pub(crate) fn join(self) -> thread::Result<()> {
        self.thread_hdl.join()
    }
}

/// Submits the probe's samples as a `THISHOST/CPUMEM` double array once
/// per minute.
pub(crate) struct LoadMonitorService {
    thread_hdl: JoinHandle<()>,
}

impl LoadMonitorService {
    pub(crate) fn new(core: Arc<PackerCore>, mut probe: Box<dyn LoadProbe>) -> Self {
        let thread_hdl = Builder::new()
            .name("gemLoadMon".to_string())
            .spawn(move || {
                while !core.exit.load(Ordering::Relaxed) {
                    let samples = probe.sample();
                    debug!("logging CPUMEM {samples:?}");
                    core.add_data(
                        "THISHOST",
                        "CPUMEM",
                        "",
                        0,
                        10,
                        LvTimestamp::now(),
                        Payload::Double(samples),
                        false,
                    );
                    let wake = Instant::now() + LOAD_SAMPLE_INTERVAL;
                    while Instant::now() < wake {
                        if core.exit.load(Ordering::Relaxed) {
                            return;
                        }
                        sleep(Duration::from_secs(1));
                    }
                }
            })
            .unwrap();
        Self { thread_hdl }
    }

    pub(crate) fn join(self) -> thread::Result<()> {
        self.thread_hdl.join()
    }
}
