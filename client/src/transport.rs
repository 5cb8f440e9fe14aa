//! Session negotiation and the per-flush TCP exchange.
//!
//! Every send opens a fresh connection to whatever worker endpoint the
//! session currently names, ships one packet, and reads one JSON object
//! back. The reply refreshes the session state and may rebind the worker
//! endpoint for the next send.

use {
    crate::{
        bank::DataBank,
        packer::{FatalError, PackerCore},
    },
    fegem_wire::{LvTimestamp, Payload},
    gethostname::gethostname,
    log::*,
    serde::Deserialize,
    std::{
        io::{ErrorKind, Read, Write},
        net::{Shutdown, TcpStream},
        sync::Arc,
        thread::sleep,
        time::Duration,
    },
};

const RECV_CHUNK_SIZE: usize = 1024;
pub(crate) const SEND_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const REFUSED_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Keys the server may include in a reply. Everything else is ignored.
#[derive(Debug, Deserialize)]
pub(crate) struct Reply {
    #[serde(rename = "RunNumber")]
    run_number: Option<i32>,
    #[serde(rename = "EventSize")]
    event_size: Option<i64>,
    #[serde(rename = "RunStatus")]
    run_status: Option<String>,
    #[serde(rename = "SendToAddress")]
    send_to_address: Option<String>,
    #[serde(rename = "SendToPort")]
    send_to_port: Option<u16>,
    #[serde(rename = "FrontendStatus")]
    frontend_status: Option<String>,
    #[serde(rename = "MIDASTime")]
    midas_time: Option<f64>,
    msg: Option<String>,
    err: Option<String>,
}

/// One connect/send/recv exchange. The reply is length-delimited by the
/// balance of top-level braces; a peer that closes early ends it too.
fn exchange(address: &str, port: u16, packet: &[u8], timeout: Duration) -> std::io::Result<Vec<u8>> {
    let mut stream = TcpStream::connect((address, port))?;
    stream.set_read_timeout(Some(timeout))?;
    stream.write_all(packet)?;

    let mut reply = Vec::new();
    let mut depth = 0_i32;
    let mut opened = false;
    let mut chunk = [0_u8; RECV_CHUNK_SIZE];
    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        for &byte in &chunk[..n] {
            match byte {
                b'{' => {
                    depth += 1;
                    opened = true;
                }
                b'}' => depth -= 1,
                _ => {}
            }
        }
        reply.extend_from_slice(&chunk[..n]);
        if opened && depth <= 0 {
            break;
        }
    }
    let _ = stream.shutdown(Shutdown::Write);
    Ok(reply)
}

/// Ship one packet to the current worker endpoint and apply whatever the
/// server says back. Transient socket trouble is absorbed here; only a
/// reply beginning with `ERROR` is terminal.
pub(crate) fn send_with_timeout(core: &PackerCore, packet: &[u8], timeout: Duration) {
    loop {
        let (address, port) = {
            let session = core.session.lock().unwrap();
            (session.address.clone(), session.port)
        };
        match exchange(&address, port, packet, timeout) {
            Ok(reply) => {
                trace!("sent {} bytes to {address}:{port}", packet.len());
                if !reply.is_empty() {
                    handle_reply(core, &reply);
                }
                return;
            }
            Err(err) => match err.kind() {
                ErrorKind::TimedOut | ErrorKind::WouldBlock => {
                    warn!("no reply from {address}:{port} within {timeout:?}");
                    core.announce_on_speaker("TCPTimeout", "Connection drop detected...");
                    return;
                }
                ErrorKind::ConnectionReset => {
                    info!("connection to {address}:{port} reset, retrying");
                }
                ErrorKind::ConnectionRefused => {
                    info!("connection to {address}:{port} refused, retrying in 1s");
                    sleep(REFUSED_RETRY_DELAY);
                    if port != core.supervisor_port {
                        // The worker endpoint went away; renegotiate with
                        // the supervisor before trying again.
                        run_handshake(core, 0);
                    }
                }
                _ => {
                    warn!("send to {address}:{port} failed: {err}");
                    return;
                }
            },
        }
    }
}

/// Apply one raw reply. An `ERROR` prefix is a fatal server signal.
pub(crate) fn handle_reply(core: &PackerCore, raw: &[u8]) {
    if raw.starts_with(b"ERROR") {
        core.fatal(FatalError::ServerError(
            String::from_utf8_lossy(raw).into_owned(),
        ));
        return;
    }

    let reply: Reply = match serde_json::from_slice(raw) {
        Ok(reply) => reply,
        Err(err) => {
            warn!("unparseable reply ({err}): {}", String::from_utf8_lossy(raw));
            return;
        }
    };
    apply_reply(core, reply);
}

fn apply_reply(core: &PackerCore, reply: Reply) {
    if let Some(msg) = &reply.msg {
        info!("server: {msg}");
    }
    if let Some(err) = &reply.err {
        warn!("server: {err}");
    }

    let mut session = core.session.lock().unwrap();
    if let Some(run_number) = reply.run_number {
        session.run_number = run_number;
    }
    if let Some(event_size) = reply.event_size {
        session.max_event_size = event_size;
    }
    if let Some(run_status) = reply.run_status {
        session.run_status = run_status;
    }
    if let Some(address) = reply.send_to_address {
        session.address = address;
    }
    if let Some(port) = reply.send_to_port {
        session.port = port;
    }
    if let Some(frontend_status) = reply.frontend_status {
        session.frontend_status = frontend_status;
    }
    if let Some(midas_time) = reply.midas_time {
        session.midas_time = midas_time;
    }
    drop(session);
    core.session_changed.notify_all();
}

fn command_bank(command: &str, payload: Payload) -> Arc<DataBank> {
    let bank = DataBank::new(payload.data_type(), "THISHOST", "COMMAND", command, 0, 0);
    bank.append(LvTimestamp::now(), &payload.to_bytes());
    Arc::new(bank)
}

/// Negotiate a session with the supervisor endpoint: register this host,
/// learn the worker endpoint, then settle the maximum event size. Control
/// commands travel on a private bank list so they never mix with queued
/// measurements.
pub(crate) fn run_handshake(core: &PackerCore, configured_event_size: i64) {
    let host = gethostname().into_string().unwrap_or_default();
    {
        let mut session = core.session.lock().unwrap();
        session.frontend_status.clear();
        session.address = core.server_host.clone();
        session.port = core.supervisor_port;
    }

    info!(
        "negotiating with supervisor at {}:{}",
        core.server_host, core.supervisor_port,
    );
    while core.session.lock().unwrap().frontend_status.is_empty() {
        let banks: Vec<Arc<DataBank>> = [
            "START_FRONTEND",
            "ALLOW_HOST",
            "GIVE_ME_ADDRESS",
            "GIVE_ME_PORT",
        ]
        .iter()
        .map(|command| command_bank(command, Payload::from(host.as_str())))
        .collect();
        let packet = core.flush_banks(&banks);
        send_with_timeout(core, &packet, HANDSHAKE_TIMEOUT);
    }

    if configured_event_size > 0 {
        let banks = vec![command_bank(
            "SET_EVENT_SIZE",
            Payload::from(configured_event_size.to_string()),
        )];
        let packet = core.flush_banks(&banks);
        send_with_timeout(core, &packet, HANDSHAKE_TIMEOUT);
    }

    core.session.lock().unwrap().max_event_size = -1;
    while core.session.lock().unwrap().max_event_size < 0 {
        let banks = vec![command_bank("GET_EVENT_SIZE", Payload::Bytes(vec![0]))];
        let packet = core.flush_banks(&banks);
        send_with_timeout(core, &packet, HANDSHAKE_TIMEOUT);
    }

    let session = core.session.lock().unwrap();
    info!(
        "session established: worker {}:{}, max event size {} bytes, server clock {}",
        session.address, session.port, session.max_event_size, session.midas_time,
    );
}
