//! End-to-end exercise against a mock DAQ server on the loopback
//! interface: handshake, run-number query, and a data flush.

use {
    fegem_client::DataPacker,
    std::{
        io::{ErrorKind, Read, Write},
        net::{TcpListener, TcpStream},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex,
        },
        thread,
        time::{Duration, Instant},
    },
};

struct MockServer {
    port: u16,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
    exit: Arc<AtomicBool>,
}

impl MockServer {
    /// Accepts connections forever, records each request, and answers every
    /// one with the same JSON reply.
    fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let exit = Arc::new(AtomicBool::new(false));

        let request_log = Arc::clone(&requests);
        let exit_flag = Arc::clone(&exit);
        thread::spawn(move || {
            for stream in listener.incoming() {
                if exit_flag.load(Ordering::Relaxed) {
                    break;
                }
                let Ok(stream) = stream else { break };
                Self::serve(stream, &request_log, port);
            }
        });

        Self {
            port,
            requests,
            exit,
        }
    }

    fn serve(mut stream: TcpStream, request_log: &Mutex<Vec<Vec<u8>>>, port: u16) {
        stream
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let mut request = Vec::new();
        let mut chunk = [0_u8; 4096];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    request.extend_from_slice(&chunk[..n]);
                    // packets are written in one shot; a short drain is
                    // enough to know the client is done talking
                    if n < chunk.len() {
                        break;
                    }
                }
                Err(err)
                    if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
                {
                    break
                }
                Err(_) => return,
            }
        }
        request_log.lock().unwrap().push(request);

        let reply = format!(
            concat!(
                r#"{{"FrontendStatus":"Running","SendToAddress":"127.0.0.1","#,
                r#""SendToPort":{port},"EventSize":10000,"RunNumber":7,"#,
                r#""RunStatus":"Running","msg":"ok"}}"#,
            ),
            port = port,
        );
        let _ = stream.write_all(reply.as_bytes());
    }

    fn wait_for_request_containing(&self, needle: &[u8], timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            {
                let requests = self.requests.lock().unwrap();
                if requests
                    .iter()
                    .any(|request| request.windows(needle.len()).any(|window| window == needle))
                {
                    return true;
                }
            }
            thread::sleep(Duration::from_millis(50));
        }
        false
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.exit.store(true, Ordering::Relaxed);
        // unblock the accept loop
        let _ = TcpStream::connect(("127.0.0.1", self.port));
    }
}

#[test]
fn test_handshake_flush_and_run_number() {
    let _ = env_logger::builder().is_test(true).try_init();
    let server = MockServer::start();

    let packer = DataPacker::new("127.0.0.1", server.port, 0);

    // the handshake commands went to the supervisor endpoint
    assert!(server.wait_for_request_containing(b"START_FRONTEND", Duration::from_secs(1)));
    assert!(server.wait_for_request_containing(b"GET_EVENT_SIZE", Duration::from_secs(1)));

    // the reply already carried the run state, so neither query blocks
    assert_eq!(packer.get_run_number(), 7);
    assert_eq!(packer.get_run_status(), "Running");

    packer.add_data(
        "LoopbackTest",
        "Pressure",
        "mbar",
        0,
        1,
        fegem_client::LvTimestamp::now(),
        vec![1.5_f64, 2.5],
        false,
    );
    // the flush loop ships within a couple of ticks
    assert!(server.wait_for_request_containing(b"Pressure", Duration::from_secs(10)));
    // the connection announcement rode along on the speaker channel
    assert!(server.wait_for_request_containing(b"TALK", Duration::from_secs(10)));

    packer.stop();
}
