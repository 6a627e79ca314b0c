#![allow(dead_code)]

//! Shared helpers for the integration tests: an in-process worker bound to
//! an ephemeral port, plus a tiny RESP client speaking over std TCP.

use emberd::{Config, RespEngine, ServerContext, Worker, WorkerThread};
use std::io::Read;
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One worker on an ephemeral localhost port, torn down on drop.
pub struct TestWorker {
    pub ctx: Arc<ServerContext>,
    pub worker: Arc<Worker>,
    thread: WorkerThread,
}

impl TestWorker {
    pub fn addr(&self) -> SocketAddr {
        self.worker.local_addrs()[0]
    }
}

impl Drop for TestWorker {
    fn drop(&mut self) {
        self.thread.stop();
        self.thread.join();
    }
}

pub fn start_worker(mut config: Config) -> TestWorker {
    config.binds = vec!["127.0.0.1".to_string()];
    config.port = 0;
    config.workers = 1;
    let ctx = ServerContext::new(config, Arc::new(RespEngine::new(None)));
    let worker = Worker::new(Arc::clone(&ctx), false).expect("failed to bind test worker");
    ctx.register_worker(&worker);
    let mut thread = WorkerThread::new(Arc::clone(&worker));
    thread.start();
    TestWorker { ctx, worker, thread }
}

pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("failed to connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("failed to set read timeout");
    stream
}

/// Encode an argument list as a RESP request frame.
pub fn encode(args: &[&str]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for a in args {
        out.extend_from_slice(format!("${}\r\n{}\r\n", a.len(), a).as_bytes());
    }
    out
}

/// Send one command and read its reply.
pub fn cmd(stream: &mut TcpStream, args: &[&str]) -> String {
    stream.write_all(&encode(args)).expect("failed to write command");
    read_reply(stream)
}

fn read_byte(stream: &mut TcpStream) -> u8 {
    let mut b = [0u8; 1];
    stream.read_exact(&mut b).expect("failed to read reply byte");
    b[0]
}

fn read_line(stream: &mut TcpStream) -> String {
    let mut line = Vec::new();
    loop {
        let b = read_byte(stream);
        if b == b'\r' {
            assert_eq!(read_byte(stream), b'\n', "lone CR in reply");
            break;
        }
        line.push(b);
    }
    String::from_utf8_lossy(&line).into_owned()
}

/// Read one RESP reply.
///
/// Status, error and integer replies come back with their type byte
/// (`+OK`, `-ERR ...`, `:1`). Bulk strings come back as their content,
/// nulls as `$-1`, arrays as comma-joined elements.
pub fn read_reply(stream: &mut TcpStream) -> String {
    let first = read_byte(stream) as char;
    match first {
        '+' | '-' | ':' => format!("{}{}", first, read_line(stream)),
        '$' => {
            let len: i64 = read_line(stream).parse().expect("bad bulk length");
            if len < 0 {
                return "$-1".to_string();
            }
            let mut data = vec![0u8; len as usize + 2];
            stream.read_exact(&mut data).expect("failed to read bulk body");
            String::from_utf8_lossy(&data[..len as usize]).into_owned()
        }
        '*' => {
            let n: usize = read_line(stream).parse().expect("bad array length");
            let mut parts = Vec::with_capacity(n);
            for _ in 0..n {
                parts.push(read_reply(stream));
            }
            parts.join(",")
        }
        other => panic!("unexpected reply type byte {other:?}"),
    }
}

/// Assert the peer closes the connection, draining any final output.
pub fn assert_eof(stream: &mut TcpStream) {
    let deadline = Instant::now() + Duration::from_secs(3);
    let mut buf = [0u8; 256];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(_) => continue,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                assert!(Instant::now() < deadline, "timed out waiting for EOF");
            }
            Err(_) => return, // reset also counts as closed
        }
    }
}

/// Poll a condition with a deadline; admin effects land on the reactor's
/// next wake, not synchronously.
pub fn wait_until(mut pred: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !pred() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Extract a `key=value` field from a client-list line.
pub fn list_field<'a>(line: &'a str, key: &str) -> &'a str {
    line.split_whitespace()
        .find_map(|part| part.strip_prefix(key))
        .unwrap_or_else(|| panic!("field {key} missing in {line:?}"))
}
