//! Minimal HTTP/1.1 artifact server for integration tests.
//!
//! Serves one static body. HEAD reports Content-Length (and Accept-Ranges when
//! ranges are on); GET honours `Range: bytes=N-` with 206 Partial Content.
//! Bodies can be trickled out so a test can act while a transfer is running.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    /// If false, GET ignores Range and always returns 200 with the full body.
    pub support_ranges: bool,
    /// If true, every request gets 404.
    pub missing: bool,
    /// Bytes written per write call, and the pause after each one.
    pub chunk: usize,
    pub chunk_delay: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            support_ranges: true,
            missing: false,
            chunk: 16 * 1024,
            chunk_delay: Duration::ZERO,
        }
    }
}

impl ServerOptions {
    /// Slow enough that a 256 KiB body takes about half a second.
    pub fn trickle() -> Self {
        Self {
            chunk: 2048,
            chunk_delay: Duration::from_millis(4),
            ..Self::default()
        }
    }
}

type GetLog = Arc<Mutex<Vec<Option<u64>>>>;

pub struct RangeServer {
    pub url: String,
    gets: GetLog,
}

impl RangeServer {
    /// Number of GET requests served so far.
    pub fn gets(&self) -> usize {
        self.gets.lock().unwrap().len()
    }

    /// Start offset of the `Range` header of every GET, in arrival order.
    pub fn range_starts(&self) -> Vec<Option<u64>> {
        self.gets.lock().unwrap().clone()
    }
}

/// Serve `body` at `http://127.0.0.1:<port>/model.bin` until the process exits.
pub fn start(body: Vec<u8>, opts: ServerOptions) -> RangeServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let body = Arc::new(body);
    let gets = GetLog::default();
    let log = gets.clone();
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let body = Arc::clone(&body);
            let log = log.clone();
            thread::spawn(move || handle(stream, &body, opts, &log));
        }
    });
    RangeServer {
        url: format!("http://127.0.0.1:{port}/model.bin"),
        gets,
    }
}

fn handle(mut stream: TcpStream, body: &[u8], opts: ServerOptions, gets: &Mutex<Vec<Option<u64>>>) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) | Err(_) => return,
        Ok(n) => n,
    };
    let Ok(request) = std::str::from_utf8(&buf[..n]) else {
        return;
    };
    let (method, range_start) = parse_request(request);
    if opts.missing {
        let _ = stream.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n");
        return;
    }
    let total = body.len() as u64;
    let accept_ranges = if opts.support_ranges {
        "Accept-Ranges: bytes\r\n"
    } else {
        ""
    };
    if method.eq_ignore_ascii_case("HEAD") {
        let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {total}\r\n{accept_ranges}\r\n");
        let _ = stream.write_all(head.as_bytes());
        return;
    }
    if !method.eq_ignore_ascii_case("GET") {
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n");
        return;
    }
    if let Ok(mut log) = gets.lock() {
        log.push(range_start);
    }

    let start = match range_start {
        Some(start) if opts.support_ranges => start.min(total),
        _ => 0,
    };
    let head = if opts.support_ranges && range_start.is_some() {
        format!(
            "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\n{}\r\n",
            total - start,
            start,
            total.saturating_sub(1),
            total,
            accept_ranges
        )
    } else {
        format!("HTTP/1.1 200 OK\r\nContent-Length: {total}\r\n{accept_ranges}\r\n")
    };
    if stream.write_all(head.as_bytes()).is_err() {
        return;
    }
    for piece in body[start as usize..].chunks(opts.chunk.max(1)) {
        if stream.write_all(piece).is_err() {
            return;
        }
        if !opts.chunk_delay.is_zero() {
            thread::sleep(opts.chunk_delay);
        }
    }
}

/// Returns the method and the start offset of `Range: bytes=N-`, if any.
fn parse_request(request: &str) -> (&str, Option<u64>) {
    let mut lines = request.lines();
    let method = lines
        .next()
        .and_then(|l| l.split_whitespace().next())
        .unwrap_or("");
    let range = lines
        .take_while(|l| !l.trim().is_empty())
        .filter_map(|l| l.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("range"))
        .and_then(|(_, value)| value.trim().strip_prefix("bytes="))
        .and_then(|spec| spec.split_once('-'))
        .and_then(|(start, _)| start.trim().parse().ok());
    (method, range)
}
