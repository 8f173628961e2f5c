//! Framed serial channel with a background line reader.
//!
//! One `SerialTransport` owns one serial connection and exactly one reader
//! thread. The reader accumulates bytes, splits on `\n`, parses each line
//! as JSON when possible and records it as diagnostic text otherwise.
//! Every stored reply carries a monotonically increasing sequence number;
//! callers take a marker *before* sending a command and only accept replies
//! numbered after it, so a stale reply from an earlier exchange can never
//! satisfy a later wait.

use {
    crate::{
        error::Result,
        port::{NativePort, Port, SerialConfig},
    },
    log::{debug, trace, warn},
    serde::Serialize,
    serde_json::Value,
    std::{
        collections::VecDeque,
        io::Read,
        sync::{
            Arc, Mutex,
            atomic::{AtomicBool, AtomicU64, Ordering},
        },
        thread,
        time::{Duration, Instant},
    },
};

/// How often a blocked wait re-checks the reply buffer.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Read timeout for the background reader; bounds how long `close` waits.
const READER_TIMEOUT: Duration = Duration::from_millis(100);

/// Maximum buffered replies before the oldest are dropped.
const REPLY_BUFFER_CAP: usize = 256;

/// Diagnostic line prefixes the firmware emits constantly; dropped on read.
const NOISE_PREFIXES: &[&str] = &["[Audio", "[Timing]"];

/// One complete line received from the device.
#[derive(Debug, Clone)]
pub struct Reply {
    /// Position in the receive order, starting at 1.
    pub seq: u64,
    /// Parsed payload.
    pub payload: ReplyPayload,
}

/// Payload of a received line.
#[derive(Debug, Clone)]
pub enum ReplyPayload {
    /// A well-formed JSON object (protocol message).
    Json(Value),
    /// A non-JSON diagnostic line.
    Text(String),
}

impl Reply {
    /// The JSON payload, if this reply is a protocol message.
    #[must_use]
    pub fn json(&self) -> Option<&Value> {
        match &self.payload {
            ReplyPayload::Json(value) => Some(value),
            ReplyPayload::Text(_) => None,
        }
    }

    /// The text payload, if this reply is a diagnostic line.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            ReplyPayload::Text(line) => Some(line),
            ReplyPayload::Json(_) => None,
        }
    }
}

/// Shared reply buffer between the reader thread and waiting callers.
struct ReplyBuffer {
    replies: Mutex<VecDeque<Reply>>,
    last_seq: AtomicU64,
}

impl ReplyBuffer {
    fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            last_seq: AtomicU64::new(0),
        }
    }

    fn push(&self, payload: ReplyPayload) {
        let seq = self.last_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut replies = self.replies.lock().unwrap_or_else(|e| e.into_inner());
        if replies.len() >= REPLY_BUFFER_CAP {
            replies.pop_front();
        }
        replies.push_back(Reply { seq, payload });
    }

    fn mark(&self) -> u64 {
        self.last_seq.load(Ordering::SeqCst)
    }

    fn since(&self, since: u64) -> Vec<Reply> {
        let replies = self.replies.lock().unwrap_or_else(|e| e.into_inner());
        replies.iter().filter(|r| r.seq > since).cloned().collect()
    }

    fn find_json(&self, since: u64, predicate: &dyn Fn(&Value) -> bool) -> Option<Value> {
        let replies = self.replies.lock().unwrap_or_else(|e| e.into_inner());
        replies
            .iter()
            .filter(|r| r.seq > since)
            .find_map(|r| r.json().filter(|v| predicate(v)).cloned())
    }
}

/// Line-oriented JSON + binary channel over one serial connection.
pub struct SerialTransport {
    writer: Box<dyn Port>,
    port_name: String,
    buffer: Arc<ReplyBuffer>,
    stop: Arc<AtomicBool>,
    reader: Option<thread::JoinHandle<()>>,
}

impl SerialTransport {
    /// Open a serial connection and start the background reader.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let mut writer = NativePort::open(config)?;
        let mut reader = writer.try_clone_reader()?;
        reader.set_timeout(READER_TIMEOUT)?;
        writer.clear_buffers()?;
        Ok(Self::from_ports(
            Box::new(writer),
            Box::new(reader),
            &config.port_name,
        ))
    }

    /// Build a transport from already-open port halves. Used directly by
    /// tests; `open` is the production entry point.
    pub fn from_ports(
        writer: Box<dyn Port>,
        reader: Box<dyn Port + 'static>,
        port_name: &str,
    ) -> Self {
        let buffer = Arc::new(ReplyBuffer::new());
        let stop = Arc::new(AtomicBool::new(false));
        let handle = spawn_reader(reader, Arc::clone(&buffer), Arc::clone(&stop));
        Self {
            writer,
            port_name: port_name.to_string(),
            buffer,
            stop,
            reader: Some(handle),
        }
    }

    /// The serial port this transport is bound to.
    #[must_use]
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Serialize a command to single-line JSON, append `\n`, write, flush.
    pub fn write_command<T: Serialize>(&mut self, command: &T) -> Result<()> {
        let mut line = serde_json::to_string(command)?;
        trace!("{} <- {line}", self.port_name);
        line.push('\n');
        self.writer.write_all_bytes(line.as_bytes())?;
        Ok(())
    }

    /// Write raw bytes with no framing. Only valid inside an active
    /// transfer window, after the receiver has been told how many bytes to
    /// expect.
    pub fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all_bytes(data)?;
        Ok(())
    }

    /// Marker for "everything received so far". Replies that arrive after
    /// this call compare greater.
    #[must_use]
    pub fn mark(&self) -> u64 {
        self.buffer.mark()
    }

    /// All replies received after `since`.
    #[must_use]
    pub fn replies_since(&self, since: u64) -> Vec<Reply> {
        self.buffer.since(since)
    }

    /// Block up to `timeout` for a JSON reply received after `since` that
    /// matches `predicate`.
    #[must_use]
    pub fn wait_json(
        &self,
        since: u64,
        timeout: Duration,
        predicate: &dyn Fn(&Value) -> bool,
    ) -> Option<Value> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(found) = self.buffer.find_json(since, predicate) {
                return Some(found);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(WAIT_POLL_INTERVAL.min(timeout));
        }
    }

    /// Stop the reader, join it, then drop the port. Idempotent.
    pub fn close(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                warn!("{}: reader thread panicked", self.port_name);
            }
        }
        if let Err(e) = self.writer.close() {
            debug!("{}: error closing port: {e}", self.port_name);
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_reader(
    mut reader: Box<dyn Port>,
    buffer: Arc<ReplyBuffer>,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut acc: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 256];

        while !stop.load(Ordering::SeqCst) {
            match reader.read(&mut chunk) {
                Ok(0) => thread::sleep(Duration::from_millis(10)),
                Ok(n) => {
                    acc.extend_from_slice(&chunk[..n]);
                    drain_lines(&mut acc, &buffer);
                },
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::TimedOut
                            | std::io::ErrorKind::WouldBlock
                            | std::io::ErrorKind::Interrupted
                    ) => {},
                Err(e) => {
                    debug!("serial reader stopping: {e}");
                    break;
                },
            }
        }
    })
}

/// Split accumulated bytes on `\n` and store each complete line.
fn drain_lines(acc: &mut Vec<u8>, buffer: &ReplyBuffer) {
    while let Some(pos) = acc.iter().position(|&b| b == b'\n') {
        let line_bytes: Vec<u8> = acc.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&line_bytes);
        let line = line.trim_end_matches(['\n', '\r']).trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with('{') {
            match serde_json::from_str::<Value>(line) {
                Ok(value) => {
                    trace!("-> {value}");
                    buffer.push(ReplyPayload::Json(value));
                    continue;
                },
                Err(_) => {
                    // Truncated or garbled JSON falls through as text.
                },
            }
        }

        if NOISE_PREFIXES.iter().any(|p| line.starts_with(p)) {
            continue;
        }
        buffer.push(ReplyPayload::Text(line.to_string()));
    }
}
