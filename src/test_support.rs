//! Shared fixtures for unit tests: a toy executor, a blocking frame reader,
//! and a host thread that ticks a real forwarder.

use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::backend::{CodeExecutor, ExecutionResult};
use crate::host::HostContext;
use crate::transport::{FrameBuffer, Message, HEADER_LEN};

/// Evaluates `a+b`, fails on `raise`, panics on `panic`, blocks on `sleep:<ms>`,
/// and answers `big:<n>` with `n` bytes of output.
#[derive(Debug, Default)]
pub struct Calculator;

impl CodeExecutor for Calculator {
    fn execute_code(&mut self, code: &str) -> ExecutionResult {
        let code = code.trim();
        if code == "raise" {
            return ExecutionResult::failure("raised");
        }
        if code == "panic" {
            panic!("executor asked to panic");
        }
        if let Some(ms) = code.strip_prefix("sleep:") {
            let ms = ms.parse().unwrap_or(0);
            std::thread::sleep(Duration::from_millis(ms));
            return ExecutionResult::success("slept");
        }
        if let Some(n) = code.strip_prefix("big:") {
            return ExecutionResult::success("z".repeat(n.parse().unwrap_or(0)));
        }
        if let Some((a, b)) = code.split_once('+') {
            if let (Ok(a), Ok(b)) = (a.trim().parse::<i64>(), b.trim().parse::<i64>()) {
                return ExecutionResult::success((a + b).to_string());
            }
        }
        ExecutionResult::success("ok")
    }
}

/// Read exactly one frame from a blocking stream.
pub fn read_frame(stream: &mut TcpStream) -> Message {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).unwrap();
    let mut payload = vec![0u8; u32::from_be_bytes(header) as usize];
    stream.read_exact(&mut payload).unwrap();

    let mut buffer = FrameBuffer::new();
    buffer.extend(&header);
    buffer.extend(&payload);
    buffer.next_frame().unwrap().unwrap()
}

/// A forwarder ticking on its own thread, standing in for the host process.
pub struct HostThread {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl HostThread {
    /// Start a host on `port` (0 picks a free port).
    pub fn spawn(port: u16) -> Self {
        let (tx, rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        let handle = std::thread::spawn(move || {
            let ctx = HostContext::new("127.0.0.1", port, Calculator);
            if let Err(e) = ctx.start() {
                let _ = tx.send(Err(e.to_string()));
                return;
            }
            let _ = tx.send(ctx.local_addr().ok_or_else(|| "no local addr".to_string()));
            while !flag.load(Ordering::Acquire) {
                ctx.tick(0.002);
                std::thread::sleep(Duration::from_millis(2));
            }
            ctx.stop();
        });

        let addr = rx.recv().unwrap().unwrap();
        Self {
            addr,
            stop,
            handle: Some(handle),
        }
    }

    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub const fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop ticking and close every socket, as if the host went away.
    pub fn shutdown(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HostThread {
    fn drop(&mut self) {
        self.halt();
    }
}
