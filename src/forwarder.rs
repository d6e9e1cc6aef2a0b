//! Tick-driven request server embedded in the host application.
//!
//! The forwarder never owns a thread. The host calls [`Forwarder::tick`] once
//! per frame and every step inside it is non-blocking: accept, drain the
//! socket, decode, execute queued requests in arrival order, then flush as
//! many response bytes as the socket will take. A dropped connection is the
//! signal the external service uses to detect that the host went away, so the
//! forwarder never closes a healthy connection on its own.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use tracing::{debug, error, info, trace, warn};

use crate::backend::{CodeExecutor, ExecutionResult};
use crate::error::{BridgeError, ProtocolError, Result};
use crate::transport::protocol::unix_timestamp;
use crate::transport::{encode, ForwarderState, FrameBuffer, Message};

/// Bytes read from the client per `read` call.
const READ_CHUNK: usize = 64 * 1024;

/// A decoded request waiting for its turn.
#[derive(Debug)]
enum Inbound {
    Request(Message),
    /// Well-formed frame with a `type` we do not handle; answered with an error.
    Unknown { kind: String, id: String },
}

/// The single active client.
struct Client {
    stream: TcpStream,
    peer: SocketAddr,
}

/// Non-blocking, single-client request server driven by host ticks.
pub struct Forwarder<E> {
    executor: E,
    listener: Option<TcpListener>,
    client: Option<Client>,
    state: ForwarderState,
    recv_buffer: FrameBuffer,
    requests: VecDeque<Inbound>,
    /// Encoded response frames; the head may be a partially-sent remainder.
    responses: VecDeque<Vec<u8>>,
}

impl<E: CodeExecutor> Forwarder<E> {
    pub const fn new(executor: E) -> Self {
        Self {
            executor,
            listener: None,
            client: None,
            state: ForwarderState::Idle,
            recv_buffer: FrameBuffer::new(),
            requests: VecDeque::new(),
            responses: VecDeque::new(),
        }
    }

    /// Bind and listen without blocking.
    ///
    /// Calling `start` on a running forwarder is a no-op. A bind failure is
    /// returned to the caller and leaves the forwarder stopped.
    pub fn start(&mut self, host: &str, port: u16) -> Result<()> {
        if self.listener.is_some() {
            info!("Forwarder already running");
            return Ok(());
        }

        let addr = format!("{host}:{port}");
        let bind_error = |source: io::Error| BridgeError::Bind {
            addr: addr.clone(),
            source,
        };

        let listener = TcpListener::bind(&addr).map_err(bind_error)?;
        listener.set_nonblocking(true).map_err(bind_error)?;

        info!(addr = %addr, "Forwarder listening");
        self.listener = Some(listener);
        Ok(())
    }

    /// Close the client and the listener and drop all queued work.
    pub fn stop(&mut self) {
        let was_running = self.listener.take().is_some();
        self.close_client();
        if was_running {
            info!("Forwarder stopped");
        }
    }

    /// Run one non-blocking step. Called once per host frame.
    pub fn tick(&mut self, delta_time: f32) {
        if self.listener.is_none() {
            return;
        }
        trace!(delta_time, "Forwarder tick");

        self.accept_connection();
        self.receive_data();
        self.process_requests();
        self.send_responses();
    }

    pub const fn is_running(&self) -> bool {
        self.listener.is_some()
    }

    pub const fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    pub const fn state(&self) -> ForwarderState {
        self.state
    }

    /// Address the listener is bound to, if running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Adopt a pending connection, replacing the current one.
    fn accept_connection(&mut self) {
        let Some(listener) = &self.listener else {
            return;
        };

        match listener.accept() {
            Ok((stream, peer)) => {
                if let Some(previous) = &self.client {
                    info!(old = %previous.peer, new = %peer, "Replacing existing client connection");
                    self.close_client();
                }
                if let Err(e) = stream.set_nonblocking(true) {
                    warn!(peer = %peer, error = %e, "Rejecting client: cannot make socket non-blocking");
                    return;
                }
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "Failed to set TCP_NODELAY");
                }
                info!(peer = %peer, "Client connected");
                self.client = Some(Client { stream, peer });
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => warn!(error = %e, "Accept failed"),
        }
    }

    /// Drain whatever the socket has buffered and queue complete requests.
    fn receive_data(&mut self) {
        let Some(client) = self.client.as_mut() else {
            return;
        };

        let mut chunk = vec![0u8; READ_CHUNK];
        let failure = loop {
            match client.stream.read(&mut chunk) {
                Ok(0) => break Some("client closed the connection".to_string()),
                Ok(n) => self.recv_buffer.extend(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break None,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => break Some(e.to_string()),
            }
        };

        if let Some(reason) = failure {
            info!(reason = %reason, "Client disconnected");
            self.close_client();
            return;
        }

        while let Some(frame) = self.recv_buffer.next_frame() {
            match frame {
                Ok(message) => self.requests.push_back(Inbound::Request(message)),
                Err(ProtocolError::UnknownType { kind, id }) => {
                    self.requests.push_back(Inbound::Unknown { kind, id });
                }
                Err(e) => warn!(error = %e, "Dropping malformed frame"),
            }
        }
    }

    /// Handle every queued request, oldest first.
    fn process_requests(&mut self) {
        while let Some(inbound) = self.requests.pop_front() {
            let response = self.handle(inbound);
            match encode(&response) {
                Ok(frame) => self.responses.push_back(frame),
                Err(e) => error!(id = %response.id(), error = %e, "Failed to encode response"),
            }
        }
    }

    fn handle(&mut self, inbound: Inbound) -> Message {
        let request = match inbound {
            Inbound::Request(request) => request,
            Inbound::Unknown { kind, id } => {
                return Message::Error {
                    id,
                    error: format!("Unknown message type: {kind}"),
                };
            }
        };
        debug!(kind = request.kind(), id = %request.id(), "Handling request");

        match request {
            Message::Ping { id } => Message::Pong {
                id,
                timestamp: unix_timestamp(),
                state: self.state,
            },
            Message::Execute { id, code } => self.run(id, |executor| executor.execute_code(&code)),
            Message::ExecuteFile { id, file } => {
                self.run(id, |executor| executor.execute_file(Path::new(&file)))
            }
            Message::GetState { id } => Message::State {
                id,
                state: self.state,
                timestamp: unix_timestamp(),
            },
            other => Message::Error {
                id: other.id().to_string(),
                error: format!("Unknown message type: {}", other.kind()),
            },
        }
    }

    /// Execute on the host thread and wrap the outcome as a `result`.
    fn run(&mut self, id: String, work: impl FnOnce(&mut E) -> ExecutionResult) -> Message {
        self.state = ForwarderState::Executing;

        let executor = &mut self.executor;
        let result = match panic::catch_unwind(AssertUnwindSafe(|| work(executor))) {
            Ok(result) => {
                self.state = ForwarderState::Idle;
                result
            }
            Err(_) => {
                error!(id = %id, "Executor panicked");
                self.state = ForwarderState::Error;
                ExecutionResult::failure("Executor panicked while running the request")
            }
        };

        result_message(id, result)
    }

    /// Write queued responses until the socket would block.
    fn send_responses(&mut self) {
        let Some(client) = self.client.as_mut() else {
            self.responses.clear();
            return;
        };

        let mut failure = None;
        while let Some(frame) = self.responses.front_mut() {
            match client.stream.write(frame) {
                Ok(0) => {
                    failure = Some("socket accepted no bytes".to_string());
                    break;
                }
                Ok(n) if n == frame.len() => {
                    self.responses.pop_front();
                }
                Ok(n) => {
                    // Keep the unsent tail at the head for the next tick
                    frame.drain(..n);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    failure = Some(e.to_string());
                    break;
                }
            }
        }

        if let Some(reason) = failure {
            warn!(reason = %reason, "Send failed, dropping client");
            self.close_client();
        }
    }

    /// Drop the client and everything scoped to its connection.
    fn close_client(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = client.stream.shutdown(Shutdown::Both);
            debug!(peer = %client.peer, "Client connection closed");
        }
        self.recv_buffer.clear();
        self.requests.clear();
        self.responses.clear();
        self.state = ForwarderState::Idle;
    }
}

fn result_message(id: String, result: ExecutionResult) -> Message {
    let ExecutionResult {
        success,
        output,
        error,
        logs,
    } = result;

    Message::Result {
        id,
        success,
        output: success.then_some(output),
        error: (!success).then_some(error),
        logs: (!logs.is_empty()).then_some(logs),
    }
}
