//! Connection state machine
//!
//! Design: [`Connection::resume`] advances one connection until it has to
//! wait for readiness, is closed, or fails. Every callback runs in a scratch
//! snapshot on top of the task's root snapshot: a returned payload is copied
//! into that snapshot and rolled back once the send completes, so a
//! connection's arena never grows with the traffic it carries. The receive
//! buffer and the lines-mode carry buffer live in the root scope and are
//! reused for the lifetime of the connection.

use super::protocol::{BoundProtocol, Payload, Protocol};
use super::state::{transition, ConnState, IoOp, Trigger};
use super::transport::Transport;
use crate::config::{self, NetConfig};
use crate::errors::{PxError, Result};
use crate::metrics::Counters;
use pxengine_runtime::{tls, Arena, Block, Snapshot};
use smallvec::SmallVec;
use std::fs::File;
use std::net::{Shutdown, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::os::unix::io::RawFd;

/// Largest body chunk handed to one `sendfile` call.
const MAX_FILE_CHUNK: u64 = 1 << 20;

/// Smallest carry buffer allocated in lines mode.
const MIN_CARRY: usize = 256;

/// Net settings and counters every connection step reads.
pub(crate) struct NetShared {
    pub counters: Arc<Counters>,
    pub config: NetConfig,
    pub cpus: u64,
}

impl NetShared {
    pub fn new(counters: Arc<Counters>, config: NetConfig) -> Self {
        Self {
            counters,
            config,
            cpus: config::cpu_count() as u64,
        }
    }

    /// Busy I/O loops tolerated before synchronous completion is skipped.
    pub fn busy_limit(&self) -> u64 {
        self.cpus.saturating_sub(1).max(1)
    }
}

/// Why a connection is being resumed.
#[derive(Debug)]
pub(crate) enum Entry {
    /// Accept or connect completed; the transport is attached.
    Established,
    /// The transport is ready for the pending operation.
    Ready,
    /// Close an idle connection.
    Reap,
    /// Accept or connect failed.
    Failed(PxError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interest {
    Read,
    Write,
}

/// Where a resumed connection stopped.
#[derive(Debug)]
pub(crate) enum Outcome {
    Wait(Interest),
    /// Pooled connection closed; reuse the task.
    Recycle,
    /// Client connection closed; the task is done.
    Closed,
    /// Unhandled error; raised by the pump, the task ends.
    Fatal(PxError),
}

struct Fault {
    op: IoOp,
    error: PxError,
}

impl Fault {
    fn new(op: IoOp, error: impl Into<PxError>) -> Self {
        Self {
            op,
            error: error.into(),
        }
    }

    fn io(op: IoOp, err: std::io::Error) -> Self {
        Self::new(op, PxError::io(op.name(), err))
    }

    fn violation(op: IoOp, message: impl Into<String>) -> Self {
        Self::new(op, PxError::violation(message))
    }
}

enum Step {
    Established,
    Send { ready: bool },
    Recv { ready: bool },
    File { ready: bool },
    Disconnect,
}

enum Next {
    Step(Step),
    Wait(Interest),
}

type StepResult = std::result::Result<Next, Fault>;

#[derive(Debug, Clone, Default)]
pub(crate) struct ConnInfo {
    id: u64,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
    bytes_sent: u64,
    bytes_received: u64,
    send_id: u64,
    close_requested: bool,
}

impl ConnInfo {
    fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT.fetch_add(1, Ordering::Relaxed),
            ..Self::default()
        }
    }
}

/// An outgoing file with optional header and trailer.
pub(crate) struct FileSend {
    file: File,
    len: u64,
    offset: u64,
    header: Vec<u8>,
    header_sent: usize,
    trailer: Vec<u8>,
    trailer_sent: usize,
    id: u64,
}

impl FileSend {
    fn is_done(&self) -> bool {
        self.header_sent == self.header.len()
            && self.offset == self.len
            && self.trailer_sent == self.trailer.len()
    }

    /// Push the next piece; returns (bytes requested, bytes reported).
    fn send_next(&mut self, transport: &mut dyn Transport) -> std::io::Result<(usize, usize)> {
        if self.header_sent < self.header.len() {
            let chunk = &self.header[self.header_sent..];
            let n = transport.try_send(chunk)?;
            if n <= chunk.len() {
                self.header_sent += n;
            }
            Ok((chunk.len(), n))
        } else if self.offset < self.len {
            let want = (self.len - self.offset).min(MAX_FILE_CHUNK) as usize;
            let n = transport.try_sendfile(&self.file, self.offset, want)?;
            if n <= want {
                self.offset += n as u64;
            }
            Ok((want, n))
        } else {
            let chunk = &self.trailer[self.trailer_sent..];
            let n = transport.try_send(chunk)?;
            if n <= chunk.len() {
                self.trailer_sent += n;
            }
            Ok((chunk.len(), n))
        }
    }
}

/// What a protocol callback can see and do.
pub struct ConnectionCx<'a> {
    info: &'a mut ConnInfo,
    file: &'a mut Option<FileSend>,
}

impl ConnectionCx<'_> {
    /// Process-unique connection id; kept across recycling.
    pub fn id(&self) -> u64 {
        self.info.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.info.peer
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.info.local
    }

    pub fn bytes_sent(&self) -> u64 {
        self.info.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.info.bytes_received
    }

    /// Id of the most recent send.
    pub fn send_id(&self) -> u64 {
        self.info.send_id
    }

    /// Disconnect once the current step (and any payload it returns) is done.
    pub fn close(&mut self) {
        self.info.close_requested = true;
    }

    pub fn is_closing(&self) -> bool {
        self.info.close_requested
    }

    /// Stream `path` to the peer after this callback returns.
    ///
    /// The callback must return no payload. Completion is reported through
    /// [`Protocol::send_complete`].
    pub fn sendfile(
        &mut self,
        path: impl AsRef<Path>,
        header: Option<Vec<u8>>,
        trailer: Option<Vec<u8>>,
    ) -> Result<()> {
        if self.file.is_some() {
            return Err(PxError::violation("a file transfer is already scheduled"));
        }
        let file = File::open(path.as_ref()).map_err(|e| PxError::io("sendfile", e))?;
        let len = file
            .metadata()
            .map_err(|e| PxError::io("sendfile", e))?
            .len();
        *self.file = Some(FileSend {
            file,
            len,
            offset: 0,
            header: header.unwrap_or_default(),
            header_sent: 0,
            trailer: trailer.unwrap_or_default(),
            trailer_sent: 0,
            id: 0,
        });
        Ok(())
    }

    /// Allocate scratch space released after the current step's payload is sent.
    pub fn alloc(&self, size: usize, align: usize) -> Result<Block> {
        Ok(tls::alloc(size, align)?)
    }

    pub fn alloc_bytes(&self, data: &[u8]) -> Result<Block> {
        Ok(tls::alloc_bytes(data)?)
    }

    pub fn read(&self, block: &Block) -> Result<Vec<u8>> {
        Ok(tls::read(block)?)
    }
}

struct PendingSend {
    scratch: Snapshot,
    block: Block,
    sent: usize,
    id: u64,
}

/// One socket's protocol driver.
pub(crate) struct Connection {
    protocol: Arc<BoundProtocol>,
    transport: Option<Box<dyn Transport>>,
    state: ConnState,
    info: ConnInfo,
    pooled: bool,
    established: bool,
    closed_notified: bool,
    recv_buf: Option<Block>,
    carry: Option<Block>,
    carry_len: usize,
    pending: Option<PendingSend>,
    file: Option<FileSend>,
    sync_streak: u32,
    hog: bool,
    last_op: Option<IoOp>,
    last_activity: Instant,
}

impl Connection {
    fn new(protocol: Arc<BoundProtocol>, state: ConnState, pooled: bool) -> Self {
        Self {
            protocol,
            transport: None,
            state,
            info: ConnInfo::new(),
            pooled,
            established: false,
            closed_notified: false,
            recv_buf: None,
            carry: None,
            carry_len: 0,
            pending: None,
            file: None,
            sync_streak: 0,
            hog: false,
            last_op: None,
            last_activity: Instant::now(),
        }
    }

    /// A server connection waiting in a listener's accept pool.
    pub fn pooled(protocol: Arc<BoundProtocol>) -> Self {
        Self::new(protocol, ConnState::Accepting, true)
    }

    /// A client connection about to connect.
    pub fn client(protocol: Arc<BoundProtocol>) -> Self {
        Self::new(protocol, ConnState::Connecting, false)
    }

    /// Bind an accepted or connected stream.
    pub fn attach(&mut self, transport: Box<dyn Transport>) {
        self.info.peer = transport.peer_addr();
        self.info.local = transport.local_addr();
        self.transport = Some(transport);
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_pooled(&self) -> bool {
        self.pooled
    }

    pub fn bytes_sent(&self) -> u64 {
        self.info.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.info.bytes_received
    }

    pub fn send_id(&self) -> u64 {
        self.info.send_id
    }

    pub fn is_hog(&self) -> bool {
        self.hog
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    #[cfg(unix)]
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.transport.as_ref().and_then(|t| t.raw_fd())
    }

    /// Readiness the connection waits for in its current state.
    pub fn interest(&self) -> Interest {
        match self.state {
            ConnState::Sending | ConnState::SendingFile => Interest::Write,
            _ => Interest::Read,
        }
    }

    /// Return a closed pooled connection to `Accepting`. The caller resets the arena.
    pub fn reset(&mut self) {
        let id = self.info.id;
        self.transport = None;
        self.state = transition(self.state, Trigger::Recycled).unwrap_or(ConnState::Accepting);
        self.info = ConnInfo {
            id,
            ..ConnInfo::default()
        };
        self.established = false;
        self.closed_notified = false;
        self.recv_buf = None;
        self.carry = None;
        self.carry_len = 0;
        self.pending = None;
        self.file = None;
        self.sync_streak = 0;
        self.hog = false;
        self.last_op = None;
        self.last_activity = Instant::now();
    }

    /// Advance until the connection must wait, closes, or fails.
    pub fn resume(&mut self, arena: &mut Arena, net: &NetShared, entry: Entry) -> Outcome {
        match entry {
            Entry::Established => {
                let (op, trigger) = match self.state {
                    ConnState::Connecting => (IoOp::Connect, Trigger::Connected),
                    _ => (IoOp::Accept, Trigger::Accepted),
                };
                self.last_op = Some(op);
                if self.transport.is_none() {
                    let fault = Fault::violation(op, "established without a transport");
                    return self.fault(arena, net, fault);
                }
                if let Err(fault) = self.advance(op, trigger) {
                    return self.fault(arena, net, fault);
                }
                self.established = true;
                self.last_activity = Instant::now();
                tracing::debug!(
                    target: "net",
                    id = self.info.id,
                    peer = ?self.info.peer,
                    "connection established"
                );
                self.drive(arena, net, Step::Established)
            }
            Entry::Ready => {
                let step = match self.state {
                    ConnState::Sending => Step::Send { ready: true },
                    ConnState::Receiving => Step::Recv { ready: true },
                    ConnState::SendingFile => Step::File { ready: true },
                    ConnState::Disconnecting => Step::Disconnect,
                    other => {
                        let op = self.last_op.unwrap_or(IoOp::Recv);
                        let fault = Fault::violation(op, format!("readiness delivered in state {:?}", other));
                        return self.fault(arena, net, fault);
                    }
                };
                self.drive(arena, net, step)
            }
            Entry::Reap => {
                if self.state != ConnState::Receiving {
                    return Outcome::Wait(self.interest());
                }
                tracing::debug!(target: "net", id = self.info.id, idle = ?self.idle_for(), "reaping idle connection");
                self.info.close_requested = true;
                match self.advance(IoOp::Disconnect, Trigger::CloseRequested) {
                    Ok(()) => self.disconnect(arena, net),
                    Err(fault) => self.fault(arena, net, fault),
                }
            }
            Entry::Failed(error) => {
                let op = match self.state {
                    ConnState::Connecting => IoOp::Connect,
                    ConnState::Accepting => IoOp::Accept,
                    _ => self.last_op.unwrap_or(IoOp::Recv),
                };
                self.fault(arena, net, Fault { op, error })
            }
        }
    }

    fn drive(&mut self, arena: &mut Arena, net: &NetShared, mut step: Step) -> Outcome {
        loop {
            let next = match step {
                Step::Established => self.established(arena),
                Step::Send { ready } => self.send(arena, net, ready),
                Step::Recv { ready } => self.recv(arena, net, ready),
                Step::File { ready } => self.send_file(arena, net, ready),
                Step::Disconnect => return self.disconnect(arena, net),
            };
            match next {
                Ok(Next::Step(s)) => step = s,
                Ok(Next::Wait(interest)) => return Outcome::Wait(interest),
                Err(fault) => return self.fault(arena, net, fault),
            }
        }
    }

    fn advance(&mut self, op: IoOp, trigger: Trigger) -> std::result::Result<(), Fault> {
        match transition(self.state, trigger) {
            Ok(next) => {
                tracing::trace!(target: "net", id = self.info.id, from = ?self.state, to = ?next, "transition");
                self.state = next;
                Ok(())
            }
            Err(invalid) => Err(Fault::violation(op, invalid.to_string())),
        }
    }

    // ===== Callbacks =====

    fn established(&mut self, arena: &mut Arena) -> StepResult {
        let traits = self.protocol.traits();
        if let Some(bytes) = traits.initial_bytes_to_send {
            return self.invoke(arena, None, move |_, _| Ok(Some(Payload::Static(bytes))));
        }
        if traits.initial_bytes_callback {
            return self.invoke(arena, None, |p, cx| p.initial_bytes(cx));
        }
        self.invoke(arena, None, |p, cx| p.connection_made(cx))
    }

    fn invoke<F>(&mut self, arena: &mut Arena, echo: Option<Block>, f: F) -> StepResult
    where
        F: FnOnce(&dyn Protocol, &mut ConnectionCx<'_>) -> Result<Option<Payload>>,
    {
        let op = self.last_op.unwrap_or(IoOp::Send);
        let scratch = arena.snapshot().map_err(|e| Fault::new(op, e))?;
        self.invoke_in(arena, scratch, echo, f)
    }

    /// Run a callback inside `scratch` and turn its result into the next step.
    fn invoke_in<F>(&mut self, arena: &mut Arena, scratch: Snapshot, echo: Option<Block>, f: F) -> StepResult
    where
        F: FnOnce(&dyn Protocol, &mut ConnectionCx<'_>) -> Result<Option<Payload>>,
    {
        let op = self.last_op.unwrap_or(IoOp::Send);
        let protocol = Arc::clone(&self.protocol);
        let info = &mut self.info;
        let file = &mut self.file;
        let result = tls::scoped(arena, || {
            let mut cx = ConnectionCx { info, file };
            f(protocol.protocol(), &mut cx)
        });

        let payload = match result {
            Ok(Some(payload)) if !payload.is_empty() => payload,
            Ok(_) => {
                self.rollback(arena, &scratch, op)?;
                return self.after_callback();
            }
            Err(err) => {
                self.rollback(arena, &scratch, op)?;
                return Err(Fault::new(op, err));
            }
        };

        if self.file.is_some() {
            self.file = None;
            self.rollback(arena, &scratch, op)?;
            return Err(Fault::violation(op, "a callback returned a payload and scheduled sendfile"));
        }

        let block = match materialize(arena, payload, echo) {
            Ok(block) => block,
            Err(err) => {
                self.rollback(arena, &scratch, op)?;
                return Err(Fault::new(IoOp::Send, err));
            }
        };

        self.info.send_id += 1;
        self.pending = Some(PendingSend {
            scratch,
            block,
            sent: 0,
            id: self.info.send_id,
        });
        self.advance(IoOp::Send, Trigger::Payload)?;
        Ok(Next::Step(Step::Send { ready: false }))
    }

    fn after_callback(&mut self) -> StepResult {
        if let Some(file) = self.file.as_mut() {
            self.info.send_id += 1;
            file.id = self.info.send_id;
            self.advance(IoOp::SendFile, Trigger::File)?;
            return Ok(Next::Step(Step::File { ready: false }));
        }
        if self.info.close_requested {
            self.advance(IoOp::Disconnect, Trigger::CloseRequested)?;
            return Ok(Next::Step(Step::Disconnect));
        }
        let receives = self.protocol.traits().receives;
        self.advance(IoOp::Recv, Trigger::Idle { receives })?;
        Ok(Next::Step(if receives {
            Step::Recv { ready: false }
        } else {
            Step::Disconnect
        }))
    }

    fn rollback(&mut self, arena: &mut Arena, scratch: &Snapshot, op: IoOp) -> std::result::Result<(), Fault> {
        arena.rollback(scratch).map_err(|e| Fault::new(op, e))
    }

    // ===== Sending =====

    /// Synchronous attempts allowed before waiting for readiness.
    fn budget(&self, net: &NetShared, ready: bool, attempts: u32) -> u32 {
        if ready {
            attempts.max(1)
        } else if self.prefer_async(net) {
            0
        } else {
            attempts
        }
    }

    fn prefer_async(&self, net: &NetShared) -> bool {
        let busy = net.busy_limit();
        self.protocol.traits().concurrency
            || net.counters.active_ioloops.load(Ordering::Acquire) > busy
            || (self.hog && net.counters.active_hogs.load(Ordering::Acquire) >= busy)
    }

    fn send(&mut self, arena: &mut Arena, net: &NetShared, ready: bool) -> StepResult {
        self.last_op = Some(IoOp::Send);
        let budget = self.budget(net, ready, self.protocol.send_attempts());

        let mut attempt = 0;
        while attempt < budget {
            let pending = self
                .pending
                .as_mut()
                .ok_or_else(|| Fault::violation(IoOp::Send, "send without a pending payload"))?;
            let transport = self
                .transport
                .as_mut()
                .ok_or_else(|| Fault::violation(IoOp::Send, "send without a transport"))?;
            let bytes = arena.bytes(&pending.block).map_err(|e| Fault::new(IoOp::Send, e))?;
            let remaining = &bytes[pending.sent..];
            let expected = remaining.len();

            match transport.try_send(remaining) {
                Ok(n) if n > expected => {
                    return Err(Fault::new(
                        IoOp::Send,
                        PxError::CompletionLength {
                            op: "send",
                            expected,
                            actual: n,
                        },
                    ));
                }
                Ok(n) => {
                    pending.sent += n;
                    let done = pending.sent == pending.block.len();
                    self.info.bytes_sent += n as u64;
                    net.counters.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                    if done {
                        return self.send_done(arena, net, !(ready && attempt == 0));
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Fault::io(IoOp::Send, e)),
            }
            attempt += 1;
        }
        Ok(Next::Wait(Interest::Write))
    }

    fn send_done(&mut self, arena: &mut Arena, net: &NetShared, sync: bool) -> StepResult {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| Fault::violation(IoOp::Send, "send completed twice"))?;
        self.rollback(arena, &pending.scratch, IoOp::Send)?;
        self.note_completion(net, sync);
        self.last_activity = Instant::now();

        let id = pending.id;
        self.invoke(arena, None, move |p, cx| p.send_complete(cx, id))
    }

    fn send_file(&mut self, arena: &mut Arena, net: &NetShared, ready: bool) -> StepResult {
        self.last_op = Some(IoOp::SendFile);
        let budget = self.budget(net, ready, self.protocol.send_attempts());

        let mut attempt = 0;
        loop {
            let file = self
                .file
                .as_mut()
                .ok_or_else(|| Fault::violation(IoOp::SendFile, "sendfile without a file"))?;
            if file.is_done() {
                return self.file_done(arena, net, !(ready && attempt == 0));
            }
            if attempt >= budget {
                return Ok(Next::Wait(Interest::Write));
            }
            let transport = self
                .transport
                .as_mut()
                .ok_or_else(|| Fault::violation(IoOp::SendFile, "sendfile without a transport"))?;

            match file.send_next(&mut **transport) {
                Ok((expected, n)) if n > expected => {
                    return Err(Fault::new(
                        IoOp::SendFile,
                        PxError::CompletionLength {
                            op: "sendfile",
                            expected,
                            actual: n,
                        },
                    ));
                }
                Ok((_, n)) => {
                    let done = file.is_done();
                    self.info.bytes_sent += n as u64;
                    net.counters.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                    if done {
                        return self.file_done(arena, net, !(ready && attempt == 0));
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return Ok(Next::Wait(Interest::Write));
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Fault::io(IoOp::SendFile, e)),
            }
            attempt += 1;
        }
    }

    fn file_done(&mut self, arena: &mut Arena, net: &NetShared, sync: bool) -> StepResult {
        let id = self.file.take().map_or(self.info.send_id, |f| f.id);
        self.note_completion(net, sync);
        self.last_activity = Instant::now();
        self.invoke(arena, None, move |p, cx| p.send_complete(cx, id))
    }

    // ===== Receiving =====

    fn recv(&mut self, arena: &mut Arena, net: &NetShared, ready: bool) -> StepResult {
        self.last_op = Some(IoOp::Recv);
        let buffer = match self.recv_buf {
            Some(block) => block,
            None => {
                let block = arena
                    .allocate(net.config.recv_buffer_size, 1)
                    .map_err(|e| Fault::new(IoOp::Recv, e))?;
                self.recv_buf = Some(block);
                block
            }
        };
        let budget = self.budget(net, ready, self.protocol.recv_attempts());

        let mut attempt = 0;
        while attempt < budget {
            let transport = self
                .transport
                .as_mut()
                .ok_or_else(|| Fault::violation(IoOp::Recv, "receive without a transport"))?;
            let buf = arena.bytes_mut(&buffer).map_err(|e| Fault::new(IoOp::Recv, e))?;
            let capacity = buf.len();

            match transport.try_recv(buf) {
                Ok(0) => {
                    tracing::debug!(target: "net", id = self.info.id, "peer closed");
                    self.advance(IoOp::Recv, Trigger::PeerClosed)?;
                    return Ok(Next::Step(Step::Disconnect));
                }
                Ok(n) if n > capacity => {
                    return Err(Fault::new(
                        IoOp::Recv,
                        PxError::CompletionLength {
                            op: "recv",
                            expected: capacity,
                            actual: n,
                        },
                    ));
                }
                Ok(n) => {
                    self.info.bytes_received += n as u64;
                    net.counters.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                    self.last_activity = Instant::now();
                    self.note_completion(net, !(ready && attempt == 0));
                    return self.received(arena, net, buffer.prefix(n));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Fault::io(IoOp::Recv, e)),
            }
            attempt += 1;
        }
        Ok(Next::Wait(Interest::Read))
    }

    fn received(&mut self, arena: &mut Arena, net: &NetShared, data: Block) -> StepResult {
        if self.protocol.traits().lines_mode {
            return self.received_lines(arena, net, data);
        }
        // SAFETY: the receive buffer is only written by `recv`, which does not
        // run again until this callback (and any echo of it) has finished.
        let bytes = unsafe { detached(arena, &data) }.map_err(|e| Fault::new(IoOp::Recv, e))?;
        self.invoke(arena, Some(data), |p, cx| p.data_received(cx, bytes))
    }

    fn received_lines(&mut self, arena: &mut Arena, net: &NetShared, data: Block) -> StepResult {
        // SAFETY: as in `received`.
        let bytes = unsafe { detached(arena, &data) }.map_err(|e| Fault::new(IoOp::Recv, e))?;
        let max = net.config.max_line_length;

        let Some(last) = bytes.iter().rposition(|&b| b == b'\n') else {
            check_line_length(self.carry_len + bytes.len(), max)?;
            self.carry_append(arena, bytes)?;
            self.advance(IoOp::Recv, Trigger::Idle { receives: true })?;
            return Ok(Next::Step(Step::Recv { ready: false }));
        };
        let (complete, tail) = bytes.split_at(last + 1);
        let carried = self.carry_len;
        let longest = complete
            .split(|&b| b == b'\n')
            .enumerate()
            .map(|(i, line)| if i == 0 { carried + line.len() } else { line.len() })
            .max()
            .unwrap_or(0);
        check_line_length(longest.max(tail.len()), max)?;

        // Root-scope growth must happen before the scratch snapshot opens.
        self.reserve_carry(arena, tail.len().max(self.carry_len))?;
        let scratch = arena.snapshot().map_err(|e| Fault::new(IoOp::Recv, e))?;

        let joined = match self.join_lines(arena, complete, tail) {
            Ok(joined) => joined,
            Err(err) => {
                self.rollback(arena, &scratch, IoOp::Recv)?;
                return Err(Fault::new(IoOp::Recv, err));
            }
        };
        // SAFETY: `joined` lives in `scratch`, which stays open until the
        // callback returns and any echo of it has been sent.
        let view = match unsafe { detached(arena, &joined) } {
            Ok(view) => view,
            Err(err) => {
                self.rollback(arena, &scratch, IoOp::Recv)?;
                return Err(Fault::new(IoOp::Recv, err));
            }
        };
        let lines: SmallVec<[&[u8]; 8]> = view[..view.len() - 1]
            .split(|&b| b == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
            .collect();

        self.invoke_in(arena, scratch, Some(joined), |p, cx| p.lines_received(cx, &lines))
    }

    /// Carried partial line plus `complete`, copied into the open scratch
    /// snapshot; `tail` then becomes the new carry.
    fn join_lines(&mut self, arena: &mut Arena, complete: &[u8], tail: &[u8]) -> Result<Block> {
        let joined = arena.allocate(self.carry_len + complete.len(), 1)?;
        {
            let carried = match self.carry {
                Some(carry) => arena.bytes(&carry)?[..self.carry_len].to_vec(),
                None => Vec::new(),
            };
            let dst = arena.bytes_mut(&joined)?;
            dst[..carried.len()].copy_from_slice(&carried);
            dst[carried.len()..].copy_from_slice(complete);
        }
        self.carry_len = 0;
        if !tail.is_empty() {
            if let Some(carry) = self.carry {
                arena.bytes_mut(&carry)?[..tail.len()].copy_from_slice(tail);
                self.carry_len = tail.len();
            }
        }
        Ok(joined)
    }

    fn carry_append(&mut self, arena: &mut Arena, bytes: &[u8]) -> std::result::Result<(), Fault> {
        self.reserve_carry(arena, self.carry_len + bytes.len())?;
        if let Some(carry) = self.carry {
            let dst = arena.bytes_mut(&carry).map_err(|e| Fault::new(IoOp::Recv, e))?;
            dst[self.carry_len..self.carry_len + bytes.len()].copy_from_slice(bytes);
            self.carry_len += bytes.len();
        }
        Ok(())
    }

    /// Make the root-scope carry buffer hold at least `needed` bytes.
    fn reserve_carry(&mut self, arena: &mut Arena, needed: usize) -> std::result::Result<(), Fault> {
        let capacity = self.carry.map_or(0, |c| c.len());
        if needed <= capacity && self.carry.is_some() {
            return Ok(());
        }
        let size = needed.max(capacity * 2).max(MIN_CARRY);
        let grown = match self.carry {
            Some(carry) => arena.reallocate(&carry, size),
            None => arena.allocate(size, 1),
        }
        .map_err(|e| Fault::new(IoOp::Recv, e))?;
        self.carry = Some(grown);
        Ok(())
    }

    // ===== Completion accounting =====

    fn note_completion(&mut self, net: &NetShared, sync: bool) {
        if sync {
            self.sync_streak += 1;
            if !self.hog && self.sync_streak >= net.config.hog_threshold {
                self.hog = true;
                net.counters.active_hogs.fetch_add(1, Ordering::AcqRel);
                tracing::debug!(target: "net", id = self.info.id, streak = self.sync_streak, "connection flagged as hog");
            }
        } else {
            self.sync_streak = 0;
            self.clear_hog(net);
        }
    }

    fn clear_hog(&mut self, net: &NetShared) {
        if self.hog {
            self.hog = false;
            net.counters.hog_cleared();
        }
    }

    // ===== Teardown =====

    fn disconnect(&mut self, arena: &mut Arena, net: &NetShared) -> Outcome {
        self.last_op = Some(IoOp::Disconnect);
        self.discard_pending(arena);
        self.file = None;
        self.notify_closed(arena);
        if let Some(mut transport) = self.transport.take() {
            if let Err(error) = transport.shutdown(Shutdown::Write) {
                tracing::debug!(target: "net", id = self.info.id, %error, "shutdown failed");
            }
        }
        self.state = transition(self.state, Trigger::Closed).unwrap_or(ConnState::Closed);
        self.clear_hog(net);
        tracing::debug!(
            target: "net",
            id = self.info.id,
            sent = self.info.bytes_sent,
            received = self.info.bytes_received,
            "connection closed"
        );
        if self.pooled {
            Outcome::Recycle
        } else {
            Outcome::Closed
        }
    }

    fn fault(&mut self, arena: &mut Arena, net: &NetShared, fault: Fault) -> Outcome {
        let Fault { op, error } = fault;
        self.discard_pending(arena);
        self.file = None;
        self.state = transition(self.state, Trigger::Fault).unwrap_or(ConnState::Disconnecting);

        if error.is_transient() {
            tracing::debug!(target: "net", id = self.info.id, op = op.name(), %error, "transient error");
            return self.disconnect(arena, net);
        }

        tracing::debug!(target: "net", id = self.info.id, op = op.name(), %error, "connection error");
        match self.handle_exception(arena, &error) {
            Ok(()) => self.disconnect(arena, net),
            Err(unhandled) => {
                let _ = self.disconnect(arena, net);
                Outcome::Fatal(unhandled)
            }
        }
    }

    fn handle_exception(&mut self, arena: &mut Arena, error: &PxError) -> Result<()> {
        let scratch = arena.snapshot()?;
        let protocol = Arc::clone(&self.protocol);
        let info = &mut self.info;
        let file = &mut self.file;
        let result = tls::scoped(arena, || {
            let mut cx = ConnectionCx { info, file };
            protocol.protocol().exception_handler(&mut cx, error)
        });
        self.file = None;
        arena.rollback(&scratch)?;
        result
    }

    fn notify_closed(&mut self, arena: &mut Arena) {
        if !self.established || self.closed_notified {
            return;
        }
        self.closed_notified = true;
        let Ok(scratch) = arena.snapshot() else {
            return;
        };
        let protocol = Arc::clone(&self.protocol);
        let info = &mut self.info;
        let file = &mut self.file;
        let result = tls::scoped(arena, || {
            let mut cx = ConnectionCx { info, file };
            protocol.protocol().connection_closed(&mut cx)
        });
        self.file = None;
        if let Err(error) = arena.rollback(&scratch) {
            tracing::debug!(target: "net", id = self.info.id, %error, "could not release close scratch");
        }
        if let Err(error) = result {
            tracing::warn!(target: "net", id = self.info.id, %error, "connection_closed failed");
        }
    }

    fn discard_pending(&mut self, arena: &mut Arena) {
        if let Some(pending) = self.pending.take() {
            if let Err(error) = arena.rollback(&pending.scratch) {
                tracing::error!(target: "net", id = self.info.id, %error, "could not release send buffer");
            }
        }
    }
}

/// Fault a lines-mode receive holding a line longer than `max` bytes.
fn check_line_length(len: usize, max: usize) -> std::result::Result<(), Fault> {
    if len > max {
        return Err(Fault::new(
            IoOp::Recv,
            PxError::violation(format!("line of {} bytes exceeds the {} byte limit", len, max)),
        ));
    }
    Ok(())
}

/// Copy a returned payload into the arena, or validate a returned block.
fn materialize(arena: &mut Arena, payload: Payload, echo: Option<Block>) -> Result<Block> {
    match payload {
        Payload::Bytes(bytes) => Ok(arena.alloc_bytes(&bytes)?),
        Payload::Static(bytes) => Ok(arena.alloc_bytes(bytes)?),
        Payload::Block(block) => {
            arena.bytes(&block)?;
            Ok(block)
        }
        Payload::Echo => echo.ok_or_else(|| PxError::violation("echo returned outside a receive callback")),
    }
}

/// View `block`'s bytes without borrowing the arena.
///
/// # Safety
///
/// The caller must not use the slice after `block` is rolled back or written.
unsafe fn detached<'b>(arena: &Arena, block: &Block) -> Result<&'b [u8]> {
    let bytes = arena.bytes(block)?;
    Ok(std::slice::from_raw_parts(bytes.as_ptr(), bytes.len()))
}
