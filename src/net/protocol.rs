//! Protocol callbacks and their static traits
//!
//! Design: a protocol is a trait object with default no-op callbacks. Its
//! [`ProtocolTraits`] are read once when the protocol is bound to a server or
//! client; the connection engine only sees the resolved [`BoundProtocol`].

use super::connection::ConnectionCx;
use crate::config::NetConfig;
use crate::errors::{PxError, Result};
use pxengine_runtime::Block;
use std::fmt;
use std::sync::Arc;

/// Bytes a callback wants sent next.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Vec<u8>),
    Static(&'static [u8]),
    /// A block allocated from the connection's arena.
    Block(Block),
    /// Send back the data just received.
    Echo,
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Bytes(b) => b.is_empty(),
            Payload::Static(s) => s.is_empty(),
            Payload::Block(b) => b.is_empty(),
            Payload::Echo => false,
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<&'static [u8]> for Payload {
    fn from(bytes: &'static [u8]) -> Self {
        Payload::Static(bytes)
    }
}

impl From<&'static str> for Payload {
    fn from(text: &'static str) -> Self {
        Payload::Static(text.as_bytes())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Bytes(text.into_bytes())
    }
}

impl From<Block> for Payload {
    fn from(block: Block) -> Self {
        Payload::Block(block)
    }
}

/// Static capabilities of a protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolTraits {
    /// Sent as soon as a connection is established.
    pub initial_bytes_to_send: Option<&'static [u8]>,
    /// Call [`Protocol::initial_bytes`] when a connection is established.
    pub initial_bytes_callback: bool,
    /// Deliver complete `\n`-terminated lines to [`Protocol::lines_received`].
    pub lines_mode: bool,
    /// Use the configured synchronous attempt counts instead of one.
    pub throughput: bool,
    /// Always complete I/O asynchronously.
    pub concurrency: bool,
    pub max_sync_send_attempts: Option<u32>,
    pub max_sync_recv_attempts: Option<u32>,
    /// Receive after sending; false closes once nothing is left to send.
    pub receives: bool,
}

impl Default for ProtocolTraits {
    fn default() -> Self {
        Self {
            initial_bytes_to_send: None,
            initial_bytes_callback: false,
            lines_mode: false,
            throughput: false,
            concurrency: false,
            max_sync_send_attempts: None,
            max_sync_recv_attempts: None,
            receives: true,
        }
    }
}

impl ProtocolTraits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial_bytes(mut self, bytes: &'static [u8]) -> Self {
        self.initial_bytes_to_send = Some(bytes);
        self
    }

    pub fn with_initial_bytes_callback(mut self) -> Self {
        self.initial_bytes_callback = true;
        self
    }

    pub fn with_lines_mode(mut self) -> Self {
        self.lines_mode = true;
        self
    }

    pub fn with_throughput(mut self) -> Self {
        self.throughput = true;
        self
    }

    pub fn with_concurrency(mut self) -> Self {
        self.concurrency = true;
        self
    }

    pub fn with_sync_attempts(mut self, send: u32, recv: u32) -> Self {
        self.max_sync_send_attempts = Some(send);
        self.max_sync_recv_attempts = Some(recv);
        self
    }

    pub fn without_receive(mut self) -> Self {
        self.receives = false;
        self
    }
}

/// Callbacks driving one connection. Every method is optional.
///
/// Callbacks run on a worker with the connection's arena active; blocks
/// allocated through the [`ConnectionCx`] are released once the returned
/// payload has been sent.
pub trait Protocol: Send + Sync + 'static {
    fn traits(&self) -> ProtocolTraits {
        ProtocolTraits::default()
    }

    /// Produces the first bytes when `initial_bytes_callback` is set.
    fn initial_bytes(&self, _cx: &mut ConnectionCx<'_>) -> Result<Option<Payload>> {
        Ok(None)
    }

    fn connection_made(&self, _cx: &mut ConnectionCx<'_>) -> Result<Option<Payload>> {
        Ok(None)
    }

    fn data_received(&self, _cx: &mut ConnectionCx<'_>, _data: &[u8]) -> Result<Option<Payload>> {
        Ok(None)
    }

    /// Lines without their terminator (`\n` or `\r\n`).
    fn lines_received(&self, _cx: &mut ConnectionCx<'_>, _lines: &[&[u8]]) -> Result<Option<Payload>> {
        Ok(None)
    }

    fn send_complete(&self, _cx: &mut ConnectionCx<'_>, _send_id: u64) -> Result<Option<Payload>> {
        Ok(None)
    }

    fn connection_closed(&self, _cx: &mut ConnectionCx<'_>) -> Result<()> {
        Ok(())
    }

    /// Handle an error raised on this connection. Returning `Err` leaves it
    /// unhandled: it is raised by the pump and the connection's task ends.
    fn exception_handler(&self, _cx: &mut ConnectionCx<'_>, err: &PxError) -> Result<()> {
        Err(err.clone())
    }
}

/// A protocol with its traits resolved against the runtime's net config.
pub(crate) struct BoundProtocol {
    protocol: Arc<dyn Protocol>,
    traits: ProtocolTraits,
    send_attempts: u32,
    recv_attempts: u32,
}

impl BoundProtocol {
    pub fn bind(protocol: Arc<dyn Protocol>, config: &NetConfig) -> Result<Self> {
        let traits = protocol.traits();
        if traits.initial_bytes_to_send.is_some() && traits.initial_bytes_callback {
            return Err(PxError::violation(
                "initial_bytes_to_send and initial_bytes_callback are mutually exclusive",
            ));
        }
        if traits.initial_bytes_to_send.is_some_and(<[u8]>::is_empty) {
            return Err(PxError::violation("initial_bytes_to_send is empty"));
        }

        let resolve = |explicit: Option<u32>, configured: u32| match explicit {
            Some(n) => n,
            None if traits.throughput => configured,
            None => 1,
        };
        let send_attempts = resolve(traits.max_sync_send_attempts, config.max_sync_send_attempts);
        let recv_attempts = resolve(traits.max_sync_recv_attempts, config.max_sync_recv_attempts);

        Ok(Self {
            protocol,
            traits,
            send_attempts,
            recv_attempts,
        })
    }

    pub fn protocol(&self) -> &dyn Protocol {
        &*self.protocol
    }

    pub fn traits(&self) -> &ProtocolTraits {
        &self.traits
    }

    pub fn send_attempts(&self) -> u32 {
        self.send_attempts
    }

    pub fn recv_attempts(&self) -> u32 {
        self.recv_attempts
    }
}

impl fmt::Debug for BoundProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundProtocol")
            .field("traits", &self.traits)
            .field("send_attempts", &self.send_attempts)
            .field("recv_attempts", &self.recv_attempts)
            .finish()
    }
}
