//! Asynchronous connections
//!
//! Design: the connection state machine ([`connection`]) is portable and
//! driven through the [`Transport`] trait, so it runs unchanged over TCP or
//! in memory. On Linux, an epoll reactor delivers readiness as worker jobs;
//! each job advances one connection under its task's lock.

pub mod protocol;
pub mod state;
pub mod transport;

pub(crate) mod connection;

#[cfg(target_os = "linux")]
pub(crate) mod driver;
#[cfg(target_os = "linux")]
pub(crate) mod reactor;
#[cfg(target_os = "linux")]
pub(crate) mod server;


pub use connection::ConnectionCx;
pub use protocol::{Payload, Protocol, ProtocolTraits};
pub use state::{transition, ConnState, InvalidTransition, IoOp, Trigger};
pub use transport::{MemoryHandle, MemoryTransport, TcpTransport, Transport};

#[cfg(target_os = "linux")]
pub use server::ServerHandle;

pub(crate) use connection::{Connection, Entry, Interest, NetShared, Outcome};
pub(crate) use protocol::BoundProtocol;
