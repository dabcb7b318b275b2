//! pxengine - parallel task engine
//!
//! Work, waits, timers and network connections run as tasks on a worker
//! pool. Each task allocates from its own arena; the controlling thread
//! pumps completions, raises deferred errors and destroys finished tasks.

// Core modules
pub mod config;
pub mod context;
pub mod errors;
pub mod logging;
pub mod metrics;
pub mod net;
pub mod runtime;
pub mod value;

// Re-export commonly used items
pub use config::{HeapConfig, MemoryConfig, NetConfig, PoolConfig, RuntimeConfig};
pub use context::{Persisted, Task, TaskId, TaskKind, TaskState, Work, WorkContext};
pub use errors::{PxError, Result};
pub use logging::{init_logging, LogConfig, LogFormat, LogOutput};
pub use metrics::{KindStats, RuntimeStats, TimingStats, WorkKind};
pub use net::{ConnState, ConnectionCx, MemoryTransport, Payload, Protocol, ProtocolTraits, Transport};
pub use runtime::{Event, FixedMemoryProbe, MemoryProbe, Runtime, RuntimeBuilder, SystemMemoryProbe};
pub use value::{Args, Value};

#[cfg(target_os = "linux")]
pub use net::ServerHandle;

pub use pxengine_runtime::{Arena, ArenaConfig, Block, Snapshot};
