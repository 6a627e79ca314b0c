// Core modules for the emberd server front-end
pub mod protocol; // RESP parser + encoders
pub mod storage; // Dict + Value types for in-memory storage
pub mod aof; // AOF writer thread for persistence
pub mod config; // TOML configuration, read-only after load
pub mod conn; // Connection: one client socket + per-client state
pub mod table; // ConnectionTable: fd-ordered registry + monitor subset
pub mod reactor; // ReactorLoop: mio poll, listeners, timer, waker
pub mod worker; // Worker + WorkerThread: event loop owner + admin ops
pub mod server; // ServerContext (shared counters) + Server assembly
pub mod engine; // CommandEngine trait + the RESP command engine

// Re-export the public surface from modules for easier access
pub use aof::*;
pub use config::*;
pub use conn::*;
pub use engine::*;
pub use protocol::*;
pub use reactor::*;
pub use server::*;
pub use storage::*;
pub use table::*;
pub use worker::*;

/// Default listen port when no config file is given
pub const DEFAULT_PORT: u16 = 7379;
