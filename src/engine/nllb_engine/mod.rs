// Honyaku Engine — Backend-B: persistent NLLB-200 server client
//
// A long-lived neural inference subprocess reached over newline-delimited
// JSON on local TCP. The manager owns the process, the pool owns the
// sockets, the client owns the protocol.

pub mod client;
pub mod connection;
pub mod manager;
pub mod pool;
pub mod registry;

pub use client::{SubprocessMtClient, NLLB_PROVIDER_ID};
pub use connection::Connection;
pub use manager::{SubprocessManager, SubprocessOptions};
pub use pool::{ConnectionPool, PooledConnection};
pub use registry::{PortEntry, PortRegistry};
