//! DDM/DRDA wire layer for the server side of a DRDA connection.
//!
//! Builds reply DSSes (chaining, correlation, continuation, LOB streaming),
//! reads and validates request DSSes, and drives a connection's
//! request/reply loop around a pluggable command handler.
//!
//! # Architecture
//!
//! ```text
//! requester ──TCP:50000──> DrdaServer (server.rs)
//!                             └─ ConnectionDriver (driver.rs) ── CommandHandler
//!                                   ├─ DssReader (reader.rs) ─ DdmCursor (ddm.rs)
//!                                   ├─ DdmWriter (writer.rs) ─ MessageBuffer (buffer.rs)
//!                                   │     ├─ CcsidManager (ccsid.rs)
//!                                   │     └─ packed decimal (decimal.rs)
//!                                   ├─ reply builders (response.rs)
//!                                   └─ QRYDTA splitting (flow.rs)
//! ```

pub mod buffer;
pub mod ccsid;
pub mod code_points;
pub mod config;
pub mod ddm;
pub mod decimal;
pub mod driver;
pub mod error;
pub mod flow;
pub mod reader;
pub mod response;
pub mod server;
pub mod stats;
pub mod trace;
pub mod writer;

pub use buffer::ByteOrder;
pub use ccsid::CcsidManager;
pub use config::DrdaServerConfig;
pub use ddm::{DdmCursor, DdmObject};
pub use driver::{AppRequester, CommandHandler, ConnectionDriver, Request};
pub use error::{CommandError, DrdaError, DrdaResult};
pub use reader::{DssReader, DssSegment};
pub use server::{start_server, DrdaServer, ShutdownHandle};
pub use stats::{ServerStats, StatsSnapshot};
pub use writer::DdmWriter;
