//! # mathdex
//!
//! HTTP front end for a mathematical formula search engine.
//!
//! Clients POST XML queries whose expressions are MathML-like formula trees.
//! The daemon parses them into [`Query`] values, hands them to a pluggable
//! [`QueryHandler`] and writes the resulting [`AnswerSet`] back as XML or
//! JSON.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mathdex::{Daemon, EchoHandler, QueryDialect};
//!
//! let daemon = Daemon::builder()
//!     .handler(EchoHandler)
//!     .dialect(QueryDialect::Generic)
//!     .start()?;
//! println!("listening on {}", daemon.local_addr());
//! daemon.wait()?;
//! # Ok::<(), mathdex::DaemonError>(())
//! ```

pub mod buffer;
pub mod config;
pub mod daemon;
pub mod error;
pub mod format;
pub mod types;
pub mod xmlparser;

// Re-exports for convenience
pub use config::{DaemonConfig, CONNECTION_LIMIT, DEFAULT_PORT};
pub use daemon::{Daemon, DaemonBuilder, EchoHandler, QueryHandler};
pub use error::{DaemonError, Result};
pub use format::{FormatError, ResponseFormatter};
pub use types::{AnswerSet, FormulaTree, Hit, NodeId, NodeRef, OutputFormat, Query, QueryDialect};
pub use xmlparser::{read_query, QueryParseError};
