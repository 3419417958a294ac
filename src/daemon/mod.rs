//! Daemon module — the HTTP front end of the formula search service.
//!
//! A single engine thread accepts connections and gives each one its own
//! thread. Every connection runs a [`RequestPipeline`] that turns the
//! request into a [`Query`](crate::types::Query), asks the bound
//! [`QueryHandler`] for answers and formats the response.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           engine thread                 │
//! │  - accept loop                          │
//! │  - connection limit (503 when full)     │
//! └─────────────────────────────────────────┘
//!           │ one thread per connection
//!           ▼
//! ┌─────────────────────────────────────────┐
//! │           request pipeline              │
//! │  body ─▶ query ─▶ handler ─▶ formatter  │
//! └─────────────────────────────────────────┘
//! ```

pub mod handler;
pub mod pipeline;
pub mod responses;
pub mod server;

pub use handler::{EchoHandler, QueryHandler};
pub use pipeline::{PipelineState, RequestPipeline, ServiceContext, Signal};
pub use responses::HttpResponse;
pub use server::{Daemon, DaemonBuilder};
