//! Request pipeline — per-connection state machine.
//!
//! ```text
//! New ──POST──▶ Accumulating ──end──▶ Parsed ──▶ Dispatched ──▶ Responding ──▶ Done
//!  │                 │                  │            │
//!  │ OPTIONS/GET/405 │ short write      │ 400        │ 500
//!  ▼                 ▼                  ▼            ▼
//! Done             Failed           Responding   Responding
//! ```
//!
//! The transport drives it with [`RequestPipeline::begin`], any number of
//! [`RequestPipeline::on_chunk`] calls and one [`RequestPipeline::on_end`].
//! Each stage owns exactly the data it needs (body buffer, query, answer
//! set, response) and hands it to the next by value, so nothing is freed
//! twice and an abandoned pipeline releases whatever it holds on drop.

use std::io::Write;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::handler::QueryHandler;
use super::responses::{HttpResponse, ROOT_PATH};
use crate::buffer::StreamBuffer;
use crate::format::ResponseFormatter;
use crate::types::{AnswerSet, Query, QueryDialect};
use crate::xmlparser::read_query;

/// State shared by every connection of one daemon.
pub struct ServiceContext {
    pub handler: Arc<dyn QueryHandler>,
    pub dialect: QueryDialect,
    /// Cap on the inbound body; exceeding it is a short write
    pub max_body_bytes: Option<usize>,
    /// Replaces the formatter each query would pick for itself
    pub formatter: Option<Arc<dyn ResponseFormatter>>,
}

/// What the transport should do after an event.
#[derive(Debug)]
pub enum Signal {
    /// Keep delivering body bytes
    Continue,
    /// Send this response and close
    Reply(HttpResponse),
    /// Drop the connection without a response
    Abort,
}

/// Observable pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    New,
    Accumulating,
    Parsed,
    Dispatched,
    Responding,
    Done,
    Failed,
}

enum Stage {
    New,
    Accumulating(StreamBuffer),
    Parsed(Query),
    Dispatched(Query, AnswerSet),
    Responding(HttpResponse),
    Done,
    Failed,
}

impl Stage {
    fn state(&self) -> PipelineState {
        match self {
            Stage::New => PipelineState::New,
            Stage::Accumulating(_) => PipelineState::Accumulating,
            Stage::Parsed(_) => PipelineState::Parsed,
            Stage::Dispatched(..) => PipelineState::Dispatched,
            Stage::Responding(_) => PipelineState::Responding,
            Stage::Done => PipelineState::Done,
            Stage::Failed => PipelineState::Failed,
        }
    }
}

/// One connection's request processing.
pub struct RequestPipeline {
    context: Arc<ServiceContext>,
    stage: Stage,
}

impl RequestPipeline {
    pub fn new(context: Arc<ServiceContext>) -> Self {
        Self {
            context,
            stage: Stage::New,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.stage.state()
    }

    /// Request line received.
    pub fn begin(&mut self, method: &str, target: &str) -> Signal {
        if !matches!(self.stage, Stage::New) {
            return self.fail("request started twice");
        }

        let path = target.split('?').next().unwrap_or(target);
        let is_root = path == ROOT_PATH;

        let response = match method {
            "OPTIONS" => HttpResponse::options(is_root),
            "GET" if is_root => HttpResponse::root_info(),
            "POST" => {
                self.stage =
                    Stage::Accumulating(StreamBuffer::bounded(self.context.max_body_bytes));
                return Signal::Continue;
            }
            _ => {
                debug!(method, path, "method not allowed");
                HttpResponse::method_not_allowed(is_root)
            }
        };
        self.stage = Stage::Done;
        Signal::Reply(response)
    }

    /// A chunk of the request body arrived.
    pub fn on_chunk(&mut self, chunk: &[u8]) -> Signal {
        let Stage::Accumulating(body) = &mut self.stage else {
            return self.fail("body chunk outside of accumulation");
        };

        let accepted = body.write_handle().write(chunk).unwrap_or(0);
        if accepted < chunk.len() {
            warn!(offered = chunk.len(), accepted, "short write while reading request body");
            return self.fail("short write");
        }
        Signal::Continue
    }

    /// The body is complete: parse, dispatch, format.
    pub fn on_end(&mut self) -> Signal {
        loop {
            let stage = std::mem::replace(&mut self.stage, Stage::Failed);
            self.stage = match stage {
                Stage::Accumulating(body) => self.parse(body),
                Stage::Parsed(query) => self.dispatch(query),
                Stage::Dispatched(query, answers) => self.format(&query, &answers),
                Stage::Responding(response) => {
                    self.stage = Stage::Done;
                    return Signal::Reply(response);
                }
                Stage::New | Stage::Done | Stage::Failed => {
                    return self.fail("end of body outside of accumulation");
                }
            };
            trace!(state = ?self.stage.state(), "pipeline advanced");
        }
    }

    /// The transport gave up on the connection; release everything held.
    pub fn abort(&mut self) {
        if !matches!(self.stage, Stage::Done) {
            debug!(state = ?self.stage.state(), "connection aborted");
            self.stage = Stage::Failed;
        }
    }

    fn fail(&mut self, reason: &str) -> Signal {
        debug!(reason, state = ?self.stage.state(), "pipeline failed");
        self.stage = Stage::Failed;
        Signal::Abort
    }

    fn parse(&self, body: StreamBuffer) -> Stage {
        let bytes = body.len();
        match read_query(body.into_readable(), self.context.dialect) {
            Ok(query) if !query.is_empty() => {
                debug!(bytes, tokens = query.tokens.len(), "query parsed");
                Stage::Parsed(query)
            }
            Ok(_) => {
                warn!("bad query request: no expressions");
                Stage::Responding(HttpResponse::bad_query())
            }
            Err(e) => {
                warn!(error = %e, "bad query request");
                Stage::Responding(HttpResponse::bad_query())
            }
        }
    }

    fn dispatch(&self, query: Query) -> Stage {
        match self.context.handler.handle_query(&query) {
            Some(answers) => Stage::Dispatched(query, answers),
            None => {
                warn!("error while obtaining answer set");
                Stage::Responding(HttpResponse::server_error())
            }
        }
    }

    fn format(&self, query: &Query, answers: &AnswerSet) -> Stage {
        let formatter: &dyn ResponseFormatter = match &self.context.formatter {
            Some(formatter) => formatter.as_ref(),
            None => query.response_formatter(),
        };
        let mut out = StreamBuffer::new();
        let written = formatter.write_data(answers, &mut out.write_handle());
        match written {
            Ok(bytes) => {
                debug!(bytes, content_type = formatter.content_type(), "answer set formatted");
                Stage::Responding(HttpResponse::answer(
                    formatter.content_type(),
                    out.into_released(),
                ))
            }
            Err(e) => {
                warn!(error = %e, "error while writing the answer set");
                Stage::Responding(HttpResponse::server_error())
            }
        }
    }
}
