//! Query handler — the lookup component the daemon dispatches to.
//!
//! One handler instance serves every connection for the life of the daemon,
//! so implementations must tolerate concurrent calls (`Send + Sync`).

use tracing::debug;

use crate::types::{AnswerSet, Query};

/// Answers parsed queries.
pub trait QueryHandler: Send + Sync {
    /// Look up `query`. `None` signals an internal failure.
    fn handle_query(&self, query: &Query) -> Option<AnswerSet>;
}

impl<F> QueryHandler for F
where
    F: Fn(&Query) -> Option<AnswerSet> + Send + Sync,
{
    fn handle_query(&self, query: &Query) -> Option<AnswerSet> {
        self(query)
    }
}

/// Handler without an index: reports the query variables and no hits.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl QueryHandler for EchoHandler {
    fn handle_query(&self, query: &Query) -> Option<AnswerSet> {
        let mut answers = AnswerSet::new();
        for (name, xpath) in query.qvars() {
            answers.push_qvar(name, xpath);
        }
        debug!(
            tokens = query.tokens.len(),
            qvars = answers.qvar_names.len(),
            "echo handler answered"
        );
        Some(answers)
    }
}
