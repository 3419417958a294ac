//! Answer set returned by a query handler.
//!
//! Only a carrier: how hits are found is the handler's business and how they
//! are encoded is the formatter's.

use serde::{Deserialize, Serialize};

/// A single match location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hit {
    /// Document the formula was found in
    pub uri: String,
    /// Position of the match inside the document
    pub xpath: String,
    /// Optional payload (e.g. the matched expression)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// Result of one query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerSet {
    /// Total number of matches (may exceed `hits.len()`)
    pub total: u64,
    /// Names of the query variables, in query order
    pub qvar_names: Vec<String>,
    /// Relative xpaths of the query variables, parallel to `qvar_names`
    pub qvar_xpaths: Vec<String>,
    pub hits: Vec<Hit>,
}

impl AnswerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_hit(&mut self, hit: Hit) {
        self.hits.push(hit);
    }

    pub fn push_qvar(&mut self, name: impl Into<String>, xpath: impl Into<String>) {
        self.qvar_names.push(name.into());
        self.qvar_xpaths.push(xpath.into());
    }
}
