//! Parsed query — the formulas to look up plus result-shaping attributes.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::formula::FormulaTree;
use crate::format::{ResponseFormatter, JSON_FORMATTER, XML_FORMATTER};

/// Default number of results requested when the query does not say.
pub const DEFAULT_MAX_RESULTS: u32 = 30;

/// Parsing dialect, fixed when the daemon is constructed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryDialect {
    /// Formula lookup against the index
    #[default]
    Generic,
    /// Schema (generalisation) lookup
    Schema,
}

impl QueryDialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::Schema => "schema",
        }
    }

    /// Mode flag stored on every formula tree parsed under this dialect.
    pub fn tree_mode(&self) -> bool {
        matches!(self, Self::Schema)
    }
}

impl fmt::Display for QueryDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoding requested for the answer set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Xml,
    Json,
}

impl OutputFormat {
    /// Parse the value of the `output` query attribute.
    pub fn from_attr(value: &str) -> Option<Self> {
        match value {
            "xml" => Some(Self::Xml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// A parsed query.
#[derive(Debug, Clone)]
pub struct Query {
    /// One formula tree per expression in the query
    pub tokens: Vec<FormulaTree>,
    /// Index of the first result to return
    pub limit_min: u32,
    /// Maximum number of results to return
    pub max_results: u32,
    /// Whether the total match count should be computed
    pub total_requested: bool,
    /// Depth limit for schema queries
    pub max_depth: Option<u32>,
    pub output: OutputFormat,
    pub dialect: QueryDialect,
}

impl Query {
    pub fn new(dialect: QueryDialect) -> Self {
        Self {
            tokens: Vec::new(),
            limit_min: 0,
            max_results: DEFAULT_MAX_RESULTS,
            total_requested: true,
            max_depth: None,
            output: OutputFormat::default(),
            dialect,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Formatter bound to this query. Schema answers are always JSON.
    pub fn response_formatter(&self) -> &'static dyn ResponseFormatter {
        match (self.dialect, self.output) {
            (QueryDialect::Schema, _) | (_, OutputFormat::Json) => &JSON_FORMATTER,
            (QueryDialect::Generic, OutputFormat::Xml) => &XML_FORMATTER,
        }
    }

    /// Query variables as `(name, relative xpath)` pairs, in document order.
    pub fn qvars(&self) -> Vec<(String, String)> {
        let mut vars = Vec::new();
        for token in &self.tokens {
            let mut stack = vec![token.root()];
            while let Some(node) = stack.pop() {
                if let Some(name) = node.var_name() {
                    vars.push((name.to_string(), node.xpath_relative().to_string()));
                }
                let children: Vec<_> = node.children().collect();
                stack.extend(children.into_iter().rev());
            }
        }
        vars
    }
}
