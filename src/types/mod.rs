//! Core data types: formula trees, parsed queries and answer sets.

pub mod answer;
pub mod formula;
pub mod query;

pub use answer::{AnswerSet, Hit};
pub use formula::{FormulaTree, NodeId, NodeMut, NodeRef, TokenType, QVAR_TAG, ROOT_XPATH};
pub use query::{OutputFormat, Query, QueryDialect};
