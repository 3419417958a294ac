//! Query reader — turns a query document into a [`Query`].
//!
//! Expected shape:
//!
//! ```xml
//! <mws:query limitmin="0" answsize="30" totalreq="yes" output="xml">
//!   <mws:expr>
//!     <m:apply><m:plus/><mws:qvar>x</mws:qvar><m:cn>1</m:cn></m:apply>
//!   </mws:expr>
//! </mws:query>
//! ```
//!
//! Each `mws:expr` yields one token. Elements outside an expression other
//! than `mws:expr` are skipped with their content.

use quick_xml::events::attributes::AttrError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::io::BufRead;
use thiserror::Error;
use tracing::trace;

use crate::types::{FormulaTree, NodeId, OutputFormat, Query, QueryDialect};

const QUERY_TAG: &[u8] = b"mws:query";
const EXPR_TAG: &[u8] = b"mws:expr";

#[derive(Debug, Error)]
pub enum QueryParseError {
    #[error("malformed XML: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("malformed attribute: {0}")]
    Attr(#[from] AttrError),

    #[error("document is empty")]
    Empty,

    #[error("expected <mws:query> root, found <{0}>")]
    UnexpectedRoot(String),

    #[error("invalid value {value:?} for attribute {name}")]
    InvalidAttribute { name: String, value: String },

    #[error("expression holds more than one formula")]
    MultipleFormulas,

    #[error("document ended inside <{0}>")]
    Truncated(String),
}

/// Read a query document from `input`.
pub fn read_query<R: BufRead>(input: R, dialect: QueryDialect) -> Result<Query, QueryParseError> {
    QueryReader::new(input, dialect).read()
}

/// Where the reader is in the document.
enum Position {
    /// Before the root element
    Prologue,
    /// Directly inside `mws:query`
    Query,
    /// Inside an `mws:expr`, building `tree` with open elements on `stack`
    Expr {
        tree: Option<FormulaTree>,
        stack: Vec<NodeId>,
    },
    /// After `</mws:query>`
    Done,
}

struct QueryReader<R: BufRead> {
    reader: Reader<R>,
    query: Query,
    position: Position,
    /// Depth of ignored elements currently open
    skipped: usize,
}

impl<R: BufRead> QueryReader<R> {
    fn new(input: R, dialect: QueryDialect) -> Self {
        Self {
            reader: Reader::from_reader(input),
            query: Query::new(dialect),
            position: Position::Prologue,
            skipped: 0,
        }
    }

    fn read(mut self) -> Result<Query, QueryParseError> {
        let mut buf = Vec::with_capacity(1024);

        loop {
            buf.clear();
            match self.reader.read_event_into(&mut buf)? {
                Event::Start(ref e) => self.open(e, false)?,
                Event::Empty(ref e) => self.open(e, true)?,
                Event::End(ref e) => self.close(e.name().as_ref()),
                Event::Text(ref e) => {
                    let text = e.unescape()?;
                    self.text(&text);
                }
                Event::CData(ref e) => {
                    let text = String::from_utf8_lossy(e).into_owned();
                    self.text(&text);
                }
                Event::Eof => break,
                _ => {}
            }
        }

        match self.position {
            Position::Done => {
                trace!(tokens = self.query.tokens.len(), "query parsed");
                Ok(self.query)
            }
            Position::Prologue => Err(QueryParseError::Empty),
            Position::Query => Err(QueryParseError::Truncated("mws:query".to_string())),
            Position::Expr { .. } => Err(QueryParseError::Truncated("mws:expr".to_string())),
        }
    }

    fn open(&mut self, e: &BytesStart<'_>, empty: bool) -> Result<(), QueryParseError> {
        if self.skipped > 0 {
            if !empty {
                self.skipped += 1;
            }
            return Ok(());
        }

        let name = e.name();
        let mode = self.query.dialect.tree_mode();
        match &mut self.position {
            Position::Prologue => {
                if name.as_ref() != QUERY_TAG {
                    return Err(QueryParseError::UnexpectedRoot(
                        String::from_utf8_lossy(name.as_ref()).into_owned(),
                    ));
                }
                self.read_query_attributes(e)?;
                self.position = if empty { Position::Done } else { Position::Query };
            }
            Position::Query => {
                if name.as_ref() == EXPR_TAG {
                    if !empty {
                        self.position = Position::Expr {
                            tree: None,
                            stack: Vec::new(),
                        };
                    }
                } else if !empty {
                    self.skipped = 1;
                }
            }
            Position::Expr { tree, stack } => {
                let id = if let Some(t) = tree.as_mut() {
                    let Some(&parent) = stack.last() else {
                        return Err(QueryParseError::MultipleFormulas);
                    };
                    let child = t
                        .node_mut(parent)
                        .map(|mut node| node.new_child())
                        .ok_or(QueryParseError::MultipleFormulas)?;
                    fill_node(t, child, e)?;
                    child
                } else {
                    let new_tree = tree.insert(FormulaTree::new_root(mode));
                    fill_node(new_tree, FormulaTree::ROOT, e)?;
                    FormulaTree::ROOT
                };
                if !empty {
                    stack.push(id);
                }
            }
            Position::Done => {
                if !empty {
                    self.skipped = 1;
                }
            }
        }
        Ok(())
    }

    fn close(&mut self, name: &[u8]) {
        if self.skipped > 0 {
            self.skipped -= 1;
            return;
        }

        match &mut self.position {
            Position::Expr { tree, stack } => {
                if stack.pop().is_none() && name == EXPR_TAG {
                    if let Some(token) = tree.take() {
                        self.query.tokens.push(token);
                    }
                    self.position = Position::Query;
                }
            }
            Position::Query if name == QUERY_TAG => self.position = Position::Done,
            _ => {}
        }
    }

    fn text(&mut self, text: &str) {
        if self.skipped > 0 {
            return;
        }
        if let Position::Expr {
            tree: Some(tree),
            stack,
        } = &mut self.position
        {
            if let Some(mut node) = stack.last().and_then(|&id| tree.node_mut(id)) {
                node.append_text(text);
            }
        }
    }

    fn read_query_attributes(&mut self, e: &BytesStart<'_>) -> Result<(), QueryParseError> {
        for attr in e.attributes() {
            let attr = attr?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value()?;
            let value = value.trim();

            match key.as_str() {
                "limitmin" => self.query.limit_min = parse_number(&key, value)?,
                "answsize" => self.query.max_results = parse_number(&key, value)?,
                "totalreq" => {
                    self.query.total_requested = match value {
                        "yes" | "true" => true,
                        "no" | "false" => false,
                        _ => return Err(invalid(&key, value)),
                    }
                }
                "output" => {
                    self.query.output =
                        OutputFormat::from_attr(value).ok_or_else(|| invalid(&key, value))?
                }
                "depth" if self.query.dialect == QueryDialect::Schema => {
                    self.query.max_depth = Some(parse_number(&key, value)?)
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Copy tag and attributes of `e` onto node `id`.
fn fill_node(
    tree: &mut FormulaTree,
    id: NodeId,
    e: &BytesStart<'_>,
) -> Result<(), QueryParseError> {
    let Some(mut node) = tree.node_mut(id) else {
        return Ok(());
    };
    node.set_tag(&String::from_utf8_lossy(e.name().as_ref()));
    for attr in e.attributes() {
        let attr = attr?;
        let value = attr.unescape_value()?;
        node.add_attribute(&String::from_utf8_lossy(attr.key.as_ref()), &value);
    }
    Ok(())
}

fn parse_number(name: &str, value: &str) -> Result<u32, QueryParseError> {
    value.parse().map_err(|_| invalid(name, value))
}

fn invalid(name: &str, value: &str) -> QueryParseError {
    QueryParseError::InvalidAttribute {
        name: name.to_string(),
        value: value.to_string(),
    }
}
