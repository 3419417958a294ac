//! Response formatters — encode an answer set into the outbound buffer.

use quick_xml::events::BytesText;
use quick_xml::Writer;
use std::io::{self, Write};
use thiserror::Error;

use crate::types::AnswerSet;

/// Namespace of the answer-set XML vocabulary.
pub const ANSWER_NS: &str = "http://www.mathweb.org/mws/ns";

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("failed to write answer set: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode answer set: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to build answer document: {0}")]
    Xml(#[from] quick_xml::Error),
}

/// Serializes answer sets for one output format.
pub trait ResponseFormatter: Send + Sync {
    /// Media type sent in the `Content-Type` header.
    fn content_type(&self) -> &'static str;

    /// Write `answers` to `out`, returning the number of bytes written.
    fn write_data(&self, answers: &AnswerSet, out: &mut dyn Write) -> Result<usize, FormatError>;
}

/// `<mws:answset>` documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct XmlResponseFormatter;

/// JSON documents mirroring [`AnswerSet`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonResponseFormatter;

pub static XML_FORMATTER: XmlResponseFormatter = XmlResponseFormatter;
pub static JSON_FORMATTER: JsonResponseFormatter = JsonResponseFormatter;

impl ResponseFormatter for XmlResponseFormatter {
    fn content_type(&self) -> &'static str {
        "application/xml"
    }

    fn write_data(&self, answers: &AnswerSet, out: &mut dyn Write) -> Result<usize, FormatError> {
        let size = answers.hits.len().to_string();
        let total = answers.total.to_string();

        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer
            .create_element("mws:answset")
            .with_attributes([
                ("xmlns:mws", ANSWER_NS),
                ("size", size.as_str()),
                ("total", total.as_str()),
            ])
            .write_inner_content(|w| -> Result<(), FormatError> {
                for (name, xpath) in answers.qvar_names.iter().zip(&answers.qvar_xpaths) {
                    w.create_element("mws:qvar")
                        .with_attributes([("name", name.as_str()), ("xpath", xpath.as_str())])
                        .write_empty()?;
                }
                for hit in &answers.hits {
                    let answ = w
                        .create_element("mws:answ")
                        .with_attributes([("uri", hit.uri.as_str()), ("xpath", hit.xpath.as_str())]);
                    match &hit.data {
                        Some(data) => answ.write_text_content(BytesText::new(data))?,
                        None => answ.write_empty()?,
                    };
                }
                Ok(())
            })?;

        let mut doc = writer.into_inner();
        doc.push(b'\n');
        out.write_all(&doc)?;
        Ok(doc.len())
    }
}

impl ResponseFormatter for JsonResponseFormatter {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn write_data(&self, answers: &AnswerSet, out: &mut dyn Write) -> Result<usize, FormatError> {
        let bytes = serde_json::to_vec(answers)?;
        out.write_all(&bytes)?;
        Ok(bytes.len())
    }
}
