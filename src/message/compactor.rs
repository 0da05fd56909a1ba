//! Message compaction: chomp long element contents and hoist an element's
//! content into a session key, so large payloads are not kept in the message
//! log or carried through the pipeline twice.
//!
//! Elements are located on the `quick_xml` event stream, so nested elements
//! with the same name, comments and CDATA sections are handled the way an
//! XML parser sees them.

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::name::QName;
use quick_xml::Reader;
use std::ops::Range;

use super::{Message, PipeLineSession};
use crate::config::{CompactionConfig, ConfigResult, ConfigurationError};

const CHOMP_SUFFIX: &str = "...";

#[derive(Debug, Clone)]
pub struct MessageCompactor {
    chomp_char_size: Option<usize>,
    /// Element path; the innermost element is moved
    move_chain: Vec<String>,
    session_key: Option<String>,
    ignore_namespaces: bool,
}

impl MessageCompactor {
    /// Build a compactor, or `None` when no compaction is configured
    pub fn from_config(config: &CompactionConfig) -> ConfigResult<Option<Self>> {
        if !config.is_enabled() {
            return Ok(None);
        }

        let move_chain: Vec<String> = match (&config.element_to_move, &config.element_to_move_chain) {
            (Some(element), _) => vec![element.trim().to_string()],
            (None, Some(chain)) => chain
                .split(';')
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect(),
            (None, None) => Vec::new(),
        };
        if move_chain
            .iter()
            .any(|name| !name.chars().all(|c| c.is_alphanumeric() || "_-.:".contains(c)))
        {
            return Err(ConfigurationError::invalid_value(
                "compaction.element_to_move",
                move_chain.join(";"),
                "element names may only contain letters, digits, '_', '-', '.' and ':'",
            ));
        }

        let session_key = move_chain.last().map(|element| {
            config
                .element_to_move_session_key
                .clone()
                .unwrap_or_else(|| element.clone())
        });

        Ok(Some(Self {
            chomp_char_size: config.chomp_char_size,
            move_chain,
            session_key,
            ignore_namespaces: config.remove_compact_msg_namespaces,
        }))
    }

    /// Compact a textual message; binary and null messages pass through unchanged
    pub fn compact(&self, message: &Message, session: &mut PipeLineSession) -> Message {
        let Some(text) = message.as_str() else {
            return message.clone();
        };

        let mut compacted = text.to_string();
        if let Some(key) = &self.session_key {
            if let Some(moved) = self.move_element(&compacted, key, session) {
                compacted = moved;
            }
        }
        if let Some(size) = self.chomp_char_size {
            compacted = chomp(&compacted, size);
        }
        Message::from(compacted)
    }

    fn move_element(&self, text: &str, key: &str, session: &mut PipeLineSession) -> Option<String> {
        let mut range = 0..text.len();
        for element in &self.move_chain {
            range = self.find_content(text, range, element)?;
        }
        session.insert(key, &text[range.clone()]);
        Some(format!(
            "{}{{sessionKey:{key}}}{}",
            &text[..range.start],
            &text[range.end..]
        ))
    }

    /// Byte range of the content of the first `element` inside `within`,
    /// ending at its own matching end tag. Malformed XML yields `None`.
    fn find_content(&self, text: &str, within: Range<usize>, element: &str) -> Option<Range<usize>> {
        let scope = &text[within.clone()];
        let mut reader = Reader::from_str(scope);
        let mut depth = 0usize;
        // (depth of the matched element, start of its content)
        let mut open: Option<(usize, usize)> = None;

        loop {
            let event = reader.read_event().ok()?;
            let position = byte_position(&reader);
            match event {
                Event::Start(start) => {
                    depth += 1;
                    if open.is_none() && self.matches(start.name(), element) {
                        open = Some((depth, position));
                    }
                }
                Event::End(_) => {
                    if let Some((level, content_start)) = open {
                        if level == depth {
                            let content_end = scope[..position].rfind("</")?;
                            return Some(within.start + content_start..within.start + content_end);
                        }
                    }
                    depth = depth.checked_sub(1)?;
                }
                Event::Eof => return None,
                _ => {}
            }
        }
    }

    fn matches(&self, name: QName<'_>, element: &str) -> bool {
        if self.ignore_namespaces {
            let wanted = element.rsplit(':').next().unwrap_or(element);
            name.local_name().as_ref() == wanted.as_bytes()
        } else {
            name.as_ref() == element.as_bytes()
        }
    }
}

/// Cut text nodes longer than `size` characters. Comments, CDATA and markup
/// are copied unchanged; malformed XML is returned as-is.
fn chomp(text: &str, size: usize) -> String {
    let mut reader = Reader::from_str(text);
    let mut chomped = String::with_capacity(text.len());
    let mut copied = 0usize;
    // end of the last markup event; text nodes always start there
    let mut markup_end = 0usize;

    loop {
        match reader.read_event() {
            Ok(Event::Text(node)) => {
                let start = markup_end;
                let end = start + node.len();
                if let Ok(content) = node.unescape() {
                    if content.chars().count() > size {
                        let kept: String = content.chars().take(size).collect();
                        chomped.push_str(&text[copied..start]);
                        chomped.push_str(&escape(kept.as_str()));
                        chomped.push_str(CHOMP_SUFFIX);
                        copied = end;
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => markup_end = byte_position(&reader),
            Err(_) => return text.to_string(),
        }
    }
    chomped.push_str(&text[copied..]);
    chomped
}

fn byte_position<R>(reader: &Reader<R>) -> usize {
    usize::try_from(reader.buffer_position()).unwrap_or(usize::MAX)
}
