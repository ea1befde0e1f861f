//! Minimal XML emission (spec.md §4.3 "Packing is straightforward
//! forward traversal"). Unlike the reader side, packing never needs to
//! look back, so a thin wrapper over `quick_xml::Writer`'s event API is
//! enough — no arena.

use std::io::Cursor;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::writer::Writer;

use crate::error::{IcError, IcStatus};

pub struct XmlWriter {
    inner: Writer<Cursor<Vec<u8>>>,
}

impl Default for XmlWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl XmlWriter {
    pub fn new() -> Self {
        Self {
            inner: Writer::new(Cursor::new(Vec::new())),
        }
    }

    fn wrap(&mut self, event: Event) -> Result<(), IcError> {
        self.inner
            .write_event(event)
            .map_err(|e| IcError::new(IcStatus::ServerError, format!("XML write error: {e}")))
    }

    pub fn start(&mut self, name: &str, attrs: &[(&str, &str)]) -> Result<(), IcError> {
        let mut start = BytesStart::new(name);
        for (k, v) in attrs {
            start.push_attribute((*k, *v));
        }
        self.wrap(Event::Start(start))
    }

    pub fn empty(&mut self, name: &str, attrs: &[(&str, &str)]) -> Result<(), IcError> {
        let mut start = BytesStart::new(name);
        for (k, v) in attrs {
            start.push_attribute((*k, *v));
        }
        self.wrap(Event::Empty(start))
    }

    pub fn text(&mut self, content: &str) -> Result<(), IcError> {
        self.wrap(Event::Text(BytesText::new(content)))
    }

    pub fn raw_inner(&mut self, raw_xml: &str) -> Result<(), IcError> {
        // `xml`-typed fields are re-emitted verbatim (spec.md §4.3
        // "XML-inner"); they are already well-formed XML, not text to
        // be escaped.
        use std::io::Write;
        self.inner
            .get_mut()
            .write_all(raw_xml.as_bytes())
            .map_err(|e| IcError::new(IcStatus::ServerError, format!("XML write error: {e}")))
    }

    pub fn end(&mut self, name: &str) -> Result<(), IcError> {
        self.wrap(Event::End(BytesEnd::new(name)))
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.inner.into_inner().into_inner()
    }
}
