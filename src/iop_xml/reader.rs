//! Streaming XML cursor (spec.md §4.3): "`next_node`, `next_child`,
//! `next_sibling`, `next_uncle`, `node_open`, `node_close`, `get_cstr`,
//! `get_i64/u64/bool/double`, and attribute accessors."
//!
//! `quick_xml`'s `Reader` is a pull parser over a flat event stream; the
//! unpacker above wants tree-shaped navigation (descend into a field's
//! element, come back up, skip an unknown subtree). Rather than
//! re-deriving that tree walk from raw push events at every call site,
//! [`parse`] drains the event stream once into a small arena
//! (`XmlDocument`) and [`XmlCursor`] provides the cursor operations
//! over that arena. The parse is O(n) in document size either way;
//! this just does the tree-building once instead of on every cursor
//! move.

use base64::Engine;
use quick_xml::events::Event;
use quick_xml::reader::Reader;

use crate::error::{IcError, IcStatus};

/// One parsed XML element.
#[derive(Debug, Clone)]
pub struct XmlNode {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    /// Concatenated text directly under this element (not including
    /// descendant elements' own text).
    pub text: String,
    /// Raw inner XML between this element's start and end tags, used
    /// for `xml`-typed fields (spec.md §4.3 "XML-inner").
    pub inner_xml: String,
    pub children: Vec<usize>,
    pub parent: Option<usize>,
}

impl XmlNode {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }
}

/// An arena of parsed elements, rooted at `root`.
#[derive(Debug)]
pub struct XmlDocument {
    pub nodes: Vec<XmlNode>,
    pub root: usize,
}

/// Parses a complete XML document into an [`XmlDocument`]. The
/// document must have exactly one root element (IOP XML payloads are
/// always single-rooted; there is no notion of a document fragment
/// here).
pub fn parse(xml: &[u8]) -> Result<XmlDocument, IcError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut nodes: Vec<XmlNode> = Vec::new();
    let mut stack: Vec<usize> = Vec::new();
    let mut root: Option<usize> = None;
    let mut inner_start: Vec<usize> = Vec::new();

    let mut buf = Vec::new();
    loop {
        let pos_before = reader.buffer_position() as usize;
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| IcError::new(IcStatus::Invalid, format!("XML parse error: {e}")))?;
        match event {
            Event::Start(start) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                let mut attrs = Vec::new();
                for a in start.attributes() {
                    let a = a.map_err(|e| IcError::new(IcStatus::Invalid, format!("bad XML attribute: {e}")))?;
                    let key = String::from_utf8_lossy(a.key.as_ref()).into_owned();
                    let value = a
                        .decode_and_unescape_value(reader.decoder())
                        .map_err(|e| IcError::new(IcStatus::Invalid, format!("bad XML attribute value: {e}")))?
                        .into_owned();
                    attrs.push((key, value));
                }
                let idx = nodes.len();
                nodes.push(XmlNode {
                    name,
                    attrs,
                    text: String::new(),
                    inner_xml: String::new(),
                    children: Vec::new(),
                    parent: stack.last().copied(),
                });
                if let Some(&parent) = stack.last() {
                    nodes[parent].children.push(idx);
                } else {
                    root = Some(idx);
                }
                inner_start.push(reader.buffer_position() as usize);
                stack.push(idx);
            }
            Event::Empty(start) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                let mut attrs = Vec::new();
                for a in start.attributes() {
                    let a = a.map_err(|e| IcError::new(IcStatus::Invalid, format!("bad XML attribute: {e}")))?;
                    let key = String::from_utf8_lossy(a.key.as_ref()).into_owned();
                    let value = a
                        .decode_and_unescape_value(reader.decoder())
                        .map_err(|e| IcError::new(IcStatus::Invalid, format!("bad XML attribute value: {e}")))?
                        .into_owned();
                    attrs.push((key, value));
                }
                let idx = nodes.len();
                nodes.push(XmlNode {
                    name,
                    attrs,
                    text: String::new(),
                    inner_xml: String::new(),
                    children: Vec::new(),
                    parent: stack.last().copied(),
                });
                if let Some(&parent) = stack.last() {
                    nodes[parent].children.push(idx);
                } else {
                    root = Some(idx);
                }
            }
            Event::Text(text) => {
                let decoded = text
                    .unescape()
                    .map_err(|e| IcError::new(IcStatus::Invalid, format!("bad XML text: {e}")))?;
                if let Some(&top) = stack.last() {
                    nodes[top].text.push_str(&decoded);
                }
            }
            Event::CData(cdata) => {
                let raw = cdata.into_inner();
                let decoded = String::from_utf8_lossy(&raw);
                if let Some(&top) = stack.last() {
                    nodes[top].text.push_str(&decoded);
                }
            }
            Event::End(_) => {
                let idx = stack.pop().ok_or_else(|| {
                    IcError::new(IcStatus::Invalid, "unmatched closing tag in XML input")
                })?;
                let start = inner_start.pop().unwrap_or(pos_before);
                let end = pos_before;
                if end >= start {
                    nodes[idx].inner_xml = String::from_utf8_lossy(&xml[start..end]).into_owned();
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let root = root.ok_or_else(|| IcError::new(IcStatus::Invalid, "XML input has no root element"))?;
    if !stack.is_empty() {
        return Err(IcError::new(IcStatus::Invalid, "unclosed XML element"));
    }
    Ok(XmlDocument { nodes, root })
}

/// A position within a parsed [`XmlDocument`], offering the cursor
/// operations spec.md §4.3 names.
#[derive(Clone, Copy)]
pub struct XmlCursor<'a> {
    doc: &'a XmlDocument,
    pos: usize,
}

impl<'a> XmlCursor<'a> {
    pub fn at_root(doc: &'a XmlDocument) -> Self {
        Self { doc, pos: doc.root }
    }

    fn node(&self) -> &'a XmlNode {
        &self.doc.nodes[self.pos]
    }

    /// Returns this element's tag name (the "open" side of
    /// `node_open`/`node_close`; there is no separate enter/exit event
    /// in the arena model, so this is a pure accessor).
    pub fn node_open(&self) -> &'a str {
        &self.node().name
    }

    /// Moves the cursor back to the parent element, completing the
    /// open/close bracket begun by a prior [`next_child`](Self::next_child).
    pub fn node_close(&mut self) {
        if let Some(parent) = self.node().parent {
            self.pos = parent;
        }
    }

    pub fn attr(&self, name: &str) -> Option<&'a str> {
        self.node().attr(name)
    }

    /// All attributes on this element, in document order.
    pub fn attrs(&self) -> &'a [(String, String)] {
        &self.node().attrs
    }

    pub fn get_cstr(&self) -> &'a str {
        &self.node().text
    }

    pub fn inner_xml(&self) -> &'a str {
        &self.node().inner_xml
    }

    pub fn get_i64(&self) -> Result<i64, IcError> {
        self.get_cstr()
            .trim()
            .parse()
            .map_err(|_| IcError::invalid(format!("{:?} is not a valid integer", self.get_cstr())))
    }

    pub fn get_u64(&self) -> Result<u64, IcError> {
        self.get_cstr()
            .trim()
            .parse()
            .map_err(|_| IcError::invalid(format!("{:?} is not a valid unsigned integer", self.get_cstr())))
    }

    pub fn get_bool(&self) -> Result<bool, IcError> {
        match self.get_cstr().trim() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            other => Err(IcError::invalid(format!("{other:?} is not a valid boolean"))),
        }
    }

    pub fn get_double(&self) -> Result<f64, IcError> {
        self.get_cstr()
            .trim()
            .parse()
            .map_err(|_| IcError::invalid(format!("{:?} is not a valid double", self.get_cstr())))
    }

    /// Base64-decodes this element's text content (spec.md §4.3
    /// "`data` fields are base64-decoded").
    pub fn get_base64(&self) -> Result<Vec<u8>, IcError> {
        base64::engine::general_purpose::STANDARD
            .decode(self.get_cstr().trim())
            .map_err(|e| IcError::invalid(format!("invalid base64 content: {e}")))
    }

    /// Descends to the first child element, pushing the current
    /// position implicitly (retrievable again via `node_close`).
    /// Returns `false` (leaving the cursor unmoved) if there is no
    /// child.
    pub fn next_child(&mut self) -> bool {
        match self.node().children.first() {
            Some(&child) => {
                self.pos = child;
                true
            }
            None => false,
        }
    }

    /// Moves to the next sibling element in document order. Returns
    /// `false` if this is the last child of its parent.
    pub fn next_sibling(&mut self) -> bool {
        let Some(parent) = self.node().parent else {
            return false;
        };
        let siblings = &self.doc.nodes[parent].children;
        let idx = siblings.iter().position(|&c| c == self.pos).expect("cursor position not found among siblings");
        match siblings.get(idx + 1) {
            Some(&next) => {
                self.pos = next;
                true
            }
            None => false,
        }
    }

    /// Climbs to the parent's next sibling, skipping the remainder of
    /// the current element's subtree — used to step over an unknown
    /// or already-handled element.
    pub fn next_uncle(&mut self) -> bool {
        let Some(parent) = self.node().parent else {
            return false;
        };
        self.pos = parent;
        self.next_sibling()
    }

    /// Preorder traversal: first try a child, then a sibling, then
    /// climb ancestors trying their next sibling until one is found or
    /// the root is reached.
    pub fn next_node(&mut self) -> bool {
        if self.next_child() {
            return true;
        }
        loop {
            if self.next_sibling() {
                return true;
            }
            if self.node().parent.is_none() {
                return false;
            }
            self.pos = self.node().parent.unwrap();
        }
    }

    /// Finds the first child element named `name`, leaving the cursor
    /// there. Does not disturb the cursor if no such child exists.
    pub fn find_child(&self, name: &str) -> Option<XmlCursor<'a>> {
        self.node()
            .children
            .iter()
            .copied()
            .find(|&idx| self.doc.nodes[idx].name == name)
            .map(|pos| XmlCursor { doc: self.doc, pos })
    }

    pub fn children(&self) -> impl Iterator<Item = XmlCursor<'a>> + '_ {
        self.node().children.iter().map(move |&pos| XmlCursor { doc: self.doc, pos })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_elements_and_text() {
        let doc = parse(b"<Point><x>3</x><y>4</y></Point>").unwrap();
        let cursor = XmlCursor::at_root(&doc);
        assert_eq!(cursor.node_open(), "Point");
        assert_eq!(cursor.children().count(), 2);
        let x = cursor.find_child("x").unwrap();
        assert_eq!(x.get_cstr(), "3");
        assert_eq!(x.get_i64().unwrap(), 3);
    }

    #[test]
    fn next_node_visits_in_preorder() {
        let doc = parse(b"<a><b/><c><d/></c></a>").unwrap();
        let mut cursor = XmlCursor::at_root(&doc);
        let mut order = vec![cursor.node_open().to_string()];
        while cursor.next_node() {
            order.push(cursor.node_open().to_string());
        }
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn next_uncle_skips_remainder_of_parents_subtree() {
        let doc = parse(b"<a><b><x/></b><c/></a>").unwrap();
        let mut cursor = XmlCursor::at_root(&doc);
        cursor.next_child(); // a -> b
        cursor.next_child(); // b -> x
        assert_eq!(cursor.node_open(), "x");
        cursor.next_uncle(); // x's parent is b; land on b's next sibling, c
        assert_eq!(cursor.node_open(), "c");
    }

    #[test]
    fn attributes_are_captured() {
        let doc = parse(br#"<Shape xsi:type="ns:Circle"/>"#).unwrap();
        let cursor = XmlCursor::at_root(&doc);
        assert_eq!(cursor.attr("xsi:type"), Some("ns:Circle"));
    }
}
