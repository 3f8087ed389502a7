//! Small XML element tree over the quick-xml event API.
//!
//! Both sides of the pipeline speak XML (libvirt domains in and out,
//! OVF in and out), and all of them are tree-shaped documents small
//! enough to hold in memory, so one tiny DOM beats four event-driven
//! state machines.

use std::io::Cursor;

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use crate::{Error, Result};

/// One XML element: name (prefix preserved), attributes, text, children.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    /// Qualified element name, e.g. `disk` or `vmware:moref`.
    pub name: String,
    /// Attributes in document order, names qualified.
    pub attrs: Vec<(String, String)>,
    /// Concatenated direct text content, trimmed.
    pub text: String,
    /// Child elements in document order.
    pub children: Vec<Element>,
}

impl Element {
    /// Creates an empty element.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..Self::default()
        }
    }

    /// Builder: adds an attribute.
    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.push((name.to_owned(), value.to_owned()));
        self
    }

    /// Builder: sets the text content.
    pub fn text(mut self, text: &str) -> Self {
        self.text = text.to_owned();
        self
    }

    /// Builder: appends a child element.
    pub fn child(mut self, child: Self) -> Self {
        self.children.push(child);
        self
    }

    /// Appends a child in place.
    pub fn push(&mut self, child: Self) {
        self.children.push(child);
    }

    /// Parses a whole document into its root element.
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;
        loop {
            match reader
                .read_event()
                .map_err(|e| Error::Input(format!("XML parse error: {e}")))?
            {
                Event::Start(e) => {
                    stack.push(element_from_start(&e)?);
                }
                Event::Empty(e) => {
                    let el = element_from_start(&e)?;
                    attach(&mut stack, &mut root, el);
                }
                Event::Text(t) => {
                    if let Some(cur) = stack.last_mut() {
                        let text = t
                            .unescape()
                            .map_err(|e| Error::Input(format!("XML text error: {e}")))?;
                        cur.text.push_str(text.trim());
                    }
                }
                Event::End(_) => {
                    let el = stack
                        .pop()
                        .ok_or_else(|| Error::Input("unbalanced XML".into()))?;
                    attach(&mut stack, &mut root, el);
                }
                Event::Eof => break,
                _ => {}
            }
        }
        root.ok_or_else(|| Error::Input("empty XML document".into()))
    }

    /// First child whose qualified name matches exactly.
    pub fn find(&self, name: &str) -> Option<&Self> {
        self.children.iter().find(|c| c.name == name)
    }

    /// First child whose local name (after any `prefix:`) matches.
    pub fn find_local(&self, local: &str) -> Option<&Self> {
        self.children.iter().find(|c| local_name(&c.name) == local)
    }

    /// All children with the given qualified name.
    pub fn find_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Self> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Attribute value by qualified name.
    pub fn attr_value(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Attribute value by local name.
    pub fn attr_local(&self, local: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| local_name(n) == local)
            .map(|(_, v)| v.as_str())
    }

    /// Text of the first child with the given name, if any.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.find(name).map(|c| c.text.as_str())
    }

    /// Serializes the tree as an indented document with XML declaration.
    pub fn to_document(&self) -> String {
        let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
        let _ = writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)));
        self.write(&mut writer);
        let bytes = writer.into_inner().into_inner();
        let mut s = String::from_utf8_lossy(&bytes).into_owned();
        s.push('\n');
        s
    }

    fn write(&self, writer: &mut Writer<Cursor<Vec<u8>>>) {
        let mut start = BytesStart::new(self.name.as_str());
        for (k, v) in &self.attrs {
            start.push_attribute((k.as_str(), v.as_str()));
        }
        if self.children.is_empty() && self.text.is_empty() {
            let _ = writer.write_event(Event::Empty(start));
            return;
        }
        let _ = writer.write_event(Event::Start(start));
        if !self.text.is_empty() {
            let _ = writer.write_event(Event::Text(BytesText::new(&self.text)));
        }
        for child in &self.children {
            child.write(writer);
        }
        let _ = writer.write_event(Event::End(BytesEnd::new(self.name.as_str())));
    }
}

/// Local part of a possibly prefixed name.
pub fn local_name(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

/// Converts a start tag into an element shell.
fn element_from_start(e: &BytesStart<'_>) -> Result<Element> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut el = Element::new(&name);
    for attr in e.attributes() {
        let attr = attr.map_err(|e| Error::Input(format!("XML attribute error: {e}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| Error::Input(format!("XML attribute error: {e}")))?
            .into_owned();
        el.attrs.push((key, value));
    }
    Ok(el)
}

/// Attaches a finished element to its parent, or makes it the root.
fn attach(stack: &mut [Element], root: &mut Option<Element>, el: Element) {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(el);
    } else if root.is_none() {
        *root = Some(el);
    }
}
