//! Save Module - serialization sinks
//!
//! Walks a (node, offset) range and hands tokens to pluggable sinks:
//! - `Saver`: pull event stream that re-acquires the monitor per pull and
//!   surfaces concurrent modification through the version stamp
//! - Text saver: markup with entity escaping and prefix bookkeeping
//!
//! In-scope namespace declarations are reused for qualified names; a name
//! whose URI has no usable in-scope prefix gets one synthesized on the
//! element being written.

use std::sync::Arc;

use memchr::memchr3;
use smallvec::SmallVec;

use crate::cursor::{resolve_name, Cursor, XmlName};
use crate::error::{Result, StoreError};
use crate::store::node::{NodeId, NodeKind};
use crate::store::tree;
use crate::store::XmlStore;

/// Options for the text saver
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Emit an XML declaration before the content
    pub xml_decl: bool,
}

/// One serialization event
#[derive(Debug, Clone)]
pub enum SaveEvent {
    /// Element start with its attributes and namespace declarations
    StartElement {
        name: XmlName,
        attributes: Vec<(XmlName, String)>,
        namespaces: Vec<(String, String)>,
    },
    /// Element end
    EndElement { name: XmlName },
    /// Character data
    Text(String),
    /// Comment body
    Comment(String),
    /// Processing instruction
    ProcInst { target: String, data: String },
}

/// Pull event saver over a saved range.
///
/// Each pull briefly takes the document monitor, checks the version stamp
/// captured at creation, and reads one token. A mutation between pulls
/// fails that pull with `ConcurrentModification`; the document itself is
/// unharmed.
pub struct Saver {
    store: Arc<XmlStore>,
    expected_version: u64,
    cur: Option<NodeId>,
    last: NodeId,
    start_offset: u32,
    first_pull: bool,
}

impl Cursor {
    /// Stream the construct at the cursor as serialization events.
    ///
    /// Containers stream their whole range (the document streams its
    /// contents); a Text position streams the remainder of its run;
    /// attribute and End positions cannot be streamed.
    pub fn save_events(&self) -> Result<Saver> {
        let mut inner = self.lock();
        let (node, offset) = self.pos(&inner)?;
        let version = inner.version();
        let kind = inner.arena.node(node).kind;
        let (cur, last, start_offset) = match kind {
            NodeKind::Doc => {
                inner.ensure_contents_valid(node);
                match inner.content_range(node) {
                    Some((first, last)) => (Some(first), last, 0),
                    None => (None, node, 0),
                }
            }
            NodeKind::Begin => {
                let end = inner.range_last(node);
                (Some(node), end, 0)
            }
            NodeKind::Text => (Some(node), node, offset),
            NodeKind::Comment | NodeKind::ProcInst => (Some(node), node, 0),
            NodeKind::Attr | NodeKind::Namespace | NodeKind::End => {
                return Err(StoreError::state("cannot save a fragment starting here"));
            }
        };
        Ok(Saver {
            store: self.document(),
            expected_version: version,
            cur,
            last,
            start_offset,
            first_pull: true,
        })
    }

    /// Serialize the construct at the cursor to markup text
    pub fn save_to_string(&self, options: &SaveOptions) -> Result<String> {
        let mut saver = self.save_events()?;
        let mut writer = TextWriter::new(options);
        while let Some(event) = saver.next_event()? {
            writer.write(&event);
        }
        Ok(writer.finish())
    }

    /// Markup text of the construct at the cursor
    pub fn xml_text(&self) -> Result<String> {
        self.save_to_string(&SaveOptions::default())
    }
}

impl XmlStore {
    /// Serialize the whole document to markup text
    pub fn to_xml_string(&self) -> Result<String> {
        let cursor = self.new_cursor();
        cursor.save_to_string(&SaveOptions::default())
    }
}

impl Saver {
    /// Produce the next event, or None when the range is exhausted
    pub fn next_event(&mut self) -> Result<Option<SaveEvent>> {
        let Some(node) = self.cur else {
            return Ok(None);
        };
        let mut inner = self.store.inner.lock();
        let actual = inner.version();
        if actual != self.expected_version {
            return Err(StoreError::ConcurrentModification {
                expected: self.expected_version,
                actual,
            });
        }

        let kind = inner.arena.node(node).kind;
        let event = match kind {
            NodeKind::Begin => {
                inner.ensure_contents_valid(node);
                let name = resolve_name(&inner, inner.arena.node(node).name);
                let mut attributes = Vec::new();
                let mut namespaces = Vec::new();
                let mut walk = inner.next(node);
                while let Some(id) = walk {
                    let n = inner.arena.node(id);
                    match n.kind {
                        NodeKind::Attr => {
                            let aname = resolve_name(&inner, n.name);
                            let value = inner.node_text(id);
                            attributes.push((aname, value));
                        }
                        NodeKind::Namespace => {
                            let prefix = inner.names.get(n.name.local).to_string();
                            let uri = inner.node_text(id);
                            namespaces.push((prefix, uri));
                        }
                        _ => break,
                    }
                    walk = inner.next(id);
                }
                SaveEvent::StartElement {
                    name,
                    attributes,
                    namespaces,
                }
            }
            NodeKind::End => {
                let begin = inner.arena.node(node).partner.expect("end without begin");
                let name = resolve_name(&inner, inner.arena.node(begin).name);
                SaveEvent::EndElement { name }
            }
            NodeKind::Text => {
                let offset = if self.first_pull { self.start_offset } else { 0 };
                let pos = tree::cch_before(&inner.arena, node) + offset as u64;
                let cch = inner.arena.node(node).cch - offset;
                SaveEvent::Text(inner.text.fetch(pos as usize, cch as usize))
            }
            NodeKind::Comment => SaveEvent::Comment(inner.node_text(node)),
            NodeKind::ProcInst => {
                let target = inner.names.get(inner.arena.node(node).name.local).to_string();
                let data = inner.node_text(node);
                SaveEvent::ProcInst { target, data }
            }
            NodeKind::Doc | NodeKind::Attr | NodeKind::Namespace => {
                unreachable!("saver positioned on a non-streamable token")
            }
        };
        self.first_pull = false;

        // Advance: skip an element's attribute list, stop after `last`
        self.cur = if node == self.last {
            None
        } else if kind == NodeKind::Begin {
            Some(inner.attr_insertion_point(node))
        } else {
            inner.next(node)
        };
        // Lazy validation restored the stamp; nothing observable changed
        debug_assert_eq!(inner.version(), self.expected_version);
        Ok(Some(event))
    }
}

// ============================================================================
// Text writing
// ============================================================================

fn escape_text_into(s: &str, out: &mut String) {
    if memchr3(b'&', b'<', b'>', s.as_bytes()).is_none() {
        out.push_str(s);
        return;
    }
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
}

fn escape_attr_into(s: &str, out: &mut String) {
    if memchr3(b'&', b'<', b'"', s.as_bytes()).is_none() {
        out.push_str(s);
        return;
    }
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
}

struct TextWriter {
    out: String,
    /// Prefix bindings in scope, innermost last
    bindings: Vec<(String, String)>,
    /// Binding-stack watermark per open element
    marks: SmallVec<[usize; 8]>,
    /// Open tags as written, for matching close tags
    open_names: SmallVec<[String; 8]>,
    /// Set when the last start tag is still open (allows `<e/>` collapse)
    pending_start: bool,
    synth_counter: usize,
}

impl TextWriter {
    fn new(options: &SaveOptions) -> TextWriter {
        let mut out = String::new();
        if options.xml_decl {
            out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
        }
        TextWriter {
            out,
            bindings: vec![("xml".to_string(), crate::store::name::ns::XML.to_string())],
            marks: SmallVec::new(),
            open_names: SmallVec::new(),
            pending_start: false,
            synth_counter: 0,
        }
    }

    fn close_pending(&mut self) {
        if self.pending_start {
            self.out.push('>');
            self.pending_start = false;
        }
    }

    fn lookup_uri<'a>(&'a self, uri: &str, want_prefix: &'a str, allow_default: bool) -> Option<&'a str> {
        // Prefer the stored prefix hint when it still resolves to this URI
        if (allow_default || !want_prefix.is_empty())
            && self
                .bindings
                .iter()
                .rev()
                .find(|(p, _)| p == want_prefix)
                .is_some_and(|(_, u)| u == uri)
        {
            return Some(want_prefix);
        }
        self.bindings
            .iter()
            .rev()
            .filter(|(p, _)| allow_default || !p.is_empty())
            .find(|(p, u)| u == uri && self.resolves_to(p) == Some(u.as_str()))
            .map(|(p, _)| p.as_str())
    }

    fn resolves_to(&self, prefix: &str) -> Option<&str> {
        self.bindings
            .iter()
            .rev()
            .find(|(p, _)| p == prefix)
            .map(|(_, u)| u.as_str())
    }

    /// Choose (and if necessary synthesize) a prefix for a qualified name
    fn prefix_for(
        &mut self,
        name: &XmlName,
        allow_default: bool,
        extra_decls: &mut Vec<(String, String)>,
    ) -> String {
        if name.uri.is_empty() {
            return String::new();
        }
        if let Some(found) = self.lookup_uri(&name.uri, &name.prefix, allow_default) {
            return found.to_string();
        }
        // Synthesize: reuse the stored hint when it is free, else mint one
        let mut candidate = name.prefix.clone();
        while candidate.is_empty() || self.resolves_to(&candidate).is_some() {
            self.synth_counter += 1;
            candidate = format!("ns{}", self.synth_counter);
        }
        self.bindings.push((candidate.clone(), name.uri.clone()));
        extra_decls.push((candidate.clone(), name.uri.clone()));
        candidate
    }

    fn write(&mut self, event: &SaveEvent) {
        match event {
            SaveEvent::StartElement {
                name,
                attributes,
                namespaces,
            } => {
                self.close_pending();
                self.marks.push(self.bindings.len());
                let mut decls: Vec<(String, String)> = namespaces.clone();
                for (prefix, uri) in namespaces {
                    self.bindings.push((prefix.clone(), uri.clone()));
                }
                let prefix = self.prefix_for(name, true, &mut decls);
                // An unqualified element under a bound default namespace
                // needs the default undeclared
                if name.uri.is_empty() && self.resolves_to("").map_or(false, |u| !u.is_empty()) {
                    self.bindings.push((String::new(), String::new()));
                    decls.push((String::new(), String::new()));
                }
                let qname = if prefix.is_empty() {
                    name.local.clone()
                } else {
                    format!("{}:{}", prefix, name.local)
                };
                self.out.push('<');
                self.out.push_str(&qname);

                let mut attr_text: Vec<(String, String)> = Vec::new();
                for (aname, value) in attributes {
                    let aprefix = self.prefix_for(aname, false, &mut decls);
                    let aqname = if aprefix.is_empty() {
                        aname.local.clone()
                    } else {
                        format!("{}:{}", aprefix, aname.local)
                    };
                    attr_text.push((aqname, value.clone()));
                }
                for (prefix, uri) in &decls {
                    if prefix.is_empty() {
                        self.out.push_str(" xmlns=\"");
                    } else {
                        self.out.push_str(" xmlns:");
                        self.out.push_str(prefix);
                        self.out.push_str("=\"");
                    }
                    escape_attr_into(uri, &mut self.out);
                    self.out.push('"');
                }
                for (aqname, value) in &attr_text {
                    self.out.push(' ');
                    self.out.push_str(aqname);
                    self.out.push_str("=\"");
                    escape_attr_into(value, &mut self.out);
                    self.out.push('"');
                }
                self.pending_start = true;
                self.open_names.push(qname);
            }
            SaveEvent::EndElement { .. } => {
                let qname = self.open_names.pop().expect("unbalanced end event");
                if self.pending_start {
                    self.out.push_str("/>");
                    self.pending_start = false;
                } else {
                    self.out.push_str("</");
                    self.out.push_str(&qname);
                    self.out.push('>');
                }
                let mark = self.marks.pop().expect("unbalanced end event");
                self.bindings.truncate(mark);
            }
            SaveEvent::Text(text) => {
                self.close_pending();
                escape_text_into(text, &mut self.out);
            }
            SaveEvent::Comment(body) => {
                self.close_pending();
                self.out.push_str("<!--");
                self.out.push_str(body);
                self.out.push_str("-->");
            }
            SaveEvent::ProcInst { target, data } => {
                self.close_pending();
                self.out.push_str("<?");
                self.out.push_str(target);
                if !data.is_empty() {
                    self.out.push(' ');
                    self.out.push_str(data);
                }
                self.out.push_str("?>");
            }
        }
    }

    fn finish(mut self) -> String {
        self.close_pending();
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::XmlName;

    #[test]
    fn test_roundtrip_plain() {
        let input = "<a><b id=\"1\">x</b><c/>tail</a>";
        let store = XmlStore::parse(input).unwrap();
        assert_eq!(store.to_xml_string().unwrap(), input);
    }

    #[test]
    fn test_roundtrip_namespaces() {
        let input = r#"<p:a xmlns:p="urn:p" p:x="1"><p:b/></p:a>"#;
        let store = XmlStore::parse(input).unwrap();
        let saved = store.to_xml_string().unwrap();
        let reparsed = XmlStore::parse(&saved).unwrap();
        assert_eq!(reparsed.to_xml_string().unwrap(), saved);
        assert!(saved.contains("xmlns:p=\"urn:p\""));
    }

    #[test]
    fn test_escaping() {
        let store = XmlStore::parse("<a>1 &lt; 2 &amp; 3</a>").unwrap();
        let saved = store.to_xml_string().unwrap();
        assert_eq!(saved, "<a>1 &lt; 2 &amp; 3</a>");
    }

    #[test]
    fn test_attr_escaping() {
        let store = XmlStore::parse(r#"<a t="say &quot;hi&quot; &amp; go"/>"#).unwrap();
        let saved = store.to_xml_string().unwrap();
        assert_eq!(saved, r#"<a t="say &quot;hi&quot; &amp; go"/>"#);
    }

    #[test]
    fn test_fragment_save() {
        let store = XmlStore::parse("<a><b>x</b><c/></a>").unwrap();
        let c = store.new_cursor();
        c.to_first_child().unwrap();
        c.to_first_child().unwrap();
        assert_eq!(c.xml_text().unwrap(), "<b>x</b>");
    }

    #[test]
    fn test_synthesized_prefix() {
        // A qualified element built through the API without a declaration
        // gets one synthesized on save
        let store = XmlStore::new();
        let c = store.new_cursor();
        c.to_next_token().unwrap();
        c.insert_element(&XmlName::qualified("urn:q", "e", "q"))
            .unwrap();
        let saved = store.to_xml_string().unwrap();
        assert_eq!(saved, r#"<q:e xmlns:q="urn:q"/>"#);
    }

    #[test]
    fn test_xml_decl_option() {
        let store = XmlStore::parse("<a/>").unwrap();
        let c = store.new_cursor();
        let saved = c
            .save_to_string(&SaveOptions { xml_decl: true })
            .unwrap();
        assert_eq!(saved, "<?xml version=\"1.0\" encoding=\"UTF-8\"?><a/>");
    }

    #[test]
    fn test_concurrent_modification_detected() {
        let store = XmlStore::parse("<a><b/><c/></a>").unwrap();
        let c = store.new_cursor();
        c.to_first_child().unwrap();
        let mut saver = c.save_events().unwrap();
        assert!(saver.next_event().unwrap().is_some());

        // Mutate between pulls
        let editor = store.new_cursor();
        editor.to_first_child().unwrap();
        editor.insert_comment("intruder").unwrap();

        assert!(matches!(
            saver.next_event(),
            Err(StoreError::ConcurrentModification { .. })
        ));
    }

    #[test]
    fn test_save_event_stream() {
        let store = XmlStore::parse("<a x=\"1\"><!--hi--><b/>t</a>").unwrap();
        let c = store.new_cursor();
        c.to_first_child().unwrap();
        let mut saver = c.save_events().unwrap();
        let mut kinds = Vec::new();
        while let Some(event) = saver.next_event().unwrap() {
            kinds.push(match event {
                SaveEvent::StartElement { .. } => "start",
                SaveEvent::EndElement { .. } => "end",
                SaveEvent::Text(_) => "text",
                SaveEvent::Comment(_) => "comment",
                SaveEvent::ProcInst { .. } => "pi",
            });
        }
        assert_eq!(
            kinds,
            vec!["start", "comment", "start", "end", "text", "end"]
        );
    }
}
