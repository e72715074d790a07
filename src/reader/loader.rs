//! Loader - reader events into a fresh document
//!
//! Feeds pull-parser events through the same mutation primitives the
//! cursor uses, resolving namespace declarations as scopes open and close.

use std::sync::Arc;

use log::debug;

use crate::cursor::edit::insert_chars_at;
use crate::error::{Result, StoreError};
use crate::reader::slice::{SliceReader, XmlEvent};
use crate::store::name::{self, ns};
use crate::store::node::{NodeId, StoreNode};
use crate::store::root::{EditPhase, StoreInner};
use crate::store::{QName, XmlStore};

fn err(offset: usize, message: impl Into<String>) -> StoreError {
    StoreError::Parse {
        offset,
        message: message.into(),
    }
}

/// Stack-based namespace scope resolver
struct NsScopes {
    bindings: Vec<(String, String, usize)>,
    depth: usize,
}

impl NsScopes {
    fn new() -> Self {
        NsScopes {
            bindings: vec![
                ("xml".to_string(), ns::XML.to_string(), 0),
                ("xmlns".to_string(), ns::XMLNS.to_string(), 0),
            ],
            depth: 0,
        }
    }

    fn push_scope(&mut self) {
        self.depth += 1;
    }

    fn pop_scope(&mut self) {
        while let Some((_, _, depth)) = self.bindings.last() {
            if *depth < self.depth {
                break;
            }
            self.bindings.pop();
        }
        self.depth = self.depth.saturating_sub(1);
    }

    fn declare(&mut self, prefix: &str, uri: &str) {
        self.bindings
            .push((prefix.to_string(), uri.to_string(), self.depth));
    }

    fn resolve(&self, prefix: &str) -> Option<&str> {
        self.bindings
            .iter()
            .rev()
            .find(|(p, _, _)| p == prefix)
            .map(|(_, u, _)| u.as_str())
    }

    /// Default namespace URI, empty when undeclared
    fn default_uri(&self) -> &str {
        self.resolve("").unwrap_or("")
    }
}

/// Split a raw tag or attribute name into (prefix, local)
fn split_name(raw: &str, at: usize) -> Result<(&str, &str)> {
    match raw.find(':') {
        None => Ok(("", raw)),
        Some(colon) => {
            let (prefix, local) = (&raw[..colon], &raw[colon + 1..]);
            if prefix.is_empty() || local.is_empty() || local.contains(':') {
                return Err(err(at, format!("malformed qualified name {:?}", raw)));
            }
            Ok((prefix, local))
        }
    }
}

impl XmlStore {
    /// Parse a document from text.
    ///
    /// The whole build runs under the new document's monitor; nothing can
    /// observe a half-loaded store.
    pub fn parse(input: &str) -> Result<Arc<XmlStore>> {
        let store = XmlStore::new();
        {
            let mut inner = store.inner.lock();
            load_into(&mut inner, input)?;
        }
        debug!(
            "parsed document {} ({} bytes, {} nodes)",
            store.store_id(),
            input.len(),
            store.node_count()
        );
        Ok(store)
    }
}

fn load_into(inner: &mut StoreInner, input: &str) -> Result<()> {
    let mut reader = SliceReader::new(input);
    let mut scopes = NsScopes::new();
    // Open elements: (begin, end, raw tag name for matching)
    let mut stack: Vec<(NodeId, NodeId, String)> = Vec::new();

    while let Some(event) = reader.next_event()? {
        let at = reader.offset();
        let cur_end = stack.last().map(|s| s.1).unwrap_or(inner.doc_end);
        let cur_container = stack.last().map(|s| s.0).unwrap_or(inner.doc);
        match event {
            XmlEvent::StartElement {
                name: raw_name,
                attributes,
                empty,
            } => {
                scopes.push_scope();

                // Declarations come into scope before any name resolves
                for attr in &attributes {
                    if attr.name == "xmlns" {
                        scopes.declare("", &attr.value);
                    } else if let Some(prefix) = attr.name.strip_prefix("xmlns:") {
                        scopes.declare(prefix, &attr.value);
                    }
                }

                let (prefix, local) = split_name(raw_name, at)?;
                if !name::is_ncname(local) {
                    return Err(err(at, format!("not a valid element name: {:?}", local)));
                }
                let uri = if prefix.is_empty() {
                    scopes.default_uri().to_string()
                } else {
                    scopes
                        .resolve(prefix)
                        .ok_or_else(|| err(at, format!("unbound namespace prefix {:?}", prefix)))?
                        .to_string()
                };
                let qname = QName::new(
                    inner.names.intern(&uri),
                    inner.names.intern(local),
                    inner.names.intern(prefix),
                );
                let (begin, end) =
                    inner.insert_pair_before(cur_end, qname, cur_container, EditPhase::Normal);

                // Namespace tokens for this scope's declarations
                for attr in &attributes {
                    let decl_prefix = if attr.name == "xmlns" {
                        Some("")
                    } else {
                        attr.name.strip_prefix("xmlns:")
                    };
                    if let Some(decl_prefix) = decl_prefix {
                        let prefix_q = QName::unqualified(inner.names.intern(decl_prefix));
                        inner.insert_leaf_before(
                            end,
                            StoreNode::namespace(prefix_q),
                            begin,
                            Some(&attr.value),
                            EditPhase::Normal,
                        );
                    }
                }

                // Ordinary attributes
                for attr in &attributes {
                    if attr.name == "xmlns" || attr.name.starts_with("xmlns:") {
                        continue;
                    }
                    let (aprefix, alocal) = split_name(attr.name, at)?;
                    if !name::is_ncname(alocal) {
                        return Err(err(at, format!("not a valid attribute name: {:?}", alocal)));
                    }
                    // Unprefixed attributes carry no namespace
                    let auri = if aprefix.is_empty() {
                        ""
                    } else {
                        scopes.resolve(aprefix).ok_or_else(|| {
                            err(at, format!("unbound namespace prefix {:?}", aprefix))
                        })?
                    };
                    let auri = auri.to_string();
                    let aq = QName::new(
                        inner.names.intern(&auri),
                        inner.names.intern(alocal),
                        inner.names.intern(aprefix),
                    );
                    let value = if attr.value.is_empty() {
                        None
                    } else {
                        Some(attr.value.as_ref())
                    };
                    inner.insert_leaf_before(
                        end,
                        StoreNode::attr(aq),
                        begin,
                        value,
                        EditPhase::Normal,
                    );
                }

                if empty {
                    scopes.pop_scope();
                } else {
                    stack.push((begin, end, raw_name.to_string()));
                }
            }
            XmlEvent::EndElement { name: raw_name } => {
                let (_, _, open) = stack
                    .pop()
                    .ok_or_else(|| err(at, format!("unexpected end tag </{}>", raw_name)))?;
                if open != raw_name {
                    return Err(err(
                        at,
                        format!("tag mismatch: <{}> closed with </{}>", open, raw_name),
                    ));
                }
                scopes.pop_scope();
            }
            XmlEvent::Text(text) => {
                insert_chars_at(inner, cur_end, 0, &text)?;
            }
            XmlEvent::Comment(body) => {
                let body = if body.is_empty() { None } else { Some(body) };
                inner.insert_leaf_before(
                    cur_end,
                    StoreNode::comment(),
                    cur_container,
                    body,
                    EditPhase::Normal,
                );
            }
            XmlEvent::ProcInst { target, data } => {
                if !name::is_ncname(target) {
                    return Err(err(at, format!("not a valid PI target: {:?}", target)));
                }
                let target_q = QName::unqualified(inner.names.intern(target));
                inner.insert_leaf_before(
                    cur_end,
                    StoreNode::proc_inst(target_q),
                    cur_container,
                    data.filter(|d| !d.is_empty()),
                    EditPhase::Normal,
                );
            }
            XmlEvent::XmlDecl => {}
        }
    }

    if let Some((_, _, open)) = stack.last() {
        return Err(err(input.len(), format!("unclosed tag <{}>", open)));
    }
    Ok(())
}
