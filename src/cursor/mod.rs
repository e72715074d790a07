//! Cursor Module - stateful navigation and editing
//!
//! A cursor is a lightweight (node, offset) handle into one document:
//! - Token-wise and character-wise traversal over the in-order token stream
//! - Structural mutation (insert/remove/move/copy) in `edit`
//! - Keyed bookmarks in `bookmark`, selection stack in `selection`
//!
//! The position state lives in the owning store's registry, so the store can
//! re-home every cursor whose node is removed. The handle itself only holds
//! the document reference and a registry slot.

pub mod bookmark;
pub mod edit;
pub mod selection;
pub mod token;

pub use token::TokenType;

use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::MutexGuard;

use crate::error::{Result, StoreError};
use crate::store::node::{NodeId, NodeKind};
use crate::store::root::StoreInner;
use crate::store::tree;
use crate::store::{QName, XmlStore};

/// A resolved qualified name
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct XmlName {
    pub uri: String,
    pub local: String,
    pub prefix: String,
}

impl XmlName {
    /// Unqualified name
    pub fn local(local: impl Into<String>) -> Self {
        XmlName {
            uri: String::new(),
            local: local.into(),
            prefix: String::new(),
        }
    }

    /// Name in a namespace with a suggested prefix
    pub fn qualified(
        uri: impl Into<String>,
        local: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        XmlName {
            uri: uri.into(),
            local: local.into(),
            prefix: prefix.into(),
        }
    }
}

/// A stateful position handle into one document.
///
/// Many cursors may reference the same position; none owns the nodes it
/// points at. Dropping the handle disposes it implicitly; `dispose` does so
/// explicitly, after which every call fails with `StoreError::Disposed`.
pub struct Cursor {
    store: Arc<XmlStore>,
    slot: u32,
    gen: u32,
}

impl XmlStore {
    /// Create a cursor positioned at the start of the document
    pub fn new_cursor(&self) -> Cursor {
        let store = self.arc();
        let mut inner = self.inner.lock();
        let doc = inner.doc;
        let (slot, gen) = inner.new_cursor_state(doc, 0);
        Cursor { store, slot, gen }
    }
}

impl Cursor {
    /// The document this cursor points into
    pub fn document(&self) -> Arc<XmlStore> {
        Arc::clone(&self.store)
    }

    /// Check whether both cursors point into the same document
    pub fn is_in_same_document(&self, other: &Cursor) -> bool {
        self.store.store_id() == other.store.store_id()
    }

    /// Duplicate this cursor at its current position
    pub fn new_cursor(&self) -> Result<Cursor> {
        let mut inner = self.lock();
        let (node, offset) = self.pos(&inner)?;
        let (slot, gen) = inner.new_cursor_state(node, offset);
        Ok(Cursor {
            store: Arc::clone(&self.store),
            slot,
            gen,
        })
    }

    /// Dispose the cursor; it may not be reused afterwards
    pub fn dispose(&self) {
        let mut inner = self.lock();
        inner.dispose_cursor(self.slot, self.gen);
    }

    /// Check whether the cursor has been disposed
    pub fn is_disposed(&self) -> bool {
        let inner = self.lock();
        inner.cursor(self.slot, self.gen).is_err()
    }

    // ------------------------------------------------------------------
    // Internal access
    // ------------------------------------------------------------------

    pub(crate) fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.store.inner.lock()
    }

    pub(crate) fn store(&self) -> &Arc<XmlStore> {
        &self.store
    }

    pub(crate) fn slot_key(&self) -> (u32, u32) {
        (self.slot, self.gen)
    }

    pub(crate) fn pos(&self, inner: &StoreInner) -> Result<(NodeId, u32)> {
        let state = inner.cursor(self.slot, self.gen)?;
        debug_assert!(inner.arena.check(state.node, state.node_gen));
        Ok((state.node, state.offset))
    }

    pub(crate) fn set_pos(&self, inner: &mut StoreInner, node: NodeId, offset: u32) {
        let gen = inner.arena.generation(node);
        let state = inner
            .cursor_mut(self.slot, self.gen)
            .expect("position update on disposed cursor");
        state.node = node;
        state.node_gen = gen;
        state.offset = offset;
    }

    fn token_at(inner: &StoreInner, node: NodeId, offset: u32) -> TokenType {
        if offset > 0 {
            return TokenType::Text;
        }
        let n = inner.arena.node(node);
        match n.kind {
            NodeKind::Doc => TokenType::StartDoc,
            NodeKind::Begin => TokenType::Start,
            NodeKind::Attr => TokenType::Attr,
            NodeKind::Namespace => TokenType::Namespace,
            NodeKind::Text => TokenType::Text,
            NodeKind::Comment => TokenType::Comment,
            NodeKind::ProcInst => TokenType::ProcInst,
            NodeKind::End => {
                if n.partner == Some(inner.doc) {
                    TokenType::EndDoc
                } else {
                    TokenType::End
                }
            }
        }
    }

    /// Force lazy contents valid for the container whose interior the next
    /// traversal step would enter
    fn ensure_ahead(inner: &mut StoreInner, node: NodeId) {
        let n = inner.arena.node(node);
        match n.kind {
            NodeKind::Doc | NodeKind::Begin => {
                if n.contents_invalid() {
                    inner.ensure_contents_valid(node);
                }
            }
            NodeKind::Attr | NodeKind::Namespace => {
                let container = n.container.expect("attribute without container");
                if inner.arena.node(container).contents_invalid() {
                    inner.ensure_contents_valid(container);
                }
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Token queries
    // ------------------------------------------------------------------

    /// Token type at the current position
    pub fn token_type(&self) -> Result<TokenType> {
        let inner = self.lock();
        let (node, offset) = self.pos(&inner)?;
        Ok(Self::token_at(&inner, node, offset))
    }

    /// Name of the current Start/Attr/Namespace/ProcInst token
    pub fn name(&self) -> Result<Option<XmlName>> {
        let inner = self.lock();
        let (node, offset) = self.pos(&inner)?;
        if offset > 0 {
            return Ok(None);
        }
        let n = inner.arena.node(node);
        match n.kind {
            NodeKind::Begin | NodeKind::Attr | NodeKind::Namespace | NodeKind::ProcInst => {
                Ok(Some(resolve_name(&inner, n.name)))
            }
            _ => Ok(None),
        }
    }

    /// Check whether a next token exists
    pub fn has_next_token(&self) -> Result<bool> {
        let inner = self.lock();
        let (node, _) = self.pos(&inner)?;
        Ok(node != inner.doc_end)
    }

    /// Check whether a previous token exists; false only at the true start
    pub fn has_prev_token(&self) -> Result<bool> {
        let inner = self.lock();
        let (node, offset) = self.pos(&inner)?;
        Ok(!(node == inner.doc && offset == 0))
    }

    /// Advance to the next token, returning its type (`None` at the end,
    /// without moving)
    pub fn to_next_token(&self) -> Result<TokenType> {
        let mut inner = self.lock();
        let (node, _offset) = self.pos(&inner)?;
        if node == inner.doc_end {
            return Ok(TokenType::None);
        }
        Self::ensure_ahead(&mut inner, node);
        let next = match inner.next(node) {
            Some(next) => next,
            None => return Ok(TokenType::None),
        };
        self.set_pos(&mut inner, next, 0);
        Ok(Self::token_at(&inner, next, 0))
    }

    /// Step back to the previous token, returning its type (`None` at the
    /// start, without moving)
    pub fn to_prev_token(&self) -> Result<TokenType> {
        let mut inner = self.lock();
        let (node, offset) = self.pos(&inner)?;
        if offset > 0 {
            // Back to the start of this text run: that is the Text token
            self.set_pos(&mut inner, node, 0);
            return Ok(TokenType::Text);
        }
        if inner.arena.node(node).kind == NodeKind::End {
            let begin = inner.arena.node(node).partner.expect("end without begin");
            Self::ensure_ahead(&mut inner, begin);
        }
        let prev = match inner.prev(node) {
            Some(prev) => prev,
            None => return Ok(TokenType::None),
        };
        self.set_pos(&mut inner, prev, 0);
        Ok(Self::token_at(&inner, prev, 0))
    }

    // ------------------------------------------------------------------
    // Character stepping
    // ------------------------------------------------------------------

    /// Characters available forward before the next token boundary.
    ///
    /// Recomputed on every call: any structural change invalidates it.
    pub fn post_cch(&self) -> Result<usize> {
        let inner = self.lock();
        let (node, offset) = self.pos(&inner)?;
        let n = inner.arena.node(node);
        if n.is_text() {
            Ok((n.cch - offset) as usize)
        } else {
            Ok(0)
        }
    }

    /// Characters available backward before the previous token boundary
    pub fn pre_cch(&self) -> Result<usize> {
        let inner = self.lock();
        let (node, offset) = self.pos(&inner)?;
        if offset > 0 {
            return Ok(offset as usize);
        }
        match inner.prev(node) {
            Some(p) if inner.arena.node(p).is_text() => Ok(inner.arena.node(p).cch as usize),
            _ => Ok(0),
        }
    }

    /// Move forward up to `max` characters, returning the count moved.
    ///
    /// Consuming the whole remaining run crosses to the next node at
    /// offset 0.
    pub fn to_next_char(&self, max: usize) -> Result<usize> {
        let mut inner = self.lock();
        let (node, offset) = self.pos(&inner)?;
        let n = inner.arena.node(node);
        if !n.is_text() {
            return Ok(0);
        }
        let avail = (n.cch - offset) as usize;
        if avail == 0 {
            return Ok(0);
        }
        if max >= avail {
            let next = inner.next(node).expect("text run at document end");
            self.set_pos(&mut inner, next, 0);
            Ok(avail)
        } else {
            self.set_pos(&mut inner, node, offset + max as u32);
            Ok(max)
        }
    }

    /// Move backward up to `max` characters, returning the count moved
    pub fn to_prev_char(&self, max: usize) -> Result<usize> {
        let mut inner = self.lock();
        let (node, offset) = self.pos(&inner)?;
        if offset > 0 {
            let moved = max.min(offset as usize);
            self.set_pos(&mut inner, node, offset - moved as u32);
            return Ok(moved);
        }
        let prev = match inner.prev(node) {
            Some(p) if inner.arena.node(p).is_text() => p,
            _ => return Ok(0),
        };
        let cch = inner.arena.node(prev).cch as usize;
        let moved = max.min(cch);
        self.set_pos(&mut inner, prev, (cch - moved) as u32);
        Ok(moved)
    }

    /// Fetch up to `max` characters forward of the cursor without moving
    pub fn chars_forward(&self, max: usize) -> Result<String> {
        let mut inner = self.lock();
        let (node, offset) = self.pos(&inner)?;
        let n = inner.arena.node(node);
        if !n.is_text() {
            return Ok(String::new());
        }
        let avail = (n.cch - offset) as usize;
        let take = max.min(avail);
        let pos = tree::cch_before(&inner.arena, node) + offset as u64;
        Ok(inner.text.fetch(pos as usize, take))
    }

    // ------------------------------------------------------------------
    // Hierarchical navigation
    // ------------------------------------------------------------------

    /// Move to the start of the document
    pub fn to_start_doc(&self) -> Result<()> {
        let mut inner = self.lock();
        self.pos(&inner)?;
        let doc = inner.doc;
        self.set_pos(&mut inner, doc, 0);
        Ok(())
    }

    /// Move to the end of the document
    pub fn to_end_doc(&self) -> Result<()> {
        let mut inner = self.lock();
        self.pos(&inner)?;
        let doc_end = inner.doc_end;
        self.set_pos(&mut inner, doc_end, 0);
        Ok(())
    }

    /// Move to the containing element's Start (or StartDoc); false at the
    /// document root
    pub fn to_parent(&self) -> Result<bool> {
        let mut inner = self.lock();
        let (node, _) = self.pos(&inner)?;
        if node == inner.doc {
            return Ok(false);
        }
        let container = inner.content_container_at(node);
        self.set_pos(&mut inner, container, 0);
        Ok(true)
    }

    /// Move to the first child element; false when there is none
    pub fn to_first_child(&self) -> Result<bool> {
        self.to_nth_child(crate::store::NameTest::Any, 0)
    }

    /// Move to the nth child element matching `test`
    pub(crate) fn to_nth_child(&self, test: crate::store::NameTest<'_>, n: usize) -> Result<bool> {
        let mut inner = self.lock();
        let (node, _) = self.pos(&inner)?;
        if !inner.arena.node(node).is_container() {
            return Ok(false);
        }
        Self::ensure_ahead(&mut inner, node);
        match inner.find_nth_begin(node, test, n) {
            Some(child) => {
                self.set_pos(&mut inner, child, 0);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Move to the first child element with the given name
    pub fn to_child_named(&self, uri: &str, local: &str) -> Result<bool> {
        let mut inner = self.lock();
        let (node, _) = self.pos(&inner)?;
        if !inner.arena.node(node).is_container() {
            return Ok(false);
        }
        Self::ensure_ahead(&mut inner, node);
        let (Some(uri_id), Some(local_id)) = (inner.names.lookup(uri), inner.names.lookup(local))
        else {
            return Ok(false);
        };
        let name = QName::new(uri_id, local_id, 0);
        match inner.find_nth_begin(node, crate::store::NameTest::Name(name), 0) {
            Some(child) => {
                self.set_pos(&mut inner, child, 0);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Move to the next sibling element; only meaningful on a Start token
    pub fn to_next_sibling(&self) -> Result<bool> {
        let mut inner = self.lock();
        let (node, _) = self.pos(&inner)?;
        if !inner.arena.node(node).is_begin() {
            return Ok(false);
        }
        let end = inner.range_last(node);
        let mut cur = inner.next(end);
        while let Some(id) = cur {
            let n = inner.arena.node(id);
            match n.kind {
                NodeKind::Begin => {
                    self.set_pos(&mut inner, id, 0);
                    return Ok(true);
                }
                NodeKind::End => return Ok(false),
                _ => cur = inner.next(id),
            }
        }
        Ok(false)
    }

    /// Move to the previous sibling element; only meaningful on a Start token
    pub fn to_prev_sibling(&self) -> Result<bool> {
        let mut inner = self.lock();
        let (node, _) = self.pos(&inner)?;
        if !inner.arena.node(node).is_begin() {
            return Ok(false);
        }
        let mut cur = inner.prev(node);
        while let Some(id) = cur {
            let n = inner.arena.node(id);
            match n.kind {
                NodeKind::End => {
                    let begin = n.partner.expect("end without begin");
                    if begin == inner.doc {
                        return Ok(false);
                    }
                    self.set_pos(&mut inner, begin, 0);
                    return Ok(true);
                }
                NodeKind::Begin | NodeKind::Doc => return Ok(false),
                _ => cur = inner.prev(id),
            }
        }
        Ok(false)
    }

    /// Move to the first attribute of the current element
    pub fn to_first_attribute(&self) -> Result<bool> {
        let mut inner = self.lock();
        let (node, _) = self.pos(&inner)?;
        if !inner.arena.node(node).is_begin() {
            return Ok(false);
        }
        let mut cur = inner.next(node);
        while let Some(id) = cur {
            let n = inner.arena.node(id);
            if !n.is_attr_like() {
                return Ok(false);
            }
            if n.kind == NodeKind::Attr {
                self.set_pos(&mut inner, id, 0);
                return Ok(true);
            }
            cur = inner.next(id);
        }
        Ok(false)
    }

    /// Move to the next attribute of the same element
    pub fn to_next_attribute(&self) -> Result<bool> {
        let mut inner = self.lock();
        let (node, _) = self.pos(&inner)?;
        if inner.arena.node(node).kind != NodeKind::Attr {
            return Ok(false);
        }
        let mut cur = inner.next(node);
        while let Some(id) = cur {
            let n = inner.arena.node(id);
            if !n.is_attr_like() {
                return Ok(false);
            }
            if n.kind == NodeKind::Attr {
                self.set_pos(&mut inner, id, 0);
                return Ok(true);
            }
            cur = inner.next(id);
        }
        Ok(false)
    }

    // ------------------------------------------------------------------
    // Text values
    // ------------------------------------------------------------------

    /// Number of content tokens inside the container at the cursor,
    /// excluding its attribute list
    pub fn content_token_count(&self) -> Result<u64> {
        let inner = self.lock();
        let (node, _) = self.pos(&inner)?;
        if !inner.arena.node(node).is_container() {
            return Err(StoreError::state("not at a container"));
        }
        Ok(inner.content_tokens(node))
    }

    /// Text value at the current position.
    ///
    /// Containers yield the concatenation of every text run in their
    /// subtree (revalidated first if stale); attributes, comments and
    /// processing instructions yield their own text; a Text token yields
    /// the run from the cursor forward. End tokens have no text value.
    pub fn get_text_value(&self) -> Result<String> {
        let mut inner = self.lock();
        let (node, offset) = self.pos(&inner)?;
        let kind = inner.arena.node(node).kind;
        match kind {
            NodeKind::Doc | NodeKind::Begin => {
                inner.ensure_contents_valid(node);
                let end = inner.arena.node(node).partner.expect("container without end");
                let mut out = String::new();
                let mut cur = inner.next(node);
                while let Some(id) = cur {
                    if id == end {
                        break;
                    }
                    if inner.arena.node(id).is_text() {
                        let pos = tree::cch_before(&inner.arena, id);
                        let cch = inner.arena.node(id).cch;
                        inner.text.fetch_into(pos as usize, cch as usize, &mut out);
                    }
                    cur = inner.next(id);
                }
                Ok(out)
            }
            NodeKind::Attr | NodeKind::Namespace | NodeKind::Comment | NodeKind::ProcInst => {
                Ok(inner.node_text(node))
            }
            NodeKind::Text => {
                let pos = tree::cch_before(&inner.arena, node) + offset as u64;
                let cch = inner.arena.node(node).cch - offset;
                Ok(inner.text.fetch(pos as usize, cch as usize))
            }
            NodeKind::End => Err(StoreError::state("no text value at an end token")),
        }
    }

    /// Value of the named attribute on the current element
    pub fn get_attribute_text(&self, uri: &str, local: &str) -> Result<Option<String>> {
        let mut inner = self.lock();
        let (node, _) = self.pos(&inner)?;
        if !inner.arena.node(node).is_begin() {
            return Err(StoreError::state("attributes live on element starts"));
        }
        let (Some(uri_id), Some(local_id)) = (inner.names.lookup(uri), inner.names.lookup(local))
        else {
            return Ok(None);
        };
        let name = QName::new(uri_id, local_id, 0);
        match inner.find_attr(node, name) {
            Some(attr) => Ok(Some(inner.node_text(attr))),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Position comparison
    // ------------------------------------------------------------------

    /// Strict total order over positions within one document.
    ///
    /// Comparing cursors from different documents is an argument error.
    pub fn compare_position(&self, other: &Cursor) -> Result<Ordering> {
        if !self.is_in_same_document(other) {
            return Err(StoreError::arg(
                "cannot compare cursors from different documents",
            ));
        }
        let inner = self.lock();
        let a = self.pos(&inner)?;
        let b = other.pos(&inner)?;
        Ok(inner.compare_pos(a, b))
    }

    /// Check if this cursor is strictly before `other`
    pub fn is_left_of(&self, other: &Cursor) -> Result<bool> {
        Ok(self.compare_position(other)? == Ordering::Less)
    }

    /// Check if this cursor is strictly after `other`
    pub fn is_right_of(&self, other: &Cursor) -> Result<bool> {
        Ok(self.compare_position(other)? == Ordering::Greater)
    }

    /// Check if both cursors sit at the same position
    pub fn is_at_same_position_as(&self, other: &Cursor) -> Result<bool> {
        Ok(self.compare_position(other)? == Ordering::Equal)
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        let mut inner = self.store.inner.lock();
        inner.dispose_cursor(self.slot, self.gen);
    }
}

/// Resolve a stored name against the pool
pub(crate) fn resolve_name(inner: &StoreInner, name: QName) -> XmlName {
    XmlName {
        uri: inner.names.get(name.uri).to_string(),
        local: inner.names.get(name.local).to_string(),
        prefix: inner.names.get(name.prefix).to_string(),
    }
}
