//! Structural mutation through the cursor
//!
//! Every mutating call validates its arguments and the cursor position
//! before touching the tree, so a failed call is a no-op. Edits delegate to
//! the store primitives, which stamp the version, notify typed bindings and
//! keep every registered cursor position alive.

use std::collections::HashMap;

use log::debug;

use crate::cursor::{Cursor, XmlName};
use crate::error::{Result, StoreError};
use crate::lock::lock_pair;
use crate::store::name::{self, QName};
use crate::store::node::{NodeId, NodeKind, StoreNode};
use crate::store::root::{EditPhase, StoreInner};
use crate::store::tree;

fn intern_name(inner: &mut StoreInner, name: &XmlName) -> QName {
    QName::new(
        inner.names.intern(&name.uri),
        inner.names.intern(&name.local),
        inner.names.intern(&name.prefix),
    )
}

fn validate_element_name(name: &XmlName) -> Result<()> {
    name::validate_local(&name.local)?;
    name::validate_name_prefix(&name.prefix)
}

/// Resolve a content insertion point: the node to insert before and the
/// container that will own the inserted construct. Splits a text run when
/// the position is inside one.
fn content_point(inner: &mut StoreInner, node: NodeId, offset: u32) -> Result<(NodeId, NodeId)> {
    let n = inner.arena.node(node);
    if n.is_attr_like() {
        return Err(StoreError::state(
            "cannot insert content into an attribute list",
        ));
    }
    if n.kind == NodeKind::Doc {
        return Err(StoreError::state(
            "cannot insert before the start of the document",
        ));
    }
    let point = if n.is_text() && offset > 0 {
        inner.split_text(node, offset)
    } else {
        node
    };
    let container = inner.content_container_at(point);
    Ok((point, container))
}

/// Resolve an attribute insertion point: the node to insert before and the
/// element that owns the attribute list
fn attr_point(inner: &StoreInner, node: NodeId) -> Result<(NodeId, NodeId)> {
    let n = inner.arena.node(node);
    match n.kind {
        NodeKind::Begin => Ok((inner.attr_insertion_point(node), node)),
        NodeKind::Attr | NodeKind::Namespace => {
            Ok((node, n.container.expect("attribute without container")))
        }
        _ => Err(StoreError::state(
            "attributes may only be inserted on an element start",
        )),
    }
}

/// Insert characters at (node, offset), merging into an adjacent run
/// instead of creating back-to-back text nodes
pub(crate) fn insert_chars_at(
    inner: &mut StoreInner,
    node: NodeId,
    offset: u32,
    s: &str,
) -> Result<()> {
    let n = inner.arena.node(node);
    if n.is_attr_like() {
        return Err(StoreError::state(
            "cannot insert characters into an attribute list",
        ));
    }
    if n.kind == NodeKind::Doc {
        return Err(StoreError::state(
            "cannot insert before the start of the document",
        ));
    }
    if n.is_text() {
        inner.insert_node_text(node, offset, s, EditPhase::Normal);
        return Ok(());
    }
    let container = inner.content_container_at(node);
    match inner.prev(node) {
        Some(p)
            if inner.arena.node(p).is_text()
                && inner.arena.node(p).container == Some(container) =>
        {
            let at = inner.arena.node(p).cch;
            inner.insert_node_text(p, at, s, EditPhase::Normal);
        }
        _ => {
            inner.insert_leaf_before(node, StoreNode::text(), container, Some(s), EditPhase::Normal);
        }
    }
    Ok(())
}

/// Check that characters can be inserted at `dnode` before any source
/// mutation happens, so a bad destination leaves both documents untouched
fn validate_char_dest(inner: &StoreInner, dnode: NodeId) -> Result<()> {
    let n = inner.arena.node(dnode);
    if n.is_text() {
        return Ok(());
    }
    if n.is_attr_like() {
        return Err(StoreError::state(
            "cannot insert characters into an attribute list",
        ));
    }
    if n.kind == NodeKind::Doc {
        return Err(StoreError::state(
            "cannot insert before the start of the document",
        ));
    }
    Ok(())
}

/// Remove up to `max` characters forward of (node, offset), returning the
/// count removed. Drops the run node when it becomes empty.
fn remove_chars_at(inner: &mut StoreInner, node: NodeId, offset: u32, max: usize) -> usize {
    let n = inner.arena.node(node);
    if !n.is_text() {
        return 0;
    }
    let avail = (n.cch - offset) as usize;
    let take = max.min(avail);
    if take == 0 {
        return 0;
    }
    if offset == 0 && take == n.cch as usize {
        let container = n.container.expect("text outside document");
        inner.remove_range(node, node, container, EditPhase::Normal);
    } else {
        inner.remove_node_text(node, offset, take as u32, EditPhase::Normal);
    }
    take
}

impl Cursor {
    // ------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------

    /// Insert an empty element immediately before the cursor.
    ///
    /// The cursor keeps its position, which ends up just after the new
    /// element.
    pub fn insert_element(&self, name: &XmlName) -> Result<()> {
        validate_element_name(name)?;
        let mut inner = self.lock();
        let (node, offset) = self.pos(&inner)?;
        let (point, container) = content_point(&mut inner, node, offset)?;
        let qname = intern_name(&mut inner, name);
        inner.insert_pair_before(point, qname, container, EditPhase::Normal);
        Ok(())
    }

    /// Insert an element holding one run of text
    pub fn insert_element_with_text(&self, name: &XmlName, text: &str) -> Result<()> {
        validate_element_name(name)?;
        let mut inner = self.lock();
        let (node, offset) = self.pos(&inner)?;
        let (point, container) = content_point(&mut inner, node, offset)?;
        let qname = intern_name(&mut inner, name);
        let (begin, end) = inner.insert_pair_before(point, qname, container, EditPhase::Normal);
        if !text.is_empty() {
            inner.insert_leaf_before(end, StoreNode::text(), begin, Some(text), EditPhase::Normal);
        }
        Ok(())
    }

    /// Insert an element and leave the cursor inside it, ready for content
    pub fn begin_element(&self, name: &XmlName) -> Result<()> {
        validate_element_name(name)?;
        let mut inner = self.lock();
        let (node, offset) = self.pos(&inner)?;
        let (point, container) = content_point(&mut inner, node, offset)?;
        let qname = intern_name(&mut inner, name);
        let (_, end) = inner.insert_pair_before(point, qname, container, EditPhase::Normal);
        self.set_pos(&mut inner, end, 0);
        Ok(())
    }

    /// Insert an attribute with an empty value
    pub fn insert_attribute(&self, name: &XmlName) -> Result<()> {
        self.insert_attribute_with_value(name, "")
    }

    /// Insert an attribute with a value.
    ///
    /// The cursor must sit on an element Start or in its attribute list.
    pub fn insert_attribute_with_value(&self, name: &XmlName, value: &str) -> Result<()> {
        validate_element_name(name)?;
        let mut inner = self.lock();
        let (node, _) = self.pos(&inner)?;
        let (point, element) = attr_point(&inner, node)?;
        let qname = intern_name(&mut inner, name);
        let text = if value.is_empty() { None } else { Some(value) };
        inner.insert_leaf_before(point, StoreNode::attr(qname), element, text, EditPhase::Normal);
        Ok(())
    }

    /// Insert a namespace declaration on the current element.
    ///
    /// An empty prefix declares the default namespace. Prefixes beginning
    /// with the reserved "xml" token are rejected.
    pub fn insert_namespace(&self, prefix: &str, uri: &str) -> Result<()> {
        name::validate_declared_prefix(prefix)?;
        if uri.is_empty() {
            return Err(StoreError::arg("namespace URI may not be empty"));
        }
        let mut inner = self.lock();
        let (node, _) = self.pos(&inner)?;
        let (point, element) = attr_point(&inner, node)?;
        let prefix_id = inner.names.intern(prefix);
        let qname = QName::unqualified(prefix_id);
        inner.insert_leaf_before(
            point,
            StoreNode::namespace(qname),
            element,
            Some(uri),
            EditPhase::Normal,
        );
        Ok(())
    }

    /// Insert a comment immediately before the cursor
    pub fn insert_comment(&self, text: &str) -> Result<()> {
        let mut inner = self.lock();
        let (node, offset) = self.pos(&inner)?;
        let (point, container) = content_point(&mut inner, node, offset)?;
        let body = if text.is_empty() { None } else { Some(text) };
        inner.insert_leaf_before(point, StoreNode::comment(), container, body, EditPhase::Normal);
        Ok(())
    }

    /// Insert a processing instruction immediately before the cursor
    pub fn insert_proc_inst(&self, target: &str, data: &str) -> Result<()> {
        name::validate_local(target)?;
        if target.eq_ignore_ascii_case("xml") {
            return Err(StoreError::arg(
                "processing instruction target may not be \"xml\"",
            ));
        }
        let mut inner = self.lock();
        let (node, offset) = self.pos(&inner)?;
        let (point, container) = content_point(&mut inner, node, offset)?;
        let target_id = inner.names.intern(target);
        let qname = QName::unqualified(target_id);
        let body = if data.is_empty() { None } else { Some(data) };
        inner.insert_leaf_before(
            point,
            StoreNode::proc_inst(qname),
            container,
            body,
            EditPhase::Normal,
        );
        Ok(())
    }

    /// Insert characters immediately before the cursor; the cursor ends up
    /// after the inserted text
    pub fn insert_chars(&self, s: &str) -> Result<()> {
        if s.is_empty() {
            return Ok(());
        }
        let mut inner = self.lock();
        let (node, offset) = self.pos(&inner)?;
        insert_chars_at(&mut inner, node, offset, s)
    }

    // ------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------

    /// Remove the construct at the cursor: a whole element (with its
    /// subtree), an attribute, namespace, comment, processing instruction,
    /// or the text from the cursor to the next token
    pub fn remove_xml(&self) -> Result<()> {
        let mut inner = self.lock();
        let (node, offset) = self.pos(&inner)?;
        let n = inner.arena.node(node);
        match n.kind {
            NodeKind::Doc => Err(StoreError::state("cannot remove the whole document")),
            NodeKind::End => Err(StoreError::state(
                "cursor must sit at the start of a construct to remove it",
            )),
            NodeKind::Begin => {
                let last = inner.range_last(node);
                let container = n.container.expect("element without container");
                inner.remove_range(node, last, container, EditPhase::Normal);
                Ok(())
            }
            NodeKind::Attr | NodeKind::Namespace | NodeKind::Comment | NodeKind::ProcInst => {
                let container = n.container.expect("node without container");
                inner.remove_range(node, node, container, EditPhase::Normal);
                Ok(())
            }
            NodeKind::Text => {
                let avail = (n.cch - offset) as usize;
                remove_chars_at(&mut inner, node, offset, avail);
                Ok(())
            }
        }
    }

    /// Remove the contents of the container at the cursor, keeping the
    /// container itself and its attributes
    pub fn remove_xml_contents(&self) -> Result<()> {
        let mut inner = self.lock();
        let (node, _) = self.pos(&inner)?;
        if !inner.arena.node(node).is_container() {
            return Err(StoreError::state("not at a container"));
        }
        // Stale contents need no rebuild just to be thrown away
        inner.arena.node_mut(node).set_contents_invalid(false);
        if let Some((first, last)) = inner.content_range(node) {
            inner.remove_range(first, last, node, EditPhase::Normal);
        }
        Ok(())
    }

    /// Remove up to `max` characters forward of the cursor
    pub fn remove_chars(&self, max: usize) -> Result<usize> {
        let mut inner = self.lock();
        let (node, offset) = self.pos(&inner)?;
        Ok(remove_chars_at(&mut inner, node, offset, max))
    }

    // ------------------------------------------------------------------
    // Setters
    // ------------------------------------------------------------------

    /// Replace the text value at the cursor.
    ///
    /// On a container this replaces the whole contents with one text run;
    /// on attributes, comments and processing instructions it replaces
    /// their text. Text and End tokens have no settable value.
    pub fn set_text_value(&self, s: &str) -> Result<()> {
        let mut inner = self.lock();
        let (node, _) = self.pos(&inner)?;
        let kind = inner.arena.node(node).kind;
        match kind {
            NodeKind::Doc | NodeKind::Begin => {
                inner.arena.node_mut(node).set_contents_invalid(false);
                inner.set_element_text(node, s, EditPhase::Normal);
                Ok(())
            }
            NodeKind::Attr | NodeKind::Comment | NodeKind::ProcInst => {
                inner.replace_node_text(node, s, EditPhase::Normal);
                Ok(())
            }
            NodeKind::Namespace => Err(StoreError::state(
                "a namespace URI cannot be changed through its text value",
            )),
            NodeKind::Text | NodeKind::End => {
                Err(StoreError::state("no settable text value at this token"))
            }
        }
    }

    /// Rename the element, attribute or processing instruction at the cursor
    pub fn set_name(&self, new_name: &XmlName) -> Result<()> {
        validate_element_name(new_name)?;
        let mut inner = self.lock();
        let (node, _) = self.pos(&inner)?;
        let kind = inner.arena.node(node).kind;
        if !matches!(kind, NodeKind::Begin | NodeKind::Attr | NodeKind::ProcInst) {
            return Err(StoreError::state("no name at this token"));
        }
        let qname = intern_name(&mut inner, new_name);
        let container = inner
            .arena
            .node(node)
            .container
            .expect("named node without container");
        inner.arena.node_mut(node).name = qname;
        inner.bump_version();
        inner.invalidate_user(container, true, EditPhase::Normal);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Move / copy
    // ------------------------------------------------------------------

    /// Source range for a node move/copy: the construct at the cursor.
    ///
    /// Text positions never reach here; character runs move and copy
    /// through the character path so no half-run nodes are left behind.
    fn source_range(inner: &StoreInner, node: NodeId) -> Result<(NodeId, NodeId)> {
        let n = inner.arena.node(node);
        match n.kind {
            NodeKind::Doc => Err(StoreError::state("cannot move or copy the whole document")),
            NodeKind::End => Err(StoreError::state(
                "cursor must sit at the start of a construct to move or copy it",
            )),
            NodeKind::Begin => Ok((node, inner.range_last(node))),
            _ => Ok((node, node)),
        }
    }

    /// Resolve the destination for a moved/copied range: the insert point
    /// and the receiving container. Attribute constructs land in attribute
    /// lists, everything else at content positions.
    fn dest_point(
        inner: &mut StoreInner,
        attrs: bool,
        node: NodeId,
        offset: u32,
    ) -> Result<(NodeId, NodeId)> {
        if attrs {
            attr_point(inner, node)
        } else {
            content_point(inner, node, offset)
        }
    }

    /// Move the construct at this cursor so it sits immediately before the
    /// destination cursor. Returns false (and does nothing) when the
    /// destination lies inside the moved range. Text positions move the
    /// run remainder as characters.
    pub fn move_xml(&self, dest: &Cursor) -> Result<bool> {
        if self.is_in_same_document(dest) {
            let mut inner = self.lock();
            let (node, offset) = self.pos(&inner)?;
            if inner.arena.node(node).is_text() {
                let take = (inner.arena.node(node).cch - offset) as usize;
                drop(inner);
                return self.move_chars(take, dest).map(|n| n > 0);
            }
            let (first, last) = Self::source_range(&inner, node)?;
            let attrs = inner.arena.node(first).is_attr_like();
            let (dnode, doffset) = dest.pos(&inner)?;
            if inner.range_contains(first, last, dnode) {
                return Ok(false);
            }
            let (point, container) = Self::dest_point(&mut inner, attrs, dnode, doffset)?;
            inner.move_range_before(first, last, point, container, EditPhase::Normal);
            Ok(true)
        } else {
            {
                let src = self.lock();
                let (node, _) = self.pos(&src)?;
                if src.arena.node(node).is_text() {
                    drop(src);
                    return self.move_chars(usize::MAX, dest).map(|n| n > 0);
                }
            }
            let (mut src, mut dst) = lock_pair(self.store(), dest.store());
            let (node, _) = self.pos(&src)?;
            let (first, last) = Self::source_range(&src, node)?;
            let attrs = src.arena.node(first).is_attr_like();
            let (dnode, doffset) = dest.pos(&dst)?;
            let (point, container) = Self::dest_point(&mut dst, attrs, dnode, doffset)?;
            debug!("moving construct across documents");
            src.ensure_range_valid(first, last);
            dst.copy_range_from(&mut src, first, last, point, container, EditPhase::Normal);
            let src_container = src
                .arena
                .node(first)
                .container
                .expect("moved construct without container");
            src.remove_range(first, last, src_container, EditPhase::Normal);
            Ok(true)
        }
    }

    /// Move the contents of the container at this cursor before the
    /// destination cursor
    pub fn move_xml_contents(&self, dest: &Cursor) -> Result<bool> {
        if self.is_in_same_document(dest) {
            let mut inner = self.lock();
            let (node, _) = self.pos(&inner)?;
            if !inner.arena.node(node).is_container() {
                return Err(StoreError::state("not at a container"));
            }
            inner.ensure_contents_valid(node);
            let Some((first, last)) = inner.content_range(node) else {
                return Ok(false);
            };
            let (dnode, doffset) = dest.pos(&inner)?;
            if inner.range_contains(first, last, dnode) {
                return Ok(false);
            }
            let (point, container) = content_point(&mut inner, dnode, doffset)?;
            inner.move_range_before(first, last, point, container, EditPhase::Normal);
            Ok(true)
        } else {
            let (mut src, mut dst) = lock_pair(self.store(), dest.store());
            let (node, _) = self.pos(&src)?;
            if !src.arena.node(node).is_container() {
                return Err(StoreError::state("not at a container"));
            }
            src.ensure_contents_valid(node);
            let Some((first, last)) = src.content_range(node) else {
                return Ok(false);
            };
            let (dnode, doffset) = dest.pos(&dst)?;
            let (point, container) = content_point(&mut dst, dnode, doffset)?;
            src.ensure_range_valid(first, last);
            dst.copy_range_from(&mut src, first, last, point, container, EditPhase::Normal);
            src.remove_range(first, last, node, EditPhase::Normal);
            Ok(true)
        }
    }

    /// Copy the construct at this cursor to immediately before the
    /// destination cursor
    pub fn copy_xml(&self, dest: &Cursor) -> Result<bool> {
        self.copy_impl(dest, false)
    }

    /// Copy the contents of the container at this cursor before the
    /// destination cursor
    pub fn copy_xml_contents(&self, dest: &Cursor) -> Result<bool> {
        self.copy_impl(dest, true)
    }

    fn copy_impl(&self, dest: &Cursor, contents: bool) -> Result<bool> {
        if !contents {
            // Character runs copy as characters
            let is_text = {
                let inner = self.lock();
                let (node, _) = self.pos(&inner)?;
                inner.arena.node(node).is_text()
            };
            if is_text {
                return self.copy_chars(usize::MAX, dest).map(|n| n > 0);
            }
        }
        if self.is_in_same_document(dest) {
            // Same-document copies stage through a scratch document so a
            // destination inside the source range never reads a range that
            // is being rewritten under it
            let mut inner = self.lock();
            let (node, _) = self.pos(&inner)?;
            let (first, last) = if contents {
                if !inner.arena.node(node).is_container() {
                    return Err(StoreError::state("not at a container"));
                }
                inner.ensure_contents_valid(node);
                match inner.content_range(node) {
                    Some(range) => range,
                    None => return Ok(false),
                }
            } else {
                Self::source_range(&inner, node)?
            };
            let attrs = inner.arena.node(first).is_attr_like();
            let (dnode, doffset) = dest.pos(&inner)?;

            src_to_scratch_and_back(&mut inner, first, last, attrs, dnode, doffset)?;
            Ok(true)
        } else {
            let (mut src, mut dst) = lock_pair(self.store(), dest.store());
            let (node, _) = self.pos(&src)?;
            let (first, last) = if contents {
                if !src.arena.node(node).is_container() {
                    return Err(StoreError::state("not at a container"));
                }
                src.ensure_contents_valid(node);
                match src.content_range(node) {
                    Some(range) => range,
                    None => return Ok(false),
                }
            } else {
                Self::source_range(&src, node)?
            };
            let attrs = src.arena.node(first).is_attr_like();
            let (dnode, doffset) = dest.pos(&dst)?;
            let (point, container) = Self::dest_point(&mut dst, attrs, dnode, doffset)?;
            src.ensure_range_valid(first, last);
            dst.copy_range_from(&mut src, first, last, point, container, EditPhase::Normal);
            Ok(true)
        }
    }

    // ------------------------------------------------------------------
    // Character move / copy
    // ------------------------------------------------------------------

    /// Move up to `max` characters forward of this cursor to immediately
    /// before the destination cursor, returning the count moved
    pub fn move_chars(&self, max: usize, dest: &Cursor) -> Result<usize> {
        if self.is_in_same_document(dest) {
            let mut inner = self.lock();
            let (node, offset) = self.pos(&inner)?;
            let n = inner.arena.node(node);
            if !n.is_text() {
                return Ok(0);
            }
            let take = max.min((n.cch - offset) as usize);
            if take == 0 {
                return Ok(0);
            }
            validate_char_dest(&inner, dest.pos(&inner)?.0)?;
            let pos = tree::cch_before(&inner.arena, node) + offset as u64;
            let moved = inner.text.fetch(pos as usize, take);
            remove_chars_at(&mut inner, node, offset, take);
            // The removal may have re-homed or shifted the destination
            let (dnode, doffset) = dest.pos(&inner)?;
            insert_chars_at(&mut inner, dnode, doffset, &moved)?;
            Ok(take)
        } else {
            let (mut src, mut dst) = lock_pair(self.store(), dest.store());
            let (node, offset) = self.pos(&src)?;
            let n = src.arena.node(node);
            if !n.is_text() {
                return Ok(0);
            }
            let take = max.min((n.cch - offset) as usize);
            if take == 0 {
                return Ok(0);
            }
            let (dnode, doffset) = dest.pos(&dst)?;
            validate_char_dest(&dst, dnode)?;
            let pos = tree::cch_before(&src.arena, node) + offset as u64;
            let moved = src.text.fetch(pos as usize, take);
            remove_chars_at(&mut src, node, offset, take);
            insert_chars_at(&mut dst, dnode, doffset, &moved)?;
            Ok(take)
        }
    }

    /// Copy up to `max` characters forward of this cursor to immediately
    /// before the destination cursor, returning the count copied
    pub fn copy_chars(&self, max: usize, dest: &Cursor) -> Result<usize> {
        if self.is_in_same_document(dest) {
            let mut inner = self.lock();
            let (node, offset) = self.pos(&inner)?;
            let n = inner.arena.node(node);
            if !n.is_text() {
                return Ok(0);
            }
            let take = max.min((n.cch - offset) as usize);
            if take == 0 {
                return Ok(0);
            }
            let pos = tree::cch_before(&inner.arena, node) + offset as u64;
            let copied = inner.text.fetch(pos as usize, take);
            let (dnode, doffset) = dest.pos(&inner)?;
            insert_chars_at(&mut inner, dnode, doffset, &copied)?;
            Ok(take)
        } else {
            let (mut src, mut dst) = lock_pair(self.store(), dest.store());
            let (node, offset) = self.pos(&src)?;
            let n = src.arena.node(node);
            if !n.is_text() {
                return Ok(0);
            }
            let take = max.min((n.cch - offset) as usize);
            if take == 0 {
                return Ok(0);
            }
            let pos = tree::cch_before(&src.arena, node) + offset as u64;
            let copied = src.text.fetch(pos as usize, take);
            let (dnode, doffset) = dest.pos(&dst)?;
            insert_chars_at(&mut dst, dnode, doffset, &copied)?;
            Ok(take)
        }
    }
}

/// Stage a same-document copy through a scratch document
fn src_to_scratch_and_back(
    inner: &mut StoreInner,
    first: NodeId,
    last: NodeId,
    attrs: bool,
    dnode: NodeId,
    doffset: u32,
) -> Result<()> {
    inner.ensure_range_valid(first, last);
    let mut scratch = StoreInner::new();
    let scratch_end = scratch.doc_end;
    let scratch_doc = scratch.doc;
    scratch.copy_range_from(inner, first, last, scratch_end, scratch_doc, EditPhase::Normal);

    let (point, container) = Cursor::dest_point(inner, attrs, dnode, doffset)?;
    let sfirst = scratch
        .next(scratch.doc)
        .filter(|&id| id != scratch.doc_end)
        .expect("scratch copy produced nothing");
    let slast = scratch.prev(scratch.doc_end).expect("scratch copy produced nothing");
    inner.copy_range_from(&mut scratch, sfirst, slast, point, container, EditPhase::Normal);
    Ok(())
}

impl StoreInner {
    /// Deep-copy the token range `[first, last]` out of `src` into this
    /// document, immediately before `point` inside `container`.
    ///
    /// Names are re-interned, Begin/End partners and interior containers are
    /// remapped, and text is copied character-for-character. Stale contents
    /// must already have been materialized on the source (`ensure_range_valid`),
    /// so derived values never cross documents invalid. Bookmarks and typed
    /// bindings stay with the originals.
    pub(crate) fn copy_range_from(
        &mut self,
        src: &mut StoreInner,
        first: NodeId,
        last: NodeId,
        point: NodeId,
        container: NodeId,
        phase: EditPhase,
    ) {
        let nodes = src.collect_range(first, last);
        let mut map: HashMap<NodeId, NodeId> = HashMap::with_capacity(nodes.len());
        let mut copied_elements = false;

        for &old in &nodes {
            let (kind, old_name, cch, flags) = {
                let n = src.arena.node(old);
                (n.kind, n.name, n.cch, n.flags & crate::store::node::FLAG_LEAF)
            };
            copied_elements |= kind == NodeKind::Begin;
            let name = QName::new(
                self.names.intern(src.names.get(old_name.uri)),
                self.names.intern(src.names.get(old_name.local)),
                self.names.intern(src.names.get(old_name.prefix)),
            );
            let mut node = StoreNode::raw(kind, name);
            node.flags = flags;
            let new = self.arena.alloc(node);
            tree::insert_before(&mut self.arena, &mut self.tree_root, point, new);
            if cch > 0 {
                let src_pos = tree::cch_before(&src.arena, old);
                let text = src.text.fetch(src_pos as usize, cch as usize);
                let dst_pos = tree::cch_before(&self.arena, new);
                let inserted = self.text.insert(dst_pos as usize, &text);
                tree::add_cch(&mut self.arena, new, inserted as i64);
            }
            map.insert(old, new);
        }

        // Remap partners and containers now that every copy exists.
        // Interior nodes point at copies; the range's top-level nodes
        // belong to the receiving container.
        for &old in &nodes {
            let new = map[&old];
            let (old_partner, old_container) = {
                let n = src.arena.node(old);
                (n.partner, n.container)
            };
            let n = self.arena.node_mut(new);
            n.partner = old_partner.map(|p| *map.get(&p).expect("partner outside copied range"));
            n.container = Some(
                old_container
                    .and_then(|c| map.get(&c).copied())
                    .unwrap_or(container),
            );
        }

        // Merge seams where copied text landed next to existing runs
        let new_first = map[&nodes[0]];
        if let Some(p) = self.prev(new_first) {
            self.merge_seam(Some(p), new_first);
        }
        let new_last = map[nodes.last().expect("empty copy range")];
        let tail = if self.arena.is_live(new_last) {
            new_last
        } else {
            // A single copied text run merged into its predecessor
            self.prev(point).expect("copied range vanished")
        };
        if let Some(nx) = self.next(tail) {
            self.merge_seam(Some(tail), nx);
        }

        self.bump_version();
        self.invalidate_user(container, copied_elements, phase);
        self.refresh_leaf(container);
        debug_assert!(tree::check_consistency(&self.arena, self.tree_root));
    }
}
