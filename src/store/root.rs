//! Document root: ownership and coordination
//!
//! One `XmlStore` per document owns:
//! - The node arena and its balanced token tree
//! - The shared gap-buffer character store and the name pool
//! - A monotonic version counter stamped on every observable mutation
//! - The cursor registry and tracked-position table used to keep cursors
//!   and saved positions alive across restructuring
//!
//! Tree algorithms live in `store::tree` and operate purely on the arena;
//! this module adds the XML-aware primitives (containers, Begin/End pairs,
//! text runs, attribute lists) that the cursor layer drives.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, trace};
use parking_lot::Mutex;

use crate::error::{Result, StoreError};
use crate::query::PathEngine;
use crate::store::name::{NamePool, NameTest, QName};
use crate::store::node::{Arena, NodeId, NodeKind, StoreNode};
use crate::store::text::GapText;
use crate::store::tree;
use crate::typed::{provider_flags, TypedValueProvider};

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

/// Edit phase token threaded through the mutation primitives.
///
/// `Revalidating` marks edits performed by the lazy-validation transaction:
/// user invalidation callbacks are suppressed and the version is restored
/// afterwards, so internal self-consistency writes are not observable as
/// document changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditPhase {
    Normal,
    Revalidating,
}

/// A saved position held by a cursor's stack or selection
#[derive(Debug, Clone, Copy)]
pub(crate) enum SavedPos {
    /// Cheap raw pair; valid until the next restructure broadcast
    Raw {
        node: NodeId,
        gen: u32,
        offset: u32,
    },
    /// Entry in the tracked-position table, re-homed by removals
    Tracked { id: u32, gen: u32 },
}

/// Lazily-expanded query results held by a cursor
pub(crate) struct SelectionList {
    pub engine: Option<Box<dyn PathEngine>>,
    pub engine_version: u64,
    pub loaded: Vec<SavedPos>,
}

impl Default for SelectionList {
    fn default() -> Self {
        SelectionList {
            engine: None,
            engine_version: 0,
            loaded: Vec::new(),
        }
    }
}

/// Position state of one cursor, owned by the store's registry
pub(crate) struct CursorState {
    pub node: NodeId,
    pub node_gen: u32,
    pub offset: u32,
    pub stack: Vec<SavedPos>,
    pub selection: SelectionList,
}

struct RegSlot {
    gen: u32,
    state: Option<CursorState>,
}

/// Generational slab of cursor states
#[derive(Default)]
pub(crate) struct Registry {
    slots: Vec<RegSlot>,
    free: Vec<u32>,
}

impl Registry {
    fn alloc(&mut self, state: CursorState) -> (u32, u32) {
        if let Some(slot) = self.free.pop() {
            let s = &mut self.slots[slot as usize];
            s.state = Some(state);
            (slot, s.gen)
        } else {
            let slot = self.slots.len() as u32;
            self.slots.push(RegSlot {
                gen: 0,
                state: Some(state),
            });
            (slot, 0)
        }
    }

    fn dealloc(&mut self, slot: u32) {
        let s = &mut self.slots[slot as usize];
        s.state = None;
        s.gen = s.gen.wrapping_add(1);
        self.free.push(slot);
    }

    fn get(&self, slot: u32, gen: u32) -> Option<&CursorState> {
        let s = self.slots.get(slot as usize)?;
        if s.gen == gen {
            s.state.as_ref()
        } else {
            None
        }
    }

    fn get_mut(&mut self, slot: u32, gen: u32) -> Option<&mut CursorState> {
        let s = self.slots.get_mut(slot as usize)?;
        if s.gen == gen {
            s.state.as_mut()
        } else {
            None
        }
    }

    fn iter_live_mut(&mut self) -> impl Iterator<Item = &mut CursorState> {
        self.slots.iter_mut().filter_map(|s| s.state.as_mut())
    }
}

/// A cursified saved position: re-homed by removals like a live cursor
#[derive(Debug, Clone, Copy)]
pub(crate) struct PosEntry {
    pub node: NodeId,
    pub node_gen: u32,
    pub offset: u32,
}

struct PosSlot {
    gen: u32,
    entry: Option<PosEntry>,
}

/// Generational slab of tracked positions
#[derive(Default)]
pub(crate) struct PosTable {
    slots: Vec<PosSlot>,
    free: Vec<u32>,
}

impl PosTable {
    pub fn alloc(&mut self, entry: PosEntry) -> (u32, u32) {
        if let Some(slot) = self.free.pop() {
            let s = &mut self.slots[slot as usize];
            s.entry = Some(entry);
            (slot, s.gen)
        } else {
            let slot = self.slots.len() as u32;
            self.slots.push(PosSlot {
                gen: 0,
                entry: Some(entry),
            });
            (slot, 0)
        }
    }

    pub fn dealloc(&mut self, slot: u32) {
        let s = &mut self.slots[slot as usize];
        s.entry = None;
        s.gen = s.gen.wrapping_add(1);
        self.free.push(slot);
    }

    pub fn get(&self, slot: u32, gen: u32) -> Option<PosEntry> {
        let s = self.slots.get(slot as usize)?;
        if s.gen == gen {
            s.entry
        } else {
            None
        }
    }

    fn iter_live_mut(&mut self) -> impl Iterator<Item = &mut PosEntry> {
        self.slots.iter_mut().filter_map(|s| s.entry.as_mut())
    }
}

/// The mutable state of one document, guarded by the store's monitor
pub struct StoreInner {
    pub(crate) arena: Arena,
    pub(crate) text: GapText,
    pub(crate) names: NamePool,
    pub(crate) tree_root: NodeId,
    pub(crate) doc: NodeId,
    pub(crate) doc_end: NodeId,
    version: u64,
    pub(crate) registry: Registry,
    pub(crate) positions: PosTable,
    /// Cursor slots holding raw saved positions, walked before restructuring
    pub(crate) change_listeners: Vec<u32>,
    /// Overlay nodes carrying a typed value cache (invalidation skipped at 0)
    pub(crate) invalidatable: usize,
    /// Overlay nodes sensitive to child element order
    pub(crate) order_sensitive: usize,
}

impl StoreInner {
    pub(crate) fn new() -> Self {
        let mut arena = Arena::new();
        let doc = arena.alloc(StoreNode::doc());
        let doc_end = arena.alloc(StoreNode::end());
        arena.node_mut(doc).partner = Some(doc_end);
        arena.node_mut(doc_end).partner = Some(doc);
        let mut tree_root = doc;
        tree::insert_after(&mut arena, &mut tree_root, doc, doc_end);
        StoreInner {
            arena,
            text: GapText::new(),
            names: NamePool::new(),
            tree_root,
            doc,
            doc_end,
            version: 0,
            registry: Registry::default(),
            positions: PosTable::default(),
            change_listeners: Vec::new(),
            invalidatable: 0,
            order_sensitive: 0,
        }
    }

    // ------------------------------------------------------------------
    // Version stamping
    // ------------------------------------------------------------------

    /// Monotonic change stamp; answers "has this document changed" in O(1)
    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    pub(crate) fn bump_version(&mut self) {
        self.version += 1;
    }

    /// Rewind the stamp after a revalidation transaction so internal
    /// self-consistency edits stay invisible to change detection
    #[inline]
    pub(crate) fn restore_version(&mut self, v: u64) {
        self.version = v;
    }

    // ------------------------------------------------------------------
    // Navigation helpers over the token tree
    // ------------------------------------------------------------------

    #[inline]
    pub(crate) fn next(&self, id: NodeId) -> Option<NodeId> {
        tree::next_in_order(&self.arena, id)
    }

    #[inline]
    pub(crate) fn prev(&self, id: NodeId) -> Option<NodeId> {
        tree::prev_in_order(&self.arena, id)
    }

    /// Last token of the range started by `id`: the matching End for a
    /// Begin, the node itself otherwise
    pub(crate) fn range_last(&self, id: NodeId) -> NodeId {
        let n = self.arena.node(id);
        if n.is_begin() {
            n.partner.expect("begin without end")
        } else {
            id
        }
    }

    /// Container that owns content inserted immediately before `at`
    pub(crate) fn content_container_at(&self, at: NodeId) -> NodeId {
        let n = self.arena.node(at);
        match n.kind {
            NodeKind::End => n.partner.expect("end without begin"),
            _ => n.container.expect("content position outside document"),
        }
    }

    /// First token after `begin`'s attribute list (possibly its End)
    pub(crate) fn attr_insertion_point(&self, begin: NodeId) -> NodeId {
        let mut cur = self.next(begin).expect("container without end");
        while self.arena.node(cur).is_attr_like() {
            cur = self.next(cur).expect("attribute without following token");
        }
        cur
    }

    /// Content tokens of a container: `[first, last]` inclusive, excluding
    /// the attribute list, or None when the container is empty
    pub(crate) fn content_range(&self, container: NodeId) -> Option<(NodeId, NodeId)> {
        let end = self.arena.node(container).partner.expect("container without end");
        let first = self.attr_insertion_point(container);
        if first == end {
            return None;
        }
        let last = self.prev(end).expect("end without predecessor");
        Some((first, last))
    }

    /// Number of content tokens inside a container ("max position")
    pub(crate) fn content_tokens(&self, container: NodeId) -> u64 {
        let end = self.arena.node(container).partner.expect("container without end");
        let begin_ord = tree::ordinal_of(&self.arena, container);
        let end_ord = tree::ordinal_of(&self.arena, end);
        let attrs = {
            let mut n = 0;
            let mut cur = self.next(container);
            while let Some(id) = cur {
                if !self.arena.node(id).is_attr_like() {
                    break;
                }
                n += 1;
                cur = self.next(id);
            }
            n
        };
        end_ord - begin_ord - 1 - attrs
    }

    /// Find an attribute of `begin` by name
    pub(crate) fn find_attr(&self, begin: NodeId, name: QName) -> Option<NodeId> {
        let mut cur = self.next(begin);
        while let Some(id) = cur {
            let n = self.arena.node(id);
            if !n.is_attr_like() {
                return None;
            }
            if n.kind == NodeKind::Attr && n.name.matches(name) {
                return Some(id);
            }
            cur = self.next(id);
        }
        None
    }

    /// Linear scan for the nth Begin matching `test` among the direct
    /// children of `container`; the scan stops as soon as the (name, index)
    /// rule is satisfied
    pub fn find_nth_begin(&self, container: NodeId, test: NameTest<'_>, n: usize) -> Option<NodeId> {
        let end = self.arena.node(container).partner.expect("container without end");
        let mut seen = 0;
        let mut cur = self.next(container);
        while let Some(id) = cur {
            if id == end {
                return None;
            }
            let node = self.arena.node(id);
            if node.is_begin() {
                if test.matches(node.name) {
                    if seen == n {
                        return Some(id);
                    }
                    seen += 1;
                }
                // Skip over the whole element
                cur = self.next(self.range_last(id));
            } else {
                cur = self.next(id);
            }
        }
        None
    }

    /// Count direct child elements of `container` matching `test`
    pub fn count(&self, container: NodeId, test: NameTest<'_>) -> usize {
        let end = self.arena.node(container).partner.expect("container without end");
        let mut seen = 0;
        let mut cur = self.next(container);
        while let Some(id) = cur {
            if id == end {
                break;
            }
            let node = self.arena.node(id);
            if node.is_begin() {
                if test.matches(node.name) {
                    seen += 1;
                }
                cur = self.next(self.range_last(id));
            } else {
                cur = self.next(id);
            }
        }
        seen
    }

    /// Strict total order over (node, offset) positions of this document
    pub(crate) fn compare_pos(&self, a: (NodeId, u32), b: (NodeId, u32)) -> std::cmp::Ordering {
        let ka = (tree::ordinal_of(&self.arena, a.0), a.1);
        let kb = (tree::ordinal_of(&self.arena, b.0), b.1);
        ka.cmp(&kb)
    }

    /// Check whether (node, offset) `pos` lies inside the token range
    /// `[first, last]` (offset ignored for membership)
    pub(crate) fn range_contains(&self, first: NodeId, last: NodeId, pos: NodeId) -> bool {
        let ord = tree::ordinal_of(&self.arena, pos);
        ord >= tree::ordinal_of(&self.arena, first) && ord <= tree::ordinal_of(&self.arena, last)
    }

    // ------------------------------------------------------------------
    // Cursor registry
    // ------------------------------------------------------------------

    pub(crate) fn new_cursor_state(&mut self, node: NodeId, offset: u32) -> (u32, u32) {
        let node_gen = self.arena.generation(node);
        self.registry.alloc(CursorState {
            node,
            node_gen,
            offset,
            stack: Vec::new(),
            selection: SelectionList::default(),
        })
    }

    pub(crate) fn dispose_cursor(&mut self, slot: u32, gen: u32) -> bool {
        if self.registry.get(slot, gen).is_none() {
            return false;
        }
        // Release tracked positions held by the stack and selection
        let state = self.registry.get_mut(slot, gen).expect("checked above");
        let saved: Vec<SavedPos> = state
            .stack
            .drain(..)
            .chain(state.selection.loaded.drain(..))
            .collect();
        state.selection.engine = None;
        for pos in saved {
            if let SavedPos::Tracked { id, gen } = pos {
                if self.positions.get(id, gen).is_some() {
                    self.positions.dealloc(id);
                }
            }
        }
        self.registry.dealloc(slot);
        true
    }

    pub(crate) fn cursor(&self, slot: u32, gen: u32) -> Result<&CursorState> {
        self.registry.get(slot, gen).ok_or(StoreError::Disposed)
    }

    pub(crate) fn cursor_mut(&mut self, slot: u32, gen: u32) -> Result<&mut CursorState> {
        self.registry.get_mut(slot, gen).ok_or(StoreError::Disposed)
    }

    /// Register a cursor for the pre-restructure broadcast
    pub(crate) fn register_for_change(&mut self, slot: u32) {
        if !self.change_listeners.contains(&slot) {
            self.change_listeners.push(slot);
        }
    }

    /// Resolve a saved position to a live (node, offset) pair
    pub(crate) fn resolve_saved(&self, pos: SavedPos) -> Option<(NodeId, u32)> {
        match pos {
            SavedPos::Raw { node, gen, offset } => {
                if self.arena.check(node, gen) {
                    Some((node, offset))
                } else {
                    None
                }
            }
            SavedPos::Tracked { id, gen } => {
                let entry = self.positions.get(id, gen)?;
                if self.arena.check(entry.node, entry.node_gen) {
                    Some((entry.node, entry.offset))
                } else {
                    None
                }
            }
        }
    }

    /// Drop a saved position, releasing its tracked entry if it has one
    pub(crate) fn release_saved(&mut self, pos: SavedPos) {
        if let SavedPos::Tracked { id, gen } = pos {
            if self.positions.get(id, gen).is_some() {
                self.positions.dealloc(id);
            }
        }
    }

    /// Change broadcast: convert every registered cursor's raw stack and
    /// selection entries into tracked positions ("cursify") so they survive
    /// the coming restructure. Disposed cursors are skipped.
    pub(crate) fn notify_change(&mut self) {
        if self.change_listeners.is_empty() {
            return;
        }
        let listeners = std::mem::take(&mut self.change_listeners);
        let mut cursified = 0usize;

        // Drain any pending lazy query results first: engine output is
        // position-relative and cannot survive a restructure.
        for &slot in &listeners {
            self.drain_selection_engine(slot);
        }

        for &slot in &listeners {
            let Some(state) = self.registry.slots.get_mut(slot as usize).and_then(|s| s.state.as_mut())
            else {
                continue;
            };
            let arena = &self.arena;
            let positions = &mut self.positions;
            let mut cursify = |pos: &mut SavedPos| {
                if let SavedPos::Raw { node, gen, offset } = *pos {
                    if arena.check(node, gen) {
                        let (id, pgen) = positions.alloc(PosEntry {
                            node,
                            node_gen: gen,
                            offset,
                        });
                        *pos = SavedPos::Tracked { id, gen: pgen };
                        cursified += 1;
                    }
                }
            };
            for pos in state.stack.iter_mut() {
                cursify(pos);
            }
            for pos in state.selection.loaded.iter_mut() {
                cursify(pos);
            }
        }
        if cursified > 0 {
            trace!("cursified {} saved positions before restructure", cursified);
        }
    }

    /// Pull a cursor's selection engine to exhaustion
    pub(crate) fn drain_selection_engine(&mut self, slot: u32) {
        let Some(state) = self
            .registry
            .slots
            .get_mut(slot as usize)
            .and_then(|s| s.state.as_mut())
        else {
            return;
        };
        let Some(mut engine) = state.selection.engine.take() else {
            return;
        };
        let engine_version = state.selection.engine_version;
        let mut sink = crate::query::Selections::default();
        if engine_version == self.version {
            while engine.next(self, &mut sink) {}
        }
        let state = self
            .registry
            .slots
            .get_mut(slot as usize)
            .and_then(|s| s.state.as_mut())
            .expect("cursor vanished during drain");
        for (node, offset) in sink.items {
            let gen = self.arena.generation(node);
            state.selection.loaded.push(SavedPos::Raw { node, gen, offset });
        }
    }

    // ------------------------------------------------------------------
    // Re-homing
    // ------------------------------------------------------------------

    /// Move every cursor and tracked position inside `[first, last]` to the
    /// nearest surviving position (the token after the range)
    fn rehome_range(&mut self, first: NodeId, last: NodeId) {
        let arena = &self.arena;
        let first_ord = tree::ordinal_of(arena, first);
        let last_ord = tree::ordinal_of(arena, last);
        let survivor = tree::next_in_order(arena, last).expect("removal reached document end");
        let survivor_gen = arena.generation(survivor);

        let in_range = |node: NodeId| {
            let ord = tree::ordinal_of(arena, node);
            ord >= first_ord && ord <= last_ord
        };

        for state in self.registry.iter_live_mut() {
            if in_range(state.node) {
                state.node = survivor;
                state.node_gen = survivor_gen;
                state.offset = 0;
            }
        }
        for entry in self.positions.iter_live_mut() {
            if in_range(entry.node) {
                entry.node = survivor;
                entry.node_gen = survivor_gen;
                entry.offset = 0;
            }
        }
    }

    /// Shift cursor offsets within one node after a text edit.
    ///
    /// Insert of `delta > 0` at `at`: offsets >= `at` move right.
    /// Remove of `delta < 0` at `at`: offsets inside the removed span clamp
    /// to `at`, offsets past it move left.
    fn shift_text_positions(&mut self, node: NodeId, at: u32, delta: i64) {
        let adjust = |offset: &mut u32| {
            let off = *offset;
            if delta >= 0 {
                if off >= at {
                    *offset = off + delta as u32;
                }
            } else {
                let removed = (-delta) as u32;
                if off > at + removed {
                    *offset = off - removed;
                } else if off > at {
                    *offset = at;
                }
            }
        };
        for state in self.registry.iter_live_mut() {
            if state.node == node {
                adjust(&mut state.offset);
            }
        }
        for entry in self.positions.iter_live_mut() {
            if entry.node == node {
                adjust(&mut entry.offset);
            }
        }
        if let Some(overlay) = self.arena.node_mut(node).overlay.as_mut() {
            for bookmark in overlay.bookmarks.iter_mut() {
                adjust(&mut bookmark.offset);
            }
        }
    }

    // ------------------------------------------------------------------
    // Typed-overlay accounting and invalidation
    // ------------------------------------------------------------------

    pub(crate) fn attach_provider(&mut self, node: NodeId, provider: Arc<dyn TypedValueProvider>) {
        let flags = provider.element_flags();
        if flags & provider_flags::HAS_VALUE != 0 {
            self.invalidatable += 1;
        }
        if flags & provider_flags::ORDER_SENSITIVE != 0 {
            self.order_sensitive += 1;
        }
        self.arena.node_mut(node).overlay_mut().provider = Some(provider);
    }

    pub(crate) fn detach_provider(&mut self, node: NodeId) {
        let n = self.arena.node_mut(node);
        if let Some(overlay) = n.overlay.as_mut() {
            if let Some(provider) = overlay.provider.take() {
                let flags = provider.element_flags();
                if flags & provider_flags::HAS_VALUE != 0 {
                    self.invalidatable -= 1;
                }
                if flags & provider_flags::ORDER_SENSITIVE != 0 {
                    self.order_sensitive -= 1;
                }
            }
        }
        n.shed_overlay();
    }

    fn drop_provider_counts(&mut self, node: NodeId) {
        let n = self.arena.node(node);
        if let Some(provider) = n.overlay.as_ref().and_then(|o| o.provider.as_ref()) {
            let flags = provider.element_flags();
            if flags & provider_flags::HAS_VALUE != 0 {
                self.invalidatable -= 1;
            }
            if flags & provider_flags::ORDER_SENSITIVE != 0 {
                self.order_sensitive -= 1;
            }
        }
    }

    /// Notify typed bindings along the container chain after a mutation.
    ///
    /// Skipped entirely while revalidating, and when no overlay in the
    /// document carries the relevant sensitivity.
    pub(crate) fn invalidate_user(&mut self, container: NodeId, order_changed: bool, phase: EditPhase) {
        if phase == EditPhase::Revalidating {
            return;
        }
        if self.invalidatable == 0 && (!order_changed || self.order_sensitive == 0) {
            return;
        }
        let mut cur = Some(container);
        let mut to_value: Vec<Arc<dyn TypedValueProvider>> = Vec::new();
        let mut to_order: Vec<Arc<dyn TypedValueProvider>> = Vec::new();
        while let Some(id) = cur {
            let n = self.arena.node(id);
            if let Some(provider) = n.overlay.as_ref().and_then(|o| o.provider.as_ref()) {
                let flags = provider.element_flags();
                if flags & provider_flags::HAS_VALUE != 0 {
                    to_value.push(Arc::clone(provider));
                }
                if order_changed && flags & provider_flags::ORDER_SENSITIVE != 0 {
                    to_order.push(Arc::clone(provider));
                }
            }
            cur = n.container;
        }
        // Callbacks run without touching the store; providers must not
        // re-enter the document from these notifications.
        for p in to_value {
            p.invalidate_value();
        }
        for p in to_order {
            p.invalidate_element_order();
        }
    }

    // ------------------------------------------------------------------
    // Leaf flag maintenance
    // ------------------------------------------------------------------

    pub(crate) fn refresh_leaf(&mut self, container: NodeId) {
        if self.arena.node(container).kind != NodeKind::Begin {
            return;
        }
        let leaf = match self.content_range(container) {
            Some((f, l)) => f == l && self.arena.node(f).is_text(),
            None => false,
        };
        self.arena.node_mut(container).set_leaf(leaf);
    }

    // ------------------------------------------------------------------
    // Structural primitives
    // ------------------------------------------------------------------

    /// Insert a single leaf node (attr, namespace, text, comment, PI)
    /// before `point`, with its text if it carries any
    pub(crate) fn insert_leaf_before(
        &mut self,
        point: NodeId,
        mut node: StoreNode,
        container: NodeId,
        text: Option<&str>,
        phase: EditPhase,
    ) -> NodeId {
        node.container = Some(container);
        let id = self.arena.alloc(node);
        tree::insert_before(&mut self.arena, &mut self.tree_root, point, id);
        if let Some(text) = text {
            let pos = tree::cch_before(&self.arena, id);
            let cch = self.text.insert(pos as usize, text);
            tree::add_cch(&mut self.arena, id, cch as i64);
        }
        self.bump_version();
        self.invalidate_user(container, false, phase);
        self.refresh_leaf(container);
        debug_assert!(tree::check_consistency(&self.arena, self.tree_root));
        id
    }

    /// Insert a matched Begin/End pair before `point`
    pub(crate) fn insert_pair_before(
        &mut self,
        point: NodeId,
        name: QName,
        container: NodeId,
        phase: EditPhase,
    ) -> (NodeId, NodeId) {
        let mut begin = StoreNode::begin(name);
        begin.container = Some(container);
        let mut end = StoreNode::end();
        end.container = Some(container);
        let begin = self.arena.alloc(begin);
        let end = self.arena.alloc(end);
        self.arena.node_mut(begin).partner = Some(end);
        self.arena.node_mut(end).partner = Some(begin);
        tree::insert_before(&mut self.arena, &mut self.tree_root, point, begin);
        tree::insert_before(&mut self.arena, &mut self.tree_root, point, end);
        self.bump_version();
        self.invalidate_user(container, true, phase);
        self.refresh_leaf(container);
        debug_assert!(tree::check_consistency(&self.arena, self.tree_root));
        (begin, end)
    }

    /// Split a text run at `offset`, returning the node holding the second
    /// half. No characters move; both halves keep their gap-buffer range.
    pub(crate) fn split_text(&mut self, node: NodeId, offset: u32) -> NodeId {
        let n = self.arena.node(node);
        debug_assert!(n.is_text() && offset > 0 && offset < n.cch);
        let container = n.container;
        let tail = n.cch - offset;

        tree::add_cch(&mut self.arena, node, -(tail as i64));
        let mut second = StoreNode::text();
        second.container = container;
        second.cch = tail;
        second.subtree_cch = tail as u64;
        let second = self.arena.alloc(second);
        tree::insert_after(&mut self.arena, &mut self.tree_root, node, second);

        // Positions and bookmarks in the tail move to the new node
        let second_gen = self.arena.generation(second);
        for state in self.registry.iter_live_mut() {
            if state.node == node && state.offset >= offset {
                state.node = second;
                state.node_gen = second_gen;
                state.offset -= offset;
            }
        }
        for entry in self.positions.iter_live_mut() {
            if entry.node == node && entry.offset >= offset {
                entry.node = second;
                entry.node_gen = second_gen;
                entry.offset -= offset;
            }
        }
        let moved: Vec<crate::cursor::bookmark::Bookmark> = {
            let n = self.arena.node_mut(node);
            match n.overlay.as_mut() {
                Some(overlay) => {
                    let (stay, go): (Vec<_>, Vec<_>) = overlay
                        .bookmarks
                        .drain(..)
                        .partition(|b| b.offset < offset);
                    overlay.bookmarks = stay;
                    go
                }
                None => Vec::new(),
            }
        };
        self.arena.node_mut(node).shed_overlay();
        if !moved.is_empty() {
            let overlay = self.arena.node_mut(second).overlay_mut();
            for mut b in moved {
                b.offset -= offset;
                overlay.bookmarks.push(b);
            }
        }
        debug_assert!(tree::check_consistency(&self.arena, self.tree_root));
        second
    }

    /// Merge the text run `right` into the text run `left` (which must be
    /// in-order adjacent with the same container). Their characters are
    /// already adjacent in the gap buffer.
    pub(crate) fn merge_text(&mut self, left: NodeId, right: NodeId) {
        debug_assert!(self.arena.node(left).is_text() && self.arena.node(right).is_text());
        debug_assert_eq!(self.next(left), Some(right));
        let left_cch = self.arena.node(left).cch;
        let right_cch = self.arena.node(right).cch;

        let left_gen = self.arena.generation(left);
        for state in self.registry.iter_live_mut() {
            if state.node == right {
                state.node = left;
                state.node_gen = left_gen;
                state.offset += left_cch;
            }
        }
        for entry in self.positions.iter_live_mut() {
            if entry.node == right {
                entry.node = left;
                entry.node_gen = left_gen;
                entry.offset += left_cch;
            }
        }
        tree::detach(&mut self.arena, &mut self.tree_root, right);
        let mut removed = self.arena.dealloc(right);
        if let Some(overlay) = removed.overlay.take() {
            let dst = self.arena.node_mut(left).overlay_mut();
            for mut b in overlay.bookmarks {
                b.offset += left_cch;
                dst.bookmarks.push(b);
            }
            if dst.provider.is_none() {
                dst.provider = overlay.provider;
            }
        }
        tree::add_cch(&mut self.arena, left, right_cch as i64);
        debug_assert!(tree::check_consistency(&self.arena, self.tree_root));
    }

    /// Try to merge the two text runs around a seam left by a removal or
    /// move. Only fires when the candidates ended up in-order adjacent.
    pub(crate) fn merge_seam(&mut self, before: Option<NodeId>, after: NodeId) {
        let Some(before) = before else { return };
        if !self.arena.is_live(before) || !self.arena.is_live(after) {
            return;
        }
        if self.next(before) != Some(after) {
            return;
        }
        let bn = self.arena.node(before);
        let an = self.arena.node(after);
        if bn.is_text() && an.is_text() && bn.container == an.container {
            self.merge_text(before, after);
        }
    }

    /// Collect the in-order node list of `[first, last]`
    pub(crate) fn collect_range(&self, first: NodeId, last: NodeId) -> Vec<NodeId> {
        let mut nodes = Vec::new();
        let mut cur = first;
        loop {
            nodes.push(cur);
            if cur == last {
                break;
            }
            cur = self.next(cur).expect("range ended before last");
        }
        nodes
    }

    /// Remove the token range `[first, last]` and its text outright.
    ///
    /// Cursors inside are re-homed to the token after the range; bookmarks
    /// and typed bindings on removed nodes die with them. `container` is the
    /// content container the range was removed from.
    pub(crate) fn remove_range(
        &mut self,
        first: NodeId,
        last: NodeId,
        container: NodeId,
        phase: EditPhase,
    ) {
        self.notify_change();
        let before = self.prev(first);
        let survivor = self.next(last).expect("removal reached document end");
        self.rehome_range(first, last);

        let src = tree::cch_before(&self.arena, first);
        let len = tree::cch_before(&self.arena, survivor) - src;
        self.text.remove(src as usize, len as usize);

        let nodes = self.collect_range(first, last);
        let mut removed_elements = false;
        for id in nodes {
            removed_elements |= self.arena.node(id).is_begin();
            self.drop_provider_counts(id);
            tree::detach(&mut self.arena, &mut self.tree_root, id);
            self.arena.dealloc(id);
        }
        self.merge_seam(before, survivor);
        self.bump_version();
        self.invalidate_user(container, removed_elements, phase);
        self.refresh_leaf(container);
        debug_assert!(tree::check_consistency(&self.arena, self.tree_root));
    }

    /// Relocate the token range `[first, last]` (and its text) so it sits
    /// immediately before `point`, preserving node identity. Source and
    /// destination are in this document; the caller has already rejected
    /// destinations inside the range.
    pub(crate) fn move_range_before(
        &mut self,
        first: NodeId,
        last: NodeId,
        point: NodeId,
        new_container: NodeId,
        phase: EditPhase,
    ) {
        if point == first {
            return;
        }
        self.notify_change();
        let old_container = self
            .arena
            .node(first)
            .container
            .expect("moving the document root");
        let before = self.prev(first);
        let survivor = self.next(last).expect("move reached document end");
        self.rehome_range(first, last);

        let src = tree::cch_before(&self.arena, first);
        let len = tree::cch_before(&self.arena, survivor) - src;
        let dst = tree::cch_before(&self.arena, point);
        self.text.move_range(dst as usize, src as usize, len as usize);

        let nodes = self.collect_range(first, last);
        let mut moved_elements = false;
        for &id in &nodes {
            moved_elements |= self.arena.node(id).is_begin();
            tree::detach(&mut self.arena, &mut self.tree_root, id);
        }
        for &id in &nodes {
            // Top-level nodes of the range belong to the new container;
            // interior nodes keep theirs
            let n = self.arena.node_mut(id);
            if n.container == Some(old_container) {
                n.container = Some(new_container);
            }
            tree::insert_before(&mut self.arena, &mut self.tree_root, point, id);
        }

        // Merge seams: the gap left at the source, then both edges of the
        // reinserted range
        self.merge_seam(before, survivor);
        let mut dest_first = nodes[0];
        if let Some(p) = self.prev(dest_first) {
            let was_first = dest_first;
            self.merge_seam(Some(p), was_first);
            if !self.arena.is_live(was_first) {
                dest_first = p;
            }
        }
        let dest_last = *nodes.last().expect("empty move range");
        let dest_last = if self.arena.is_live(dest_last) {
            dest_last
        } else {
            dest_first
        };
        if let Some(nx) = self.next(dest_last) {
            self.merge_seam(Some(dest_last), nx);
        }

        self.bump_version();
        self.invalidate_user(old_container, moved_elements, phase);
        self.invalidate_user(new_container, moved_elements, phase);
        self.refresh_leaf(old_container);
        self.refresh_leaf(new_container);
        debug_assert!(tree::check_consistency(&self.arena, self.tree_root));
    }

    // ------------------------------------------------------------------
    // Text primitives
    // ------------------------------------------------------------------

    /// Fetch a node's own text
    pub(crate) fn node_text(&mut self, id: NodeId) -> String {
        let pos = tree::cch_before(&self.arena, id);
        let cch = self.arena.node(id).cch;
        self.text.fetch(pos as usize, cch as usize)
    }

    /// Insert characters into a node's text at a local offset
    pub(crate) fn insert_node_text(
        &mut self,
        id: NodeId,
        offset: u32,
        s: &str,
        phase: EditPhase,
    ) -> u32 {
        let pos = tree::cch_before(&self.arena, id) + offset as u64;
        let cch = self.text.insert(pos as usize, s) as u32;
        tree::add_cch(&mut self.arena, id, cch as i64);
        self.shift_text_positions(id, offset, cch as i64);
        self.bump_version();
        let container = self
            .arena
            .node(id)
            .container
            .expect("text outside document");
        self.invalidate_user(container, false, phase);
        cch
    }

    /// Remove characters from a node's text at a local offset
    pub(crate) fn remove_node_text(&mut self, id: NodeId, offset: u32, cch: u32, phase: EditPhase) {
        if cch == 0 {
            return;
        }
        let pos = tree::cch_before(&self.arena, id) + offset as u64;
        self.text.remove(pos as usize, cch as usize);
        tree::add_cch(&mut self.arena, id, -(cch as i64));
        self.shift_text_positions(id, offset, -(cch as i64));
        self.bump_version();
        let container = self
            .arena
            .node(id)
            .container
            .expect("text outside document");
        self.invalidate_user(container, false, phase);
    }

    /// Replace a node's own text wholesale
    pub(crate) fn replace_node_text(&mut self, id: NodeId, s: &str, phase: EditPhase) {
        let old = self.arena.node(id).cch;
        if old > 0 {
            self.remove_node_text(id, 0, old, phase);
        }
        if !s.is_empty() {
            self.insert_node_text(id, 0, s, phase);
        }
    }

    /// Replace a container's contents with a single text run (or nothing)
    pub(crate) fn set_element_text(&mut self, container: NodeId, s: &str, phase: EditPhase) {
        if let Some((first, last)) = self.content_range(container) {
            self.remove_range(first, last, container, phase);
        }
        if !s.is_empty() {
            let end = self
                .arena
                .node(container)
                .partner
                .expect("container without end");
            self.insert_leaf_before(end, StoreNode::text(), container, Some(s), phase);
        }
    }

    // ------------------------------------------------------------------
    // Lazy validity
    // ------------------------------------------------------------------

    /// Mark a container's contents stale; the next read rebuilds them
    pub(crate) fn invalidate_contents(&mut self, container: NodeId) {
        debug_assert!(self.arena.node(container).is_container());
        self.arena.node_mut(container).set_contents_invalid(true);
        self.bump_version();
    }

    /// Materialize stale contents for every container inside `[first, last]`
    /// before the range is read for a move or copy, so derived values never
    /// leave the document stale
    pub(crate) fn ensure_range_valid(&mut self, first: NodeId, last: NodeId) {
        let mut cur = Some(first);
        while let Some(id) = cur {
            let n = self.arena.node(id);
            if n.is_container() && n.contents_invalid() {
                self.ensure_contents_valid(id);
            }
            if id == last {
                break;
            }
            cur = self.next(id);
        }
    }

    /// Revalidation transaction: if `container`'s contents are stale,
    /// rebuild them from the typed binding. The version is captured before
    /// and restored after, so validation is not observable as an edit.
    pub(crate) fn ensure_contents_valid(&mut self, container: NodeId) {
        if !self.arena.node(container).contents_invalid() {
            return;
        }
        let provider = self
            .arena
            .node(container)
            .overlay
            .as_ref()
            .and_then(|o| o.provider.as_ref())
            .map(Arc::clone);
        let v = self.version();
        if let Some(provider) = provider {
            let built = provider.build_text();
            debug!("revalidating stale contents ({} chars)", built.len());
            self.set_element_text(container, &built, EditPhase::Revalidating);
        }
        self.arena.node_mut(container).set_contents_invalid(false);
        self.restore_version(v);
    }
}

/// One XML document: monitor plus guarded state.
///
/// The store itself is the lock object; every public operation acquires the
/// monitor for its duration. Documents are identified by a process-unique
/// id used to order cross-document lock acquisition.
pub struct XmlStore {
    pub(crate) store_id: u64,
    pub(crate) inner: Mutex<StoreInner>,
    /// Back-reference handed to cursors; never outlives the allocation
    self_ref: Weak<XmlStore>,
}

impl XmlStore {
    /// Create an empty document
    pub fn new() -> Arc<XmlStore> {
        let store = Arc::new_cyclic(|weak| XmlStore {
            store_id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(StoreInner::new()),
            self_ref: weak.clone(),
        });
        trace!("created document store {}", store.store_id);
        store
    }

    /// Strong handle to this document
    pub(crate) fn arc(&self) -> Arc<XmlStore> {
        self.self_ref.upgrade().expect("store freed during call")
    }

    /// Process-unique document identity
    #[inline]
    pub fn store_id(&self) -> u64 {
        self.store_id
    }

    /// Current change stamp
    pub fn version(&self) -> u64 {
        self.inner.lock().version()
    }

    /// Release gap-buffer headroom after a burst of edits
    pub fn trim_text(&self) {
        self.inner.lock().text.trim();
    }

    /// Number of live nodes (including the document node and its end)
    pub fn node_count(&self) -> usize {
        self.inner.lock().arena.live_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::node::StoreNode;

    fn begin_name(inner: &mut StoreInner, local: &str) -> QName {
        QName::unqualified(inner.names.intern(local))
    }

    fn build_doc(inner: &mut StoreInner) -> (NodeId, NodeId) {
        // <a><b>xy</b><c/></a>
        let a = begin_name(inner, "a");
        let b = begin_name(inner, "b");
        let c = begin_name(inner, "c");
        let doc_end = inner.doc_end;
        let doc = inner.doc;
        let (a_begin, a_end) = inner.insert_pair_before(doc_end, a, doc, EditPhase::Normal);
        let (b_begin, b_end) = inner.insert_pair_before(a_end, b, a_begin, EditPhase::Normal);
        inner.insert_leaf_before(b_end, StoreNode::text(), b_begin, Some("xy"), EditPhase::Normal);
        inner.insert_pair_before(a_end, c, a_begin, EditPhase::Normal);
        (a_begin, b_begin)
    }

    #[test]
    fn test_build_and_positions() {
        let mut inner = StoreInner::new();
        let (a, b) = build_doc(&mut inner);
        assert_eq!(tree::total_tokens(&inner.arena, inner.tree_root), 9);
        assert_eq!(tree::total_cch(&inner.arena, inner.tree_root), 2);
        assert_eq!(inner.content_tokens(a), 5);
        assert_eq!(inner.content_tokens(b), 1);
        assert!(inner.arena.node(b).is_leaf());
        assert!(!inner.arena.node(a).is_leaf());
    }

    #[test]
    fn test_find_nth_begin_and_count() {
        let mut inner = StoreInner::new();
        let (a, b) = build_doc(&mut inner);
        let b_name = QName::unqualified(inner.names.lookup("b").unwrap());
        let c_name = QName::unqualified(inner.names.lookup("c").unwrap());
        assert_eq!(inner.find_nth_begin(a, NameTest::Name(b_name), 0), Some(b));
        assert_eq!(inner.find_nth_begin(a, NameTest::Name(b_name), 1), None);
        assert_eq!(inner.count(a, NameTest::Any), 2);
        assert_eq!(inner.count(a, NameTest::Name(c_name)), 1);
        // Nothing nested is counted
        assert_eq!(inner.count(inner.doc, NameTest::Any), 1);
    }

    #[test]
    fn test_remove_range_rehomes_cursors() {
        let mut inner = StoreInner::new();
        let (a, b) = build_doc(&mut inner);
        // Cursor inside <b>'s text
        let text = inner.next(b).unwrap();
        let (slot, gen) = inner.new_cursor_state(text, 1);
        let b_end = inner.range_last(b);
        let survivor = inner.next(b_end).unwrap();
        inner.remove_range(b, b_end, a, EditPhase::Normal);
        let state = inner.cursor(slot, gen).unwrap();
        assert_eq!(state.node, survivor);
        assert_eq!(state.offset, 0);
        assert_eq!(tree::total_cch(&inner.arena, inner.tree_root), 0);
    }

    #[test]
    fn test_version_stamps() {
        let mut inner = StoreInner::new();
        let v0 = inner.version();
        let (_, b) = build_doc(&mut inner);
        assert!(inner.version() > v0);
        let v1 = inner.version();
        // Reads do not bump the stamp
        let _ = inner.content_tokens(b);
        let _ = inner.count(b, NameTest::Any);
        assert_eq!(inner.version(), v1);
    }

    #[test]
    fn test_set_element_text_and_merge() {
        let mut inner = StoreInner::new();
        let (a, b) = build_doc(&mut inner);
        inner.set_element_text(b, "replaced", EditPhase::Normal);
        let text = inner.next(b).unwrap();
        assert_eq!(inner.node_text(text), "replaced");
        assert!(inner.arena.node(b).is_leaf());
        // Removing <b> entirely leaves <a> with only <c/>
        let b_end = inner.range_last(b);
        inner.remove_range(b, b_end, a, EditPhase::Normal);
        assert_eq!(inner.count(a, NameTest::Any), 1);
    }

    #[test]
    fn test_split_and_merge_text() {
        let mut inner = StoreInner::new();
        let (_, b) = build_doc(&mut inner);
        let text = inner.next(b).unwrap();
        let (slot, gen) = inner.new_cursor_state(text, 1);
        let second = inner.split_text(text, 1);
        assert_eq!(inner.arena.node(text).cch, 1);
        assert_eq!(inner.arena.node(second).cch, 1);
        let state = inner.cursor(slot, gen).unwrap();
        assert_eq!(state.node, second);
        assert_eq!(state.offset, 0);
        inner.merge_text(text, second);
        assert_eq!(inner.arena.node(text).cch, 2);
        let state = inner.cursor(slot, gen).unwrap();
        assert_eq!(state.node, text);
        assert_eq!(state.offset, 1);
    }

    #[test]
    fn test_dispose_cursor() {
        let mut inner = StoreInner::new();
        let (slot, gen) = inner.new_cursor_state(inner.doc, 0);
        assert!(inner.cursor(slot, gen).is_ok());
        assert!(inner.dispose_cursor(slot, gen));
        assert!(matches!(inner.cursor(slot, gen), Err(StoreError::Disposed)));
        assert!(!inner.dispose_cursor(slot, gen));
    }
}
