//! Keyed bookmark annotations
//!
//! A bookmark anchors an opaque application payload at a (node, offset)
//! position. The store only compares keys for equality and keeps anchors
//! positioned: anchors ride their node through moves, shift with text
//! edits, and die with removed content.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cursor::Cursor;
use crate::error::Result;
use crate::store::node::NodeId;

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// An opaque application key identifying a family of bookmarks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BookmarkKey(u64);

impl BookmarkKey {
    /// Mint a fresh, process-unique key
    pub fn new() -> BookmarkKey {
        BookmarkKey(NEXT_KEY.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for BookmarkKey {
    fn default() -> Self {
        BookmarkKey::new()
    }
}

/// One anchored annotation
pub struct Bookmark {
    pub key: BookmarkKey,
    pub offset: u32,
    pub payload: Arc<dyn Any + Send + Sync>,
}

impl Cursor {
    /// Anchor a payload at the current position, replacing any bookmark
    /// with the same key at exactly this position
    pub fn set_bookmark(&self, key: BookmarkKey, payload: Arc<dyn Any + Send + Sync>) -> Result<()> {
        let mut inner = self.lock();
        let (node, offset) = self.pos(&inner)?;
        let overlay = inner.arena.node_mut(node).overlay_mut();
        if let Some(existing) = overlay
            .bookmarks
            .iter_mut()
            .find(|b| b.key == key && b.offset == offset)
        {
            existing.payload = payload;
        } else {
            overlay.bookmarks.push(Bookmark {
                key,
                offset,
                payload,
            });
        }
        Ok(())
    }

    /// Payload anchored with `key` at exactly the current position
    pub fn get_bookmark(&self, key: BookmarkKey) -> Result<Option<Arc<dyn Any + Send + Sync>>> {
        let inner = self.lock();
        let (node, offset) = self.pos(&inner)?;
        Ok(inner
            .arena
            .node(node)
            .overlay
            .as_ref()
            .and_then(|o| {
                o.bookmarks
                    .iter()
                    .find(|b| b.key == key && b.offset == offset)
            })
            .map(|b| Arc::clone(&b.payload)))
    }

    /// Remove the bookmark with `key` at exactly the current position
    pub fn clear_bookmark(&self, key: BookmarkKey) -> Result<bool> {
        let mut inner = self.lock();
        let (node, offset) = self.pos(&inner)?;
        let n = inner.arena.node_mut(node);
        let mut found = false;
        if let Some(overlay) = n.overlay.as_mut() {
            let before = overlay.bookmarks.len();
            overlay.bookmarks.retain(|b| !(b.key == key && b.offset == offset));
            found = overlay.bookmarks.len() != before;
        }
        n.shed_overlay();
        Ok(found)
    }

    /// Move to the nearest bookmark with `key` after the current position.
    ///
    /// Anchors later in the current text run win over anchors on later
    /// tokens; among anchors on one node the smallest offset wins.
    pub fn to_next_bookmark(&self, key: BookmarkKey) -> Result<bool> {
        let mut inner = self.lock();
        let (node, offset) = self.pos(&inner)?;

        let nearest_after = |inner: &crate::store::root::StoreInner, id: NodeId, min: Option<u32>| {
            inner
                .arena
                .node(id)
                .overlay
                .as_ref()
                .map(|o| {
                    o.bookmarks
                        .iter()
                        .filter(|b| b.key == key && min.map_or(true, |m| b.offset > m))
                        .map(|b| b.offset)
                        .min()
                })
                .unwrap_or(None)
        };

        // Remainder of the current run first
        if let Some(off) = nearest_after(&inner, node, Some(offset)) {
            self.set_pos(&mut inner, node, off);
            return Ok(true);
        }
        let mut cur = inner.next(node);
        while let Some(id) = cur {
            if let Some(off) = nearest_after(&inner, id, None) {
                self.set_pos(&mut inner, id, off);
                return Ok(true);
            }
            cur = inner.next(id);
        }
        Ok(false)
    }

    /// Move to the nearest bookmark with `key` before the current position
    pub fn to_prev_bookmark(&self, key: BookmarkKey) -> Result<bool> {
        let mut inner = self.lock();
        let (node, offset) = self.pos(&inner)?;

        let nearest_before = |inner: &crate::store::root::StoreInner, id: NodeId, max: Option<u32>| {
            inner
                .arena
                .node(id)
                .overlay
                .as_ref()
                .map(|o| {
                    o.bookmarks
                        .iter()
                        .filter(|b| b.key == key && max.map_or(true, |m| b.offset < m))
                        .map(|b| b.offset)
                        .max()
                })
                .unwrap_or(None)
        };

        if let Some(off) = nearest_before(&inner, node, Some(offset)) {
            self.set_pos(&mut inner, node, off);
            return Ok(true);
        }
        let mut cur = inner.prev(node);
        while let Some(id) = cur {
            if let Some(off) = nearest_before(&inner, id, None) {
                self.set_pos(&mut inner, id, off);
                return Ok(true);
            }
            cur = inner.prev(id);
        }
        Ok(false)
    }
}
