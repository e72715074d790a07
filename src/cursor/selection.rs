//! Selection stack and query selections
//!
//! A cursor can save positions two ways:
//! - `push`/`pop`: an exact save/restore stack
//! - selections: an ordered list of result positions, filled explicitly or
//!   lazily by a path engine
//!
//! Saved entries start as cheap raw (node, offset) pairs. Before the
//! document restructures, the change broadcast converts them into tracked
//! positions ("cursify") that removal re-homing keeps pointing at valid
//! landmarks.

use std::sync::Arc;

use crate::cursor::Cursor;
use crate::error::{Result, StoreError};
use crate::query::{CompiledPath, PathEngine};
use crate::store::root::SavedPos;

impl Cursor {
    /// Push the current position onto the save stack
    pub fn push(&self) -> Result<()> {
        let mut inner = self.lock();
        let (node, offset) = self.pos(&inner)?;
        let gen = inner.arena.generation(node);
        let (slot, sgen) = self.slot_key();
        let state = inner.cursor_mut(slot, sgen)?;
        state.stack.push(SavedPos::Raw { node, gen, offset });
        inner.register_for_change(slot);
        Ok(())
    }

    /// Pop the most recently pushed position and move there; false when
    /// the stack is empty (without moving)
    pub fn pop(&self) -> Result<bool> {
        let mut inner = self.lock();
        let (slot, gen) = self.slot_key();
        let Some(saved) = inner.cursor_mut(slot, gen)?.stack.pop() else {
            return Ok(false);
        };
        let resolved = inner.resolve_saved(saved);
        inner.release_saved(saved);
        let (node, offset) = resolved.expect("saved position lost without re-homing");
        self.set_pos(&mut inner, node, offset);
        Ok(true)
    }

    /// Depth of the save stack
    pub fn stack_depth(&self) -> Result<usize> {
        let inner = self.lock();
        let (slot, gen) = self.slot_key();
        Ok(inner.cursor(slot, gen)?.stack.len())
    }

    /// Append the current position to the selection list
    pub fn add_to_selection(&self) -> Result<()> {
        let mut inner = self.lock();
        let (node, offset) = self.pos(&inner)?;
        let gen = inner.arena.generation(node);
        let (slot, sgen) = self.slot_key();
        let state = inner.cursor_mut(slot, sgen)?;
        state
            .selection
            .loaded
            .push(SavedPos::Raw { node, gen, offset });
        inner.register_for_change(slot);
        Ok(())
    }

    /// Evaluate a path expression from the current position, making its
    /// results this cursor's selection. Results are produced incrementally
    /// as the selection is consumed.
    pub fn select_path(&self, path: &str) -> Result<()> {
        let compiled = crate::query::compile_path(path)?;
        self.exec_query(&compiled)
    }

    /// Attach a compiled query's results as this cursor's selection
    pub fn exec_query(&self, query: &Arc<CompiledPath>) -> Result<()> {
        let mut inner = self.lock();
        let (node, _) = self.pos(&inner)?;
        let engine = CompiledPath::engine(query, &inner, node);
        let version = inner.version();
        let (slot, gen) = self.slot_key();
        let state = inner.cursor_mut(slot, gen)?;
        state.selection.loaded.clear();
        state.selection.engine = Some(engine);
        state.selection.engine_version = version;
        inner.register_for_change(slot);
        Ok(())
    }

    /// Load selection entries until at least `want` are available or the
    /// engine is exhausted
    fn load_selection(&self, inner: &mut crate::store::root::StoreInner, want: usize) -> Result<()> {
        let (slot, gen) = self.slot_key();
        loop {
            let state = inner.cursor_mut(slot, gen)?;
            if state.selection.loaded.len() >= want || state.selection.engine.is_none() {
                return Ok(());
            }
            let mut engine = state.selection.engine.take().expect("checked above");
            let engine_version = state.selection.engine_version;
            if engine_version != inner.version() {
                // The document moved on; stale lazy results are dropped
                return Ok(());
            }
            let mut sink = crate::query::Selections::default();
            let more = engine.next(inner, &mut sink);
            let entries: Vec<SavedPos> = sink
                .items
                .iter()
                .map(|&(node, offset)| SavedPos::Raw {
                    node,
                    gen: inner.arena.generation(node),
                    offset,
                })
                .collect();
            let state = inner.cursor_mut(slot, gen)?;
            state.selection.loaded.extend(entries);
            if more {
                state.selection.engine = Some(engine);
            }
        }
    }

    /// Total number of selection results (forces full evaluation)
    pub fn selection_count(&self) -> Result<usize> {
        let mut inner = self.lock();
        self.pos(&inner)?;
        self.load_selection(&mut inner, usize::MAX)?;
        let (slot, gen) = self.slot_key();
        Ok(inner.cursor(slot, gen)?.selection.loaded.len())
    }

    /// Move to the i-th selection result; false when out of range
    pub fn to_selection(&self, i: usize) -> Result<bool> {
        let mut inner = self.lock();
        self.pos(&inner)?;
        self.load_selection(&mut inner, i + 1)?;
        let (slot, gen) = self.slot_key();
        let saved = match inner.cursor(slot, gen)?.selection.loaded.get(i) {
            Some(&saved) => saved,
            None => return Ok(false),
        };
        match inner.resolve_saved(saved) {
            Some((node, offset)) => {
                self.set_pos(&mut inner, node, offset);
                Ok(true)
            }
            None => Err(StoreError::state("selection entry no longer resolvable")),
        }
    }

    /// Drop all selection results and any pending engine
    pub fn clear_selections(&self) -> Result<()> {
        let mut inner = self.lock();
        let (slot, gen) = self.slot_key();
        let state = inner.cursor_mut(slot, gen)?;
        state.selection.engine = None;
        let saved: Vec<SavedPos> = state.selection.loaded.drain(..).collect();
        for pos in saved {
            inner.release_saved(pos);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::cursor::{TokenType, XmlName};
    use crate::store::XmlStore;

    fn sample() -> std::sync::Arc<XmlStore> {
        let store = XmlStore::new();
        let c = store.new_cursor();
        c.to_next_token().unwrap();
        c.insert_element(&XmlName::local("root")).unwrap();
        c.to_prev_token().unwrap();
        for i in 0..3 {
            c.insert_element_with_text(&XmlName::local("item"), &format!("v{i}"))
                .unwrap();
        }
        store
    }

    #[test]
    fn test_push_pop() {
        let store = sample();
        let c = store.new_cursor();
        c.to_first_child().unwrap();
        c.push().unwrap();
        c.to_first_child().unwrap();
        assert_eq!(c.name().unwrap().unwrap().local, "item");
        assert!(c.pop().unwrap());
        assert_eq!(c.name().unwrap().unwrap().local, "root");
        assert!(!c.pop().unwrap());
    }

    #[test]
    fn test_pushed_position_survives_edits() {
        let store = sample();
        let c = store.new_cursor();
        c.to_first_child().unwrap(); // root
        c.to_first_child().unwrap(); // first item
        c.push().unwrap();
        // Remove the first item; the saved position must re-home to the
        // following sibling
        let gone = c.new_cursor().unwrap();
        gone.remove_xml().unwrap();
        assert!(c.pop().unwrap());
        assert_eq!(c.token_type().unwrap(), TokenType::Start);
        assert_eq!(c.get_text_value().unwrap(), "v1");
    }

    #[test]
    fn test_manual_selection() {
        let store = sample();
        let c = store.new_cursor();
        c.to_first_child().unwrap();
        let walker = c.new_cursor().unwrap();
        assert!(walker.to_first_child().unwrap());
        loop {
            walker.add_to_selection().unwrap();
            if !walker.to_next_sibling().unwrap() {
                break;
            }
        }
        // Count through the walker's own selection
        assert_eq!(walker.selection_count().unwrap(), 3);
        assert!(walker.to_selection(1).unwrap());
        assert_eq!(walker.get_text_value().unwrap(), "v1");
        assert!(!walker.to_selection(3).unwrap());
        walker.clear_selections().unwrap();
        assert_eq!(walker.selection_count().unwrap(), 0);
    }
}
