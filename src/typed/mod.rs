//! Typed Module - typed-value overlay contract
//!
//! The store consumes typed bindings, it never implements them:
//! - `TypedValueProvider` supplies derived text (`build_text`) and receives
//!   invalidation callbacks when the underlying XML changes
//! - Attachments hang off node overlays; documents count how many carry
//!   value caches or order sensitivity so unaffected edits skip the walk
//! - Ordered insertion and bulk array replace helpers keep bindings' child
//!   layout conventions without each binding reimplementing the scans

use std::sync::Arc;

use crate::cursor::{Cursor, XmlName};
use crate::error::{Result, StoreError};
use crate::store::name::NameTest;
use crate::store::root::EditPhase;
use crate::store::QName;

/// Sensitivity flags reported by a provider
pub mod provider_flags {
    /// The binding caches a typed value derived from content text
    pub const HAS_VALUE: u32 = 0x1;
    /// The binding is sensitive to the order of child elements
    pub const ORDER_SENSITIVE: u32 = 0x2;
    /// The binding tracks xsi:nil separately
    pub const HAS_NILVALUE: u32 = 0x4;
}

/// A typed-value binding attached to a container node.
///
/// Callbacks are notifications only: a provider must not re-enter the
/// document from inside them (the document monitor is held by the caller).
pub trait TypedValueProvider: Send + Sync {
    /// Derive the textual content for the bound element
    fn build_text(&self) -> String;

    /// The cached typed value no longer matches the content text
    fn invalidate_value(&self);

    /// The xsi:nil state may have changed
    fn invalidate_nilvalue(&self) {}

    /// The order of child elements changed under an order-sensitive binding
    fn invalidate_element_order(&self) {}

    /// Sensitivity flags for an element binding
    fn element_flags(&self) -> u32 {
        0
    }

    /// Sensitivity flags for an attribute binding
    fn attribute_flags(&self) -> u32 {
        0
    }
}

impl Cursor {
    /// Attach a typed binding to the container at the cursor
    pub fn attach_typed_value(&self, provider: Arc<dyn TypedValueProvider>) -> Result<()> {
        let mut inner = self.lock();
        let (node, _) = self.pos(&inner)?;
        if !inner.arena.node(node).is_container() {
            return Err(StoreError::state("typed bindings attach to containers"));
        }
        inner.attach_provider(node, provider);
        Ok(())
    }

    /// Detach any typed binding from the container at the cursor
    pub fn detach_typed_value(&self) -> Result<()> {
        let mut inner = self.lock();
        let (node, _) = self.pos(&inner)?;
        inner.detach_provider(node);
        Ok(())
    }

    /// Mark the container's textual contents stale.
    ///
    /// Nothing is rebuilt now: the next read or traversal into the
    /// container re-derives the text from the binding.
    pub fn invalidate_text(&self) -> Result<()> {
        let mut inner = self.lock();
        let (node, _) = self.pos(&inner)?;
        if !inner.arena.node(node).is_container() {
            return Err(StoreError::state("only container contents can go stale"));
        }
        inner.invalidate_contents(node);
        Ok(())
    }

    /// Notify order-sensitive bindings up the container chain that the
    /// element at the cursor moved among its siblings
    pub fn invalidate_element(&self) -> Result<()> {
        let mut inner = self.lock();
        let (node, _) = self.pos(&inner)?;
        if !inner.arena.node(node).is_begin() {
            return Err(StoreError::state("not at an element start"));
        }
        let container = inner
            .arena
            .node(node)
            .container
            .expect("element without container");
        inner.invalidate_user(container, true, EditPhase::Normal);
        Ok(())
    }

    /// Insert an empty child element into the container at the cursor,
    /// placed before the first existing child whose name is in `enders`
    /// (the binding's ending-delimiter set), or at the end of the content
    /// when none matches.
    pub fn add_element_in_order(&self, name: &XmlName, enders: &[XmlName]) -> Result<()> {
        crate::store::name::validate_local(&name.local)?;
        let mut inner = self.lock();
        let (node, _) = self.pos(&inner)?;
        if !inner.arena.node(node).is_container() {
            return Err(StoreError::state("not at a container"));
        }
        inner.ensure_contents_valid(node);

        let ender_names: Vec<QName> = enders
            .iter()
            .filter_map(|n| {
                let uri = inner.names.lookup(&n.uri)?;
                let local = inner.names.lookup(&n.local)?;
                Some(QName::new(uri, local, 0))
            })
            .collect();
        let point = inner
            .find_nth_begin(node, NameTest::AnyOf(&ender_names), 0)
            .unwrap_or_else(|| {
                inner
                    .arena
                    .node(node)
                    .partner
                    .expect("container without end")
            });

        let qname = QName::new(
            inner.names.intern(&name.uri),
            inner.names.intern(&name.local),
            inner.names.intern(&name.prefix),
        );
        inner.insert_pair_before(point, qname, node, EditPhase::Normal);
        Ok(())
    }

    /// Bulk array-style replace: make the container hold exactly
    /// `values.len()` child elements named `name`, inserting or removing
    /// the difference, then rewrite each slot's contents in place.
    pub fn set_element_array(&self, name: &XmlName, values: &[&str]) -> Result<()> {
        crate::store::name::validate_local(&name.local)?;
        let mut inner = self.lock();
        let (node, _) = self.pos(&inner)?;
        if !inner.arena.node(node).is_container() {
            return Err(StoreError::state("not at a container"));
        }
        inner.ensure_contents_valid(node);

        let qname = QName::new(
            inner.names.intern(&name.uri),
            inner.names.intern(&name.local),
            inner.names.intern(&name.prefix),
        );
        let current = inner.count(node, NameTest::Name(qname));

        // Grow: new slots go after the last existing sibling of this name,
        // or at the end of the content
        if values.len() > current {
            let point = if current > 0 {
                let last = inner
                    .find_nth_begin(node, NameTest::Name(qname), current - 1)
                    .expect("counted child vanished");
                inner.next(inner.range_last(last)).expect("end vanished")
            } else {
                inner.arena.node(node).partner.expect("container without end")
            };
            for _ in current..values.len() {
                inner.insert_pair_before(point, qname, node, EditPhase::Normal);
            }
        }

        // Shrink: drop slots from the tail
        if values.len() < current {
            for idx in (values.len()..current).rev() {
                let begin = inner
                    .find_nth_begin(node, NameTest::Name(qname), idx)
                    .expect("counted child vanished");
                let last = inner.range_last(begin);
                inner.remove_range(begin, last, node, EditPhase::Normal);
            }
        }

        // Rewrite every slot in place
        for (idx, value) in values.iter().enumerate() {
            let begin = inner
                .find_nth_begin(node, NameTest::Name(qname), idx)
                .expect("array slot vanished");
            inner.set_element_text(begin, value, EditPhase::Normal);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::TokenType;
    use crate::store::XmlStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingProvider {
        built: AtomicUsize,
        value_invalidations: AtomicUsize,
        order_invalidations: AtomicUsize,
        text: String,
        flags: u32,
    }

    impl TypedValueProvider for CountingProvider {
        fn build_text(&self) -> String {
            self.built.fetch_add(1, Ordering::SeqCst);
            self.text.clone()
        }
        fn invalidate_value(&self) {
            self.value_invalidations.fetch_add(1, Ordering::SeqCst);
        }
        fn invalidate_element_order(&self) {
            self.order_invalidations.fetch_add(1, Ordering::SeqCst);
        }
        fn element_flags(&self) -> u32 {
            self.flags
        }
    }

    fn store_with_root() -> std::sync::Arc<XmlStore> {
        let store = XmlStore::new();
        let c = store.new_cursor();
        c.to_next_token().unwrap();
        c.insert_element(&XmlName::local("root")).unwrap();
        store
    }

    #[test]
    fn test_lazy_revalidation_is_invisible() {
        let store = store_with_root();
        let c = store.new_cursor();
        c.to_first_child().unwrap();
        let provider = Arc::new(CountingProvider {
            text: "derived".to_string(),
            flags: provider_flags::HAS_VALUE,
            ..Default::default()
        });
        c.attach_typed_value(Arc::clone(&provider) as _).unwrap();

        c.invalidate_text().unwrap();
        let v = store.version();
        assert_eq!(provider.built.load(Ordering::SeqCst), 0);

        // First read forces the rebuild, invisibly to change detection
        assert_eq!(c.get_text_value().unwrap(), "derived");
        assert_eq!(provider.built.load(Ordering::SeqCst), 1);
        assert_eq!(store.version(), v);

        // Second read reuses the materialized contents
        assert_eq!(c.get_text_value().unwrap(), "derived");
        assert_eq!(provider.built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_traversal_forces_validation() {
        let store = store_with_root();
        let c = store.new_cursor();
        c.to_first_child().unwrap();
        let provider = Arc::new(CountingProvider {
            text: "abc".to_string(),
            flags: provider_flags::HAS_VALUE,
            ..Default::default()
        });
        c.attach_typed_value(Arc::clone(&provider) as _).unwrap();
        c.invalidate_text().unwrap();

        // Stepping into the container must surface the materialized text,
        // never a spurious empty interior
        assert_eq!(c.to_next_token().unwrap(), TokenType::Text);
        assert_eq!(provider.built.load(Ordering::SeqCst), 1);
        assert_eq!(c.get_text_value().unwrap(), "abc");
    }

    #[test]
    fn test_value_invalidation_on_edit() {
        let store = store_with_root();
        let c = store.new_cursor();
        c.to_first_child().unwrap();
        let provider = Arc::new(CountingProvider {
            flags: provider_flags::HAS_VALUE | provider_flags::ORDER_SENSITIVE,
            ..Default::default()
        });
        c.attach_typed_value(Arc::clone(&provider) as _).unwrap();

        let inside = c.new_cursor().unwrap();
        inside.to_next_token().unwrap(); // End of root
        inside.insert_chars("x").unwrap();
        assert_eq!(provider.value_invalidations.load(Ordering::SeqCst), 1);
        assert_eq!(provider.order_invalidations.load(Ordering::SeqCst), 0);

        inside.insert_element(&XmlName::local("child")).unwrap();
        assert!(provider.value_invalidations.load(Ordering::SeqCst) >= 1);
        assert_eq!(provider.order_invalidations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_add_element_in_order() {
        let store = store_with_root();
        let c = store.new_cursor();
        c.to_first_child().unwrap();
        c.add_element_in_order(&XmlName::local("a"), &[]).unwrap();
        c.add_element_in_order(&XmlName::local("z"), &[]).unwrap();
        // "b" must land before the "z" delimiter
        c.add_element_in_order(&XmlName::local("b"), &[XmlName::local("z")])
            .unwrap();
        let probe = store.new_cursor();
        probe.to_first_child().unwrap();
        assert!(probe.to_first_child().unwrap());
        assert_eq!(probe.name().unwrap().unwrap().local, "a");
        assert!(probe.to_next_sibling().unwrap());
        assert_eq!(probe.name().unwrap().unwrap().local, "b");
        assert!(probe.to_next_sibling().unwrap());
        assert_eq!(probe.name().unwrap().unwrap().local, "z");
    }

    #[test]
    fn test_set_element_array() {
        let store = store_with_root();
        let c = store.new_cursor();
        c.to_first_child().unwrap();
        let name = XmlName::local("v");

        c.set_element_array(&name, &["1", "2", "3"]).unwrap();
        let probe = store.new_cursor();
        probe.to_first_child().unwrap();
        assert!(probe.to_first_child().unwrap());
        assert_eq!(probe.get_text_value().unwrap(), "1");
        assert!(probe.to_next_sibling().unwrap());
        assert_eq!(probe.get_text_value().unwrap(), "2");

        // Shrink rewrites in place and drops the tail
        c.set_element_array(&name, &["x"]).unwrap();
        let probe = store.new_cursor();
        probe.to_first_child().unwrap();
        assert!(probe.to_first_child().unwrap());
        assert_eq!(probe.get_text_value().unwrap(), "x");
        assert!(!probe.to_next_sibling().unwrap());
    }
}
