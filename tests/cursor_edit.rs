//! Cursor editing scenarios against whole documents

use rustystore::{BookmarkKey, StoreError, TokenType, XmlName, XmlStore};

#[test]
fn attribute_insert_then_contents_removal() {
    let store = XmlStore::parse("<a><b>x</b></a>").unwrap();
    let c = store.new_cursor();
    assert!(c.to_first_child().unwrap());
    assert!(c.to_first_child().unwrap()); // Start of <b>

    c.insert_attribute_with_value(&XmlName::local("id"), "1")
        .unwrap();
    assert_eq!(store.to_xml_string().unwrap(), r#"<a><b id="1">x</b></a>"#);

    c.remove_xml_contents().unwrap();
    assert_eq!(store.to_xml_string().unwrap(), r#"<a><b id="1"/></a>"#);
}

#[test]
fn move_element_between_documents() {
    let a = XmlStore::parse("<a><item>payload</item></a>").unwrap();
    let b = XmlStore::parse("<b><stay/></b>").unwrap();

    let ca = a.new_cursor();
    ca.to_first_child().unwrap();
    ca.to_first_child().unwrap(); // <item>

    let cb = b.new_cursor();
    cb.to_first_child().unwrap();
    cb.to_first_child().unwrap(); // before <stay>

    assert!(ca.move_xml(&cb).unwrap());

    // The element left A entirely and appears in B exactly once
    assert_eq!(a.to_xml_string().unwrap(), "<a/>");
    assert_eq!(
        b.to_xml_string().unwrap(),
        "<b><item>payload</item><stay/></b>"
    );

    let walker = b.new_cursor();
    let mut items = 0;
    loop {
        let t = walker.to_next_token().unwrap();
        if t == TokenType::None {
            break;
        }
        if t == TokenType::Start && walker.name().unwrap().unwrap().local == "item" {
            items += 1;
        }
    }
    assert_eq!(items, 1);
}

#[test]
fn move_into_own_subtree_is_noop() {
    let store = XmlStore::parse("<a><outer><inner/></outer></a>").unwrap();
    let src = store.new_cursor();
    src.to_first_child().unwrap();
    src.to_first_child().unwrap(); // <outer>
    let dest = src.new_cursor().unwrap();
    dest.to_first_child().unwrap(); // <inner>, inside the moved range

    assert!(!src.move_xml(&dest).unwrap());
    assert_eq!(
        store.to_xml_string().unwrap(),
        "<a><outer><inner/></outer></a>"
    );
}

#[test]
fn copy_into_own_subtree_stages_through_scratch() {
    let store = XmlStore::parse("<a><outer><inner/></outer></a>").unwrap();
    let src = store.new_cursor();
    src.to_first_child().unwrap();
    src.to_first_child().unwrap(); // <outer>
    let dest = src.new_cursor().unwrap();
    dest.to_first_child().unwrap(); // <inner>

    assert!(src.copy_xml(&dest).unwrap());
    assert_eq!(
        store.to_xml_string().unwrap(),
        "<a><outer><outer><inner/></outer><inner/></outer></a>"
    );
}

#[test]
fn same_document_move_preserves_order() {
    let store = XmlStore::parse("<l><x>1</x><y>2</y><z>3</z></l>").unwrap();
    let src = store.new_cursor();
    src.to_first_child().unwrap();
    src.to_first_child().unwrap(); // <x>
    let dest = store.new_cursor();
    dest.to_end_doc().unwrap();
    dest.to_prev_token().unwrap(); // End of <l>

    assert!(src.move_xml(&dest).unwrap());
    assert_eq!(
        store.to_xml_string().unwrap(),
        "<l><y>2</y><z>3</z><x>1</x></l>"
    );
}

#[test]
fn cursor_survives_subtree_removal() {
    let store = XmlStore::parse("<a><b>xyz</b><c/></a>").unwrap();
    let inside = store.new_cursor();
    inside.to_first_child().unwrap();
    inside.to_first_child().unwrap(); // <b>
    inside.to_next_token().unwrap(); // text
    inside.to_next_char(2).unwrap(); // mid-run

    let remover = store.new_cursor();
    remover.to_first_child().unwrap();
    remover.to_first_child().unwrap();
    remover.remove_xml().unwrap(); // removes <b>xyz</b>

    // The cursor was inside the removed range; it lands on the position
    // immediately following it
    assert_eq!(inside.token_type().unwrap(), TokenType::Start);
    assert_eq!(inside.name().unwrap().unwrap().local, "c");
}

#[test]
fn cursor_survives_ancestor_removal() {
    let store = XmlStore::parse("<a><mid><deep>t</deep></mid><after/></a>").unwrap();
    let inside = store.new_cursor();
    inside.to_first_child().unwrap();
    inside.to_first_child().unwrap(); // <mid>
    inside.to_first_child().unwrap(); // <deep>

    let remover = store.new_cursor();
    remover.to_first_child().unwrap();
    remover.to_first_child().unwrap(); // <mid>, an ancestor of the cursor
    remover.remove_xml().unwrap();

    assert_eq!(inside.token_type().unwrap(), TokenType::Start);
    assert_eq!(inside.name().unwrap().unwrap().local, "after");
}

#[test]
fn remove_document_is_rejected() {
    let store = XmlStore::parse("<a/>").unwrap();
    let c = store.new_cursor();
    assert!(matches!(c.remove_xml(), Err(StoreError::InvalidState(_))));
    c.to_end_doc().unwrap();
    assert!(matches!(c.remove_xml(), Err(StoreError::InvalidState(_))));
}

#[test]
fn invalid_names_are_rejected_before_mutation() {
    let store = XmlStore::parse("<a/>").unwrap();
    let before = store.to_xml_string().unwrap();
    let c = store.new_cursor();
    c.to_end_doc().unwrap();

    assert!(matches!(
        c.insert_element(&XmlName::local("1bad")),
        Err(StoreError::InvalidArgument(_))
    ));
    assert!(matches!(
        c.insert_element(&XmlName::local("a b")),
        Err(StoreError::InvalidArgument(_))
    ));
    assert!(matches!(
        c.insert_proc_inst("xml", "data"),
        Err(StoreError::InvalidArgument(_))
    ));

    let inner = store.new_cursor();
    inner.to_first_child().unwrap();
    assert!(matches!(
        inner.insert_namespace("xmlfoo", "urn:x"),
        Err(StoreError::InvalidArgument(_))
    ));

    // Failed calls are no-ops
    assert_eq!(store.to_xml_string().unwrap(), before);
}

#[test]
fn text_edits_and_char_moves() {
    let store = XmlStore::parse("<a>hello world</a>").unwrap();
    let c = store.new_cursor();
    c.to_first_child().unwrap();
    c.to_next_token().unwrap(); // text
    c.to_next_char(5).unwrap();

    assert_eq!(c.remove_chars(1).unwrap(), 1);
    c.insert_chars("-").unwrap();
    assert_eq!(store.to_xml_string().unwrap(), "<a>hello-world</a>");

    // Move the tail of the run to the front
    let front = store.new_cursor();
    front.to_first_child().unwrap();
    front.to_next_token().unwrap();
    let tail = store.new_cursor();
    tail.to_first_child().unwrap();
    tail.to_next_token().unwrap();
    tail.to_next_char(6).unwrap();
    assert_eq!(tail.move_chars(5, &front).unwrap(), 5);
    assert_eq!(store.to_xml_string().unwrap(), "<a>worldhello-</a>");
}

#[test]
fn set_text_value_replaces_contents() {
    let store = XmlStore::parse("<a><b><c/>old</b></a>").unwrap();
    let c = store.new_cursor();
    c.to_first_child().unwrap();
    c.to_first_child().unwrap();
    c.set_text_value("new").unwrap();
    assert_eq!(store.to_xml_string().unwrap(), "<a><b>new</b></a>");
    assert_eq!(c.get_text_value().unwrap(), "new");
}

#[test]
fn set_name_renames_in_place() {
    let store = XmlStore::parse(r#"<a old="1"/>"#).unwrap();
    let c = store.new_cursor();
    c.to_first_child().unwrap();
    c.set_name(&XmlName::local("renamed")).unwrap();
    assert!(c.to_first_attribute().unwrap());
    c.set_name(&XmlName::local("id")).unwrap();
    assert_eq!(store.to_xml_string().unwrap(), r#"<renamed id="1"/>"#);
}

#[test]
fn bookmarks_nearest_scan() {
    let store = XmlStore::parse("<a>abcdef</a>").unwrap();
    let key = BookmarkKey::new();
    let other = BookmarkKey::new();

    let setter = store.new_cursor();
    setter.to_first_child().unwrap();
    setter.to_next_token().unwrap(); // text
    setter.to_next_char(2).unwrap();
    setter
        .set_bookmark(key, std::sync::Arc::new("two"))
        .unwrap();
    setter.to_next_char(2).unwrap();
    setter
        .set_bookmark(key, std::sync::Arc::new("four"))
        .unwrap();
    setter
        .set_bookmark(other, std::sync::Arc::new("noise"))
        .unwrap();

    let c = store.new_cursor();
    c.to_first_child().unwrap();
    c.to_next_token().unwrap();
    assert!(c.to_next_bookmark(key).unwrap());
    assert_eq!(c.pre_cch().unwrap(), 2);
    let payload = c.get_bookmark(key).unwrap().unwrap();
    assert_eq!(*payload.downcast::<&str>().unwrap(), "two");

    assert!(c.to_next_bookmark(key).unwrap());
    assert_eq!(c.pre_cch().unwrap(), 4);
    assert!(!c.to_next_bookmark(key).unwrap());

    assert!(c.to_prev_bookmark(key).unwrap());
    assert_eq!(c.pre_cch().unwrap(), 2);
}

#[test]
fn bookmark_rides_text_edits() {
    let store = XmlStore::parse("<a>abcdef</a>").unwrap();
    let key = BookmarkKey::new();
    let setter = store.new_cursor();
    setter.to_first_child().unwrap();
    setter.to_next_token().unwrap();
    setter.to_next_char(4).unwrap(); // between d and e
    setter.set_bookmark(key, std::sync::Arc::new(42u32)).unwrap();

    // Insert before the anchor shifts it right
    let editor = store.new_cursor();
    editor.to_first_child().unwrap();
    editor.to_next_token().unwrap();
    editor.insert_chars("__").unwrap();

    let c = store.new_cursor();
    c.to_first_child().unwrap();
    c.to_next_token().unwrap();
    assert!(c.to_next_bookmark(key).unwrap());
    assert_eq!(c.pre_cch().unwrap(), 6);
}

#[test]
fn move_contents_and_copy_contents() {
    let a = XmlStore::parse("<a><x/>mid<y/></a>").unwrap();
    let b = XmlStore::parse("<b/>").unwrap();

    let ca = a.new_cursor();
    ca.to_first_child().unwrap();
    let cb = b.new_cursor();
    cb.to_first_child().unwrap();
    cb.to_next_token().unwrap(); // End of <b>: inside the element

    assert!(ca.copy_xml_contents(&cb).unwrap());
    assert_eq!(b.to_xml_string().unwrap(), "<b><x/>mid<y/></b>");
    // Source untouched by the copy
    assert_eq!(a.to_xml_string().unwrap(), "<a><x/>mid<y/></a>");

    assert!(ca.move_xml_contents(&cb).unwrap());
    assert_eq!(a.to_xml_string().unwrap(), "<a/>");
    assert_eq!(b.to_xml_string().unwrap(), "<b><x/>mid<y/><x/>mid<y/></b>");
}

#[test]
fn find_paths_through_selections() {
    let store =
        XmlStore::parse("<cat><item>1</item><other/><item>2</item><deep><item>3</item></deep></cat>")
            .unwrap();
    let c = store.new_cursor();
    c.to_first_child().unwrap();

    c.select_path("item").unwrap();
    assert_eq!(c.selection_count().unwrap(), 2);

    c.select_path("//item").unwrap();
    assert_eq!(c.selection_count().unwrap(), 3);
    assert!(c.to_selection(2).unwrap());
    assert_eq!(c.get_text_value().unwrap(), "3");

    c.select_path("deep/item").unwrap();
    assert_eq!(c.selection_count().unwrap(), 1);
    assert!(c.to_selection(0).unwrap());
    assert_eq!(c.get_text_value().unwrap(), "3");
}

#[test]
fn namespace_insertion_and_save() {
    let store = XmlStore::parse("<a/>").unwrap();
    let c = store.new_cursor();
    c.to_first_child().unwrap();
    c.insert_namespace("p", "urn:p").unwrap();
    c.insert_attribute_with_value(&XmlName::qualified("urn:p", "x", "p"), "v")
        .unwrap();
    assert_eq!(
        store.to_xml_string().unwrap(),
        r#"<a xmlns:p="urn:p" p:x="v"/>"#
    );
}
