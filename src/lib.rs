//! RustyStore - mutable XML document store with cursor-based editing
//!
//! Layers:
//! A: Gap-buffer character store + balanced token tree (store)
//! B: Stateful cursors for traversal and mutation (cursor)
//! C: Typed-value overlay contract with lazy revalidation (typed)
//! D: Compiled path queries over the tree (query)
//! E: Pull reader/loader and serialization sinks (reader, save)
//!
//! One monitor per document; cross-document moves take both monitors under
//! a global ordering lock. Every observable mutation stamps the document
//! version, which savers and query selections use for cheap change
//! detection.

mod error;
mod lock;

pub mod cursor;
pub mod query;
pub mod reader;
pub mod save;
pub mod store;
pub mod typed;

pub use cursor::bookmark::BookmarkKey;
pub use cursor::{Cursor, TokenType, XmlName};
pub use error::{Result, StoreError};
pub use query::{compile_path, CompiledPath, PathEngine, Selections};
pub use save::{SaveEvent, SaveOptions, Saver};
pub use store::XmlStore;
pub use typed::{provider_flags, TypedValueProvider};
