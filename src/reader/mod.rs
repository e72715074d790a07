//! Reader Module - pull parsing into the store
//!
//! Two pieces:
//! - SliceReader: slice-based pull parser emitting events
//! - Loader: feeds reader events through the store's mutation primitives
//!
//! Namespace declarations are resolved while loading, so stored names carry
//! their URIs and the declarations survive as namespace tokens.

pub mod loader;
pub mod slice;

pub use slice::{RawAttr, SliceReader, XmlEvent};
