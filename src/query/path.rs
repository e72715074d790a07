//! Path expression compiler and engine
//!
//! Compiles a location-path subset into a step program:
//! - `child` steps (`a/b`), descendant steps (`//a`), attribute steps (`@id`)
//! - name tests and wildcards, `.` for the context node
//! - leading `/` anchors the path at the document root
//!
//! Compiled paths are cached by source text in a process-wide LRU, and
//! evaluated by a stack-driven engine that yields matches in document
//! order, one pull at a time.

use std::num::NonZeroUsize;
use std::sync::{Arc, OnceLock};

use lru::LruCache;
use parking_lot::Mutex;

use crate::error::{Result, StoreError};
use crate::query::{PathEngine, Selections};
use crate::store::node::{NodeId, NodeKind};
use crate::store::root::StoreInner;

const CACHE_CAPACITY: usize = 128;

/// Axis of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    /// Direct child elements
    Child,
    /// All descendant elements, any depth
    Descendant,
    /// Attributes of the context element
    Attribute,
    /// The context node itself
    SelfNode,
}

/// Node test of one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Test {
    /// Any name
    Any,
    /// A local name
    Name(String),
}

/// One compiled step
#[derive(Debug, Clone)]
pub struct Step {
    pub axis: Axis,
    pub test: Test,
}

/// A compiled path expression
#[derive(Debug)]
pub struct CompiledPath {
    absolute: bool,
    steps: Vec<Step>,
}

// ============================================================================
// Lexing and parsing
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Slash,
    DoubleSlash,
    At,
    Star,
    Dot,
    Name(String),
}

fn lex(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();
    while let Some(&(at, c)) = chars.peek() {
        match c {
            '/' => {
                chars.next();
                if chars.peek().map(|&(_, c)| c) == Some('/') {
                    chars.next();
                    tokens.push(Token::DoubleSlash);
                } else {
                    tokens.push(Token::Slash);
                }
            }
            '@' => {
                chars.next();
                tokens.push(Token::At);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            c if c == '_' || c.is_alphabetic() => {
                let start = at;
                let mut end = at;
                while let Some(&(i, c)) = chars.peek() {
                    if c == '_' || c == '-' || c == '.' || c.is_alphanumeric() {
                        end = i + c.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Name(input[start..end].to_string()));
            }
            other => {
                return Err(StoreError::arg(format!(
                    "unexpected character {:?} in path expression",
                    other
                )));
            }
        }
    }
    Ok(tokens)
}

impl CompiledPath {
    /// Parse a path expression
    pub fn parse(input: &str) -> Result<CompiledPath> {
        let tokens = lex(input)?;
        if tokens.is_empty() {
            return Err(StoreError::arg("empty path expression"));
        }
        let mut steps = Vec::new();
        let mut absolute = false;
        let mut i = 0;

        // Leading slash anchors at the document root
        let mut descendant = match tokens.first() {
            Some(Token::Slash) => {
                absolute = true;
                i = 1;
                false
            }
            Some(Token::DoubleSlash) => {
                absolute = true;
                i = 1;
                true
            }
            _ => false,
        };

        loop {
            if i >= tokens.len() {
                return Err(StoreError::arg("path expression ends without a step"));
            }
            let mut attribute = false;
            if tokens[i] == Token::At {
                attribute = true;
                i += 1;
            }
            let test = match tokens.get(i) {
                Some(Token::Star) => Test::Any,
                Some(Token::Dot) if !attribute => {
                    if descendant {
                        return Err(StoreError::arg("\".\" cannot follow \"//\""));
                    }
                    i += 1;
                    steps.push(Step {
                        axis: Axis::SelfNode,
                        test: Test::Any,
                    });
                    match tokens.get(i) {
                        None => break,
                        Some(Token::Slash) => {
                            descendant = false;
                            i += 1;
                            continue;
                        }
                        Some(Token::DoubleSlash) => {
                            descendant = true;
                            i += 1;
                            continue;
                        }
                        Some(t) => {
                            return Err(StoreError::arg(format!("unexpected {:?} in path", t)))
                        }
                    }
                }
                Some(Token::Name(name)) => Test::Name(name.clone()),
                other => {
                    return Err(StoreError::arg(format!(
                        "expected a name test, found {:?}",
                        other
                    )));
                }
            };
            i += 1;
            let axis = if attribute {
                Axis::Attribute
            } else if descendant {
                Axis::Descendant
            } else {
                Axis::Child
            };
            steps.push(Step { axis, test });

            match tokens.get(i) {
                None => break,
                Some(Token::Slash) => {
                    descendant = false;
                    i += 1;
                }
                Some(Token::DoubleSlash) => {
                    descendant = true;
                    i += 1;
                }
                Some(t) => return Err(StoreError::arg(format!("unexpected {:?} in path", t))),
            }
        }

        Ok(CompiledPath { absolute, steps })
    }

    /// Build an engine evaluating `path` from `start`.
    ///
    /// Relative paths evaluate from the containing element of `start` (or
    /// `start` itself when it is a container); absolute paths from the
    /// document root.
    pub fn engine(
        path: &Arc<CompiledPath>,
        store: &StoreInner,
        start: NodeId,
    ) -> Box<dyn PathEngine> {
        let context = if path.absolute {
            store.doc
        } else {
            let n = store.arena.node(start);
            if n.is_container() {
                start
            } else {
                store.content_container_at(start)
            }
        };
        Box::new(StepEngine {
            path: Arc::clone(path),
            work: vec![Frame {
                node: context,
                step: 0,
            }],
        })
    }
}

// ============================================================================
// Compile cache
// ============================================================================

static CACHE: OnceLock<Mutex<LruCache<String, Arc<CompiledPath>>>> = OnceLock::new();

/// Compile a path expression, consulting the process-wide LRU cache
pub fn compile_path(input: &str) -> Result<Arc<CompiledPath>> {
    let cache = CACHE.get_or_init(|| {
        Mutex::new(LruCache::new(
            NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero cache capacity"),
        ))
    });
    let mut cache = cache.lock();
    if let Some(hit) = cache.get(input) {
        return Ok(Arc::clone(hit));
    }
    let compiled = Arc::new(CompiledPath::parse(input)?);
    cache.put(input.to_string(), Arc::clone(&compiled));
    Ok(compiled)
}

// ============================================================================
// Engine
// ============================================================================

struct Frame {
    node: NodeId,
    step: usize,
}

/// Stack-driven evaluator yielding matches in document order
struct StepEngine {
    path: Arc<CompiledPath>,
    work: Vec<Frame>,
}

impl StepEngine {
    fn test_matches(store: &StoreInner, test: &Test, name: crate::store::QName) -> bool {
        match test {
            Test::Any => true,
            Test::Name(want) => match store.names.lookup(want) {
                Some(id) => name.local == id,
                None => false,
            },
        }
    }

    /// Child element begins of a container, in document order
    fn child_begins(store: &StoreInner, container: NodeId, test: &Test) -> Vec<NodeId> {
        let mut out = Vec::new();
        let end = store.arena.node(container).partner.expect("container without end");
        let mut cur = store.next(container);
        while let Some(id) = cur {
            if id == end {
                break;
            }
            let n = store.arena.node(id);
            if n.is_begin() {
                if Self::test_matches(store, test, n.name) {
                    out.push(id);
                }
                cur = store.next(store.range_last(id));
            } else {
                cur = store.next(id);
            }
        }
        out
    }

    /// Descendant element begins of a container, any depth, document order
    fn descendant_begins(store: &StoreInner, container: NodeId, test: &Test) -> Vec<NodeId> {
        let mut out = Vec::new();
        let end = store.arena.node(container).partner.expect("container without end");
        let mut cur = store.next(container);
        while let Some(id) = cur {
            if id == end {
                break;
            }
            let n = store.arena.node(id);
            if n.is_begin() && Self::test_matches(store, test, n.name) {
                out.push(id);
            }
            cur = store.next(id);
        }
        out
    }

    /// Attributes of an element matching the test, in document order
    fn attrs(store: &StoreInner, element: NodeId, test: &Test) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cur = store.next(element);
        while let Some(id) = cur {
            let n = store.arena.node(id);
            if !n.is_attr_like() {
                break;
            }
            if n.kind == NodeKind::Attr && Self::test_matches(store, test, n.name) {
                out.push(id);
            }
            cur = store.next(id);
        }
        out
    }
}

impl PathEngine for StepEngine {
    fn next(&mut self, store: &StoreInner, out: &mut Selections) -> bool {
        while let Some(frame) = self.work.pop() {
            if frame.step == self.path.steps.len() {
                out.add(frame.node, 0);
                return !self.work.is_empty();
            }
            let step = &self.path.steps[frame.step];
            let matches = match step.axis {
                Axis::SelfNode => vec![frame.node],
                Axis::Child => Self::child_begins(store, frame.node, &step.test),
                Axis::Descendant => Self::descendant_begins(store, frame.node, &step.test),
                Axis::Attribute => {
                    if store.arena.node(frame.node).is_begin() {
                        Self::attrs(store, frame.node, &step.test)
                    } else {
                        Vec::new()
                    }
                }
            };
            // Attribute matches cannot take further steps
            let next_step = frame.step + 1;
            let terminal_only = step.axis == Axis::Attribute && next_step < self.path.steps.len();
            if terminal_only {
                continue;
            }
            for node in matches.into_iter().rev() {
                self.work.push(Frame {
                    node,
                    step: next_step,
                });
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_relative() {
        let p = CompiledPath::parse("a/b").unwrap();
        assert!(!p.absolute);
        assert_eq!(p.steps.len(), 2);
        assert_eq!(p.steps[0].axis, Axis::Child);
        assert_eq!(p.steps[0].test, Test::Name("a".to_string()));
    }

    #[test]
    fn test_parse_absolute_descendant() {
        let p = CompiledPath::parse("//item").unwrap();
        assert!(p.absolute);
        assert_eq!(p.steps[0].axis, Axis::Descendant);
    }

    #[test]
    fn test_parse_attribute_and_wildcard() {
        let p = CompiledPath::parse("*/@id").unwrap();
        assert_eq!(p.steps[0].test, Test::Any);
        assert_eq!(p.steps[1].axis, Axis::Attribute);
        assert_eq!(p.steps[1].test, Test::Name("id".to_string()));
    }

    #[test]
    fn test_parse_context_step() {
        let p = CompiledPath::parse("./a").unwrap();
        assert_eq!(p.steps[0].axis, Axis::SelfNode);
        assert_eq!(p.steps[1].axis, Axis::Child);
    }

    #[test]
    fn test_parse_errors() {
        assert!(CompiledPath::parse("").is_err());
        assert!(CompiledPath::parse("a/").is_err());
        assert!(CompiledPath::parse("a b").is_err());
        assert!(CompiledPath::parse("$x").is_err());
    }

    #[test]
    fn test_cache_returns_same_object() {
        let a = compile_path("x/y/z").unwrap();
        let b = compile_path("x/y/z").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
