//! Logical locations and the edges that nest them.
//!
//! A `Scope` is where something happened: an instruction inside a module, a
//! function, a loop, a source line, or one of the synthetic locations
//! (global root, unknown, placeholder). A `Relation` says how a child
//! location attaches to its parent, and `NestedScope` pairs the two into the
//! edge label used to look up or create child Contexts.

use crate::module::{File, Function, Module};
use crate::util::hash_arc;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A logical location within the profiled execution.
#[derive(Clone)]
pub enum Scope {
    /// The root of everything; exactly one Context carries it.
    Global,
    /// A sample that could not be attributed anywhere.
    Unknown,
    /// A synthetic location identified by an opaque marker value.
    Placeholder(u64),
    /// A single instruction within a Module.
    Point { module: Arc<Module>, offset: u64 },
    /// A Function as a whole.
    Function(Arc<Function>),
    /// A source-level loop.
    LexicalLoop { file: Arc<File>, line: u32 },
    /// A binary-level loop with a known source correspondence.
    BinaryLoop {
        module: Arc<Module>,
        offset: u64,
        file: Arc<File>,
        line: u32,
    },
    /// A single source line.
    Line { file: Arc<File>, line: u32 },
}

/// Stable wire tags for Scope variants, shared by the packed transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ScopeType {
    Unknown = 0,
    Global = 1,
    Placeholder = 2,
    Point = 3,
    Function = 4,
    LexicalLoop = 5,
    BinaryLoop = 6,
    Line = 7,
}

impl Scope {
    pub fn scope_type(&self) -> ScopeType {
        match self {
            Scope::Unknown => ScopeType::Unknown,
            Scope::Global => ScopeType::Global,
            Scope::Placeholder(_) => ScopeType::Placeholder,
            Scope::Point { .. } => ScopeType::Point,
            Scope::Function(_) => ScopeType::Function,
            Scope::LexicalLoop { .. } => ScopeType::LexicalLoop,
            Scope::BinaryLoop { .. } => ScopeType::BinaryLoop,
            Scope::Line { .. } => ScopeType::Line,
        }
    }

    /// The (module, offset) pair for point-like scopes.
    pub fn point_data(&self) -> Option<(&Arc<Module>, u64)> {
        match self {
            Scope::Point { module, offset } | Scope::BinaryLoop { module, offset, .. } => {
                Some((module, *offset))
            }
            _ => None,
        }
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        use Scope::*;
        match (self, other) {
            (Global, Global) | (Unknown, Unknown) => true,
            (Placeholder(a), Placeholder(b)) => a == b,
            (
                Point { module: m1, offset: o1 },
                Point { module: m2, offset: o2 },
            ) => Arc::ptr_eq(m1, m2) && o1 == o2,
            (Function(a), Function(b)) => Arc::ptr_eq(a, b),
            (
                LexicalLoop { file: f1, line: l1 },
                LexicalLoop { file: f2, line: l2 },
            ) => Arc::ptr_eq(f1, f2) && l1 == l2,
            (
                BinaryLoop { module: m1, offset: o1, file: f1, line: l1 },
                BinaryLoop { module: m2, offset: o2, file: f2, line: l2 },
            ) => Arc::ptr_eq(m1, m2) && o1 == o2 && Arc::ptr_eq(f1, f2) && l1 == l2,
            (Line { file: f1, line: l1 }, Line { file: f2, line: l2 }) => {
                Arc::ptr_eq(f1, f2) && l1 == l2
            }
            _ => false,
        }
    }
}
impl Eq for Scope {}

impl Hash for Scope {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.scope_type() as u64).hash(state);
        match self {
            Scope::Global | Scope::Unknown => {}
            Scope::Placeholder(v) => v.hash(state),
            Scope::Point { module, offset } => {
                hash_arc(module, state);
                offset.hash(state);
            }
            Scope::Function(f) => hash_arc(f, state),
            Scope::LexicalLoop { file, line } => {
                hash_arc(file, state);
                line.hash(state);
            }
            Scope::BinaryLoop { module, offset, file, line } => {
                hash_arc(module, state);
                offset.hash(state);
                hash_arc(file, state);
                line.hash(state);
            }
            Scope::Line { file, line } => {
                hash_arc(file, state);
                line.hash(state);
            }
        }
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Global => write!(f, "(global)"),
            Scope::Unknown => write!(f, "(unknown)"),
            Scope::Placeholder(v) => write!(f, "(placeholder {v:#x})"),
            Scope::Point { module, offset } => {
                write!(f, "{}+{offset:#x}", module.path().display())
            }
            Scope::Function(func) => write!(f, "{}()", func.name()),
            Scope::LexicalLoop { file, line } => {
                write!(f, "loop@{}:{line}", file.path().display())
            }
            Scope::BinaryLoop { module, offset, file, line } => write!(
                f,
                "loop@{}+{offset:#x}({}:{line})",
                module.path().display(),
                file.path().display()
            ),
            Scope::Line { file, line } => write!(f, "{}:{line}", file.path().display()),
        }
    }
}

/// How a child Context relates to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Relation {
    /// Root edge; only the global Context carries it.
    Global = 0,
    /// Lexical containment (function body, loop nest, line).
    Enclosure = 1,
    /// A physical call.
    Call = 2,
    /// A call elided by inlining.
    InlinedCall = 3,
}

/// The edge label attaching a Context to its parent.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct NestedScope {
    relation: Relation,
    flat: Scope,
}

impl NestedScope {
    pub fn new(relation: Relation, flat: Scope) -> Self {
        NestedScope { relation, flat }
    }
    pub fn relation(&self) -> Relation {
        self.relation
    }
    pub fn flat(&self) -> &Scope {
        &self.flat
    }
    pub fn into_flat(self) -> Scope {
        self.flat
    }
    /// Rewrite the relation, keeping the flat Scope. Used by classifiers.
    pub fn with_relation(self, relation: Relation) -> Self {
        NestedScope { relation, flat: self.flat }
    }
}

impl std::fmt::Debug for NestedScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}->{:?}", self.relation, self.flat)
    }
}
