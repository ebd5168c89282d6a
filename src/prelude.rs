//! Internal prelude.

pub(crate) use std::rc::Rc;
pub(crate) use std::fmt::{self, Display};

/// Fast hash map for identity-keyed caches. Iteration order is unspecified.
pub(crate) type UnorderedMap<K, V> = rustc_hash::FxHashMap<K, V>;
