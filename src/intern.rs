// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Process-wide hostname interning.
//!
//! Peer identity throughout the crate is pointer identity on interned
//! hostnames: two [`HostRef`]s compare equal iff they came out of
//! [`intern`] for the same spelling. This keeps directory lookups and the
//! `last_used` cache free of string comparisons.

use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use dashmap::DashMap;
use once_cell::sync::Lazy;

static INTERN_TABLE: Lazy<DashMap<Box<str>, HostRef>> = Lazy::new(DashMap::new);

/// Identity handle for an interned hostname.
///
/// Cheap to clone; equality and hashing go through the pointer, not the
/// characters.
#[derive(Clone)]
pub struct HostRef(Arc<str>);

impl HostRef {
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PartialEq for HostRef {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for HostRef {}

impl Hash for HostRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as *const u8 as usize).hash(state);
    }
}

impl fmt::Display for HostRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for HostRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostRef({:?})", &*self.0)
    }
}

impl AsRef<str> for HostRef {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Intern `name`, returning the canonical handle for it.
pub fn intern(name: &str) -> HostRef {
    if let Some(existing) = INTERN_TABLE.get(name) {
        return existing.clone();
    }
    INTERN_TABLE
        .entry(Box::from(name))
        .or_insert_with(|| HostRef(Arc::from(name)))
        .clone()
}
