//! Navigable handles into a replicant's value tree.
//!
//! A [`ValueView`] is the port of the interposer: a lightweight handle
//! carrying its owning replicant and its path from the root. Views are how
//! sub-values travel between call sites — and because they carry ownership
//! identity, grafting a view from one replicant into another is detectable
//! and rejected.
//!
//! A view does not pin the underlying value: after its parent is reassigned
//! the view may dangle, and reads through it return `None`.

use crate::replicant::Replicant;
use crate::errors::ReplicantError;
use serde_json::Value;
use tallyproto::{path, SeqMethod};

/// A value being grafted into a replicant: either a plain JSON tree
/// (owner-free) or a view into some replicant's tree.
pub enum Graft {
    Plain(Value),
    View(ValueView),
}

impl From<Value> for Graft {
    fn from(value: Value) -> Self {
        Graft::Plain(value)
    }
}

impl From<ValueView> for Graft {
    fn from(view: ValueView) -> Self {
        Graft::View(view)
    }
}

impl From<&ValueView> for Graft {
    fn from(view: &ValueView) -> Self {
        Graft::View(view.clone())
    }
}

/// A path-bound handle into one replicant's value tree.
#[derive(Clone)]
pub struct ValueView {
    owner: Replicant,
    path: String,
}

impl std::fmt::Debug for ValueView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueView")
            .field("owner", &self.owner.ident())
            .field("path", &self.path)
            .finish()
    }
}

impl ValueView {
    pub(crate) fn new(owner: Replicant, path: String) -> Self {
        Self { owner, path }
    }

    pub fn owner(&self) -> &Replicant {
        &self.owner
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Descend into a keyed member.
    pub fn child(&self, key: &str) -> ValueView {
        ValueView::new(self.owner.clone(), path::join(&self.path, key))
    }

    /// Descend into a sequence element.
    pub fn index(&self, idx: usize) -> ValueView {
        self.child(&idx.to_string())
    }

    /// Clone of the subtree this view points at, if it still resolves.
    pub fn get(&self) -> Option<Value> {
        self.owner.get(&self.path)
    }

    pub fn exists(&self) -> bool {
        self.get().is_some()
    }

    /// Assign member `key` of the node this view points at.
    pub fn set(&self, key: &str, value: impl Into<Graft>) -> Result<(), ReplicantError> {
        self.owner.set(&path::join(&self.path, key), value)
    }

    /// Assign a sequence element of the node this view points at.
    pub fn set_index(&self, idx: usize, value: impl Into<Graft>) -> Result<(), ReplicantError> {
        self.set(&idx.to_string(), value)
    }

    /// Remove member `key` of the node this view points at.
    pub fn delete(&self, key: &str) -> Result<(), ReplicantError> {
        self.owner.delete(&path::join(&self.path, key))
    }

    /// Replace the node this view points at wholesale.
    pub fn replace(&self, value: impl Into<Graft>) -> Result<(), ReplicantError> {
        if self.path == path::ROOT {
            self.owner.replace(value)
        } else {
            self.owner.set(&self.path, value)
        }
    }

    pub fn push(&self, items: Vec<Value>) -> Result<Option<Value>, ReplicantError> {
        self.owner.mutate(&self.path, SeqMethod::Push, items)
    }

    pub fn pop(&self) -> Result<Option<Value>, ReplicantError> {
        self.owner.mutate(&self.path, SeqMethod::Pop, vec![])
    }

    pub fn shift(&self) -> Result<Option<Value>, ReplicantError> {
        self.owner.mutate(&self.path, SeqMethod::Shift, vec![])
    }

    pub fn unshift(&self, items: Vec<Value>) -> Result<Option<Value>, ReplicantError> {
        self.owner.mutate(&self.path, SeqMethod::Unshift, items)
    }

    pub fn splice(&self, args: Vec<Value>) -> Result<Option<Value>, ReplicantError> {
        self.owner.mutate(&self.path, SeqMethod::Splice, args)
    }

    pub fn fill(&self, args: Vec<Value>) -> Result<Option<Value>, ReplicantError> {
        self.owner.mutate(&self.path, SeqMethod::Fill, args)
    }

    pub fn sort(&self) -> Result<Option<Value>, ReplicantError> {
        self.owner.mutate(&self.path, SeqMethod::Sort, vec![])
    }

    pub fn reverse(&self) -> Result<Option<Value>, ReplicantError> {
        self.owner.mutate(&self.path, SeqMethod::Reverse, vec![])
    }

    pub fn copy_within(&self, args: Vec<Value>) -> Result<Option<Value>, ReplicantError> {
        self.owner.mutate(&self.path, SeqMethod::CopyWithin, args)
    }
}
