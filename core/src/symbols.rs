//! Hierarchical symbol table.
//!
//! Every container node of the tree is a scope. A scope has a name (its
//! container's identifier), a parent link that is `None` only for the root,
//! named child scopes, and bindings from local names to the node that
//! defines them.
//!
//! Unqualified names resolve by walking outward through parent links and
//! taking the first match; siblings and children are never searched.
//! Qualified names (`Sec.x`, `Doc.List.0`) walk the same chain and, at each
//! scope, try the scope itself and then its named children as the head of
//! the path.
//!
//! A document's table is shared as a [`Region`]: resolution takes the read
//! lock, mutation the write lock.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use rustc_hash::FxHashMap;

use crate::error::Error;
use crate::traits::Value;
use crate::tree::NodeId;

/// Scopes are keyed by the container node that opens them.
pub type ScopeId = NodeId;

/// A dot-separated name path.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedName {
    segments: Vec<String>,
}

impl QualifiedName {
    /// Splits `name` on `.`. Empty segments are dropped.
    pub fn parse(name: &str) -> Self {
        Self {
            segments: name
                .split('.')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect(),
        }
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    #[inline]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    #[inline]
    pub fn first(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    /// The last segment.
    #[inline]
    pub fn local(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    #[inline]
    pub fn is_qualified(&self) -> bool {
        self.segments.len() > 1
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// This path extended by one segment.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// Drops the first segment.
    pub fn tail(&self) -> Self {
        Self {
            segments: self.segments.iter().skip(1).cloned().collect(),
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            f.write_str(segment)?;
        }
        Ok(())
    }
}

impl From<&str> for QualifiedName {
    fn from(name: &str) -> Self {
        Self::parse(name)
    }
}

/// A name bound in a scope. `value` is `None` until the definer has been
/// evaluated.
#[derive(Debug, Clone)]
pub struct Binding {
    pub definer: NodeId,
    pub value: Option<Value>,
}

#[derive(Debug)]
struct Scope {
    name: String,
    parent: Option<ScopeId>,
    children: FxHashMap<String, ScopeId>,
    bindings: FxHashMap<String, Binding>,
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    scopes: FxHashMap<ScopeId, Scope>,
    root: Option<ScopeId>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn root(&self) -> Option<ScopeId> {
        self.root
    }

    #[inline]
    pub fn contains_scope(&self, scope: ScopeId) -> bool {
        self.scopes.contains_key(&scope)
    }

    #[inline]
    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }

    /// Opens a scope for container `id`. `parent: None` makes it the root.
    ///
    /// When two sibling scopes share a name, the one opened first is the
    /// one reachable by qualified lookup.
    pub fn open_scope(&mut self, id: ScopeId, parent: Option<ScopeId>, name: impl Into<String>) {
        let name = name.into();
        match parent {
            Some(parent) => {
                if let Some(p) = self.scopes.get_mut(&parent) {
                    p.children.entry(name.clone()).or_insert(id);
                }
            }
            None => self.root = Some(id),
        }
        self.scopes.insert(
            id,
            Scope {
                name,
                parent,
                children: FxHashMap::default(),
                bindings: FxHashMap::default(),
            },
        );
    }

    /// Changes a scope's name, keeping its bindings.
    pub fn rename_scope(&mut self, id: ScopeId, name: impl Into<String>) -> Result<(), Error> {
        let name = name.into();
        let scope = self.scopes.get_mut(&id).ok_or(Error::UnknownScope)?;
        if scope.name == name {
            return Ok(());
        }
        let old = std::mem::replace(&mut scope.name, name.clone());
        if let Some(parent) = scope.parent.and_then(|p| self.scopes.get_mut(&p)) {
            if parent.children.get(&old) == Some(&id) {
                parent.children.remove(&old);
            }
            parent.children.entry(name).or_insert(id);
        }
        Ok(())
    }

    /// Moves a scope under a new parent.
    pub fn reparent_scope(&mut self, id: ScopeId, parent: ScopeId) -> Result<(), Error> {
        let scope = self.scopes.get_mut(&id).ok_or(Error::UnknownScope)?;
        let old_parent = scope.parent.replace(parent);
        let name = scope.name.clone();
        if old_parent == Some(parent) {
            return Ok(());
        }
        if let Some(old) = old_parent.and_then(|p| self.scopes.get_mut(&p)) {
            if old.children.get(&name) == Some(&id) {
                old.children.remove(&name);
            }
        }
        if let Some(new) = self.scopes.get_mut(&parent) {
            new.children.entry(name).or_insert(id);
        }
        Ok(())
    }

    /// Closes a scope and every scope nested in it, dropping their bindings.
    pub fn close_scope(&mut self, id: ScopeId) {
        let Some(scope) = self.scopes.get(&id) else {
            return;
        };
        let (name, parent) = (scope.name.clone(), scope.parent);
        if let Some(parent) = parent.and_then(|p| self.scopes.get_mut(&p)) {
            if parent.children.get(&name) == Some(&id) {
                parent.children.remove(&name);
            }
        }

        // `children` only holds the first scope of each name, so index
        // nesting by parent once.
        let mut nested: FxHashMap<ScopeId, Vec<ScopeId>> = FxHashMap::default();
        for (&child, entry) in &self.scopes {
            if let Some(parent) = entry.parent {
                nested.entry(parent).or_default().push(child);
            }
        }
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            self.scopes.remove(&next);
            if self.root == Some(next) {
                self.root = None;
            }
            stack.extend(nested.remove(&next).unwrap_or_default());
        }
    }

    /// Removes one scope, leaving nested scopes in place for the caller to
    /// reparent.
    pub fn drop_scope(&mut self, id: ScopeId) {
        let Some(scope) = self.scopes.remove(&id) else {
            return;
        };
        if let Some(parent) = scope.parent.and_then(|p| self.scopes.get_mut(&p)) {
            if parent.children.get(&scope.name) == Some(&id) {
                parent.children.remove(&scope.name);
            }
        }
        if self.root == Some(id) {
            self.root = None;
        }
    }

    /// Replaces the named children of `id`, in order. The first child
    /// with a given name wins.
    pub fn set_child_scopes<I>(&mut self, id: ScopeId, children: I)
    where
        I: IntoIterator<Item = (String, ScopeId)>,
    {
        let Some(scope) = self.scopes.get_mut(&id) else {
            return;
        };
        scope.children.clear();
        for (name, child) in children {
            scope.children.entry(name).or_insert(child);
        }
    }

    /// Binds `name` in `scope`.
    ///
    /// Fails with [`Error::DuplicateDefinition`] if the scope already binds
    /// it; the existing binding is kept.
    pub fn define(&mut self, scope: ScopeId, name: &str, definer: NodeId) -> Result<(), Error> {
        let path = self.scope_path(scope)?;
        let entry = self.scopes.get_mut(&scope).ok_or(Error::UnknownScope)?;
        if entry.bindings.contains_key(name) {
            return Err(Error::DuplicateDefinition {
                scope: path,
                name: name.to_owned(),
            });
        }
        entry.bindings.insert(
            name.to_owned(),
            Binding {
                definer,
                value: None,
            },
        );
        Ok(())
    }

    pub fn undefine(&mut self, scope: ScopeId, name: &str) -> Option<Binding> {
        self.scopes.get_mut(&scope)?.bindings.remove(name)
    }

    /// Removes the binding only if `definer` owns it.
    pub fn undefine_if(&mut self, scope: ScopeId, name: &str, definer: NodeId) -> bool {
        let Some(entry) = self.scopes.get_mut(&scope) else {
            return false;
        };
        if entry.bindings.get(name).is_some_and(|b| b.definer == definer) {
            entry.bindings.remove(name);
            true
        } else {
            false
        }
    }

    /// Replaces a binding's value, returning the previous one.
    pub fn set_value(
        &mut self,
        scope: ScopeId,
        name: &str,
        value: Option<Value>,
    ) -> Result<Option<Value>, Error> {
        let binding = self
            .scopes
            .get_mut(&scope)
            .and_then(|s| s.bindings.get_mut(name))
            .ok_or_else(|| Error::NotFound(QualifiedName::parse(name)))?;
        Ok(std::mem::replace(&mut binding.value, value))
    }

    pub fn get(&self, scope: ScopeId, name: &str) -> Option<&Binding> {
        self.scopes.get(&scope)?.bindings.get(name)
    }

    /// `scope` and its ancestors, innermost first.
    pub fn chain(&self, scope: ScopeId) -> impl Iterator<Item = ScopeId> + '_ {
        std::iter::successors(Some(scope), move |s| self.scopes.get(s).and_then(|s| s.parent))
            .filter(move |s| self.scopes.contains_key(s))
    }

    /// Names of the scopes from the root down to `scope`.
    pub fn scope_path(&self, scope: ScopeId) -> Result<QualifiedName, Error> {
        let mut segments = Vec::new();
        for id in self.chain(scope) {
            let entry = self.scopes.get(&id).ok_or(Error::UnknownScope)?;
            segments.push(entry.name.clone());
        }
        if segments.is_empty() {
            return Err(Error::UnknownScope);
        }
        segments.reverse();
        Ok(QualifiedName { segments })
    }

    /// Fully qualified name of `name` bound in `scope`.
    pub fn qualified_name(&self, scope: ScopeId, name: &str) -> Result<QualifiedName, Error> {
        Ok(self.scope_path(scope)?.child(name))
    }

    /// Resolves `name` as seen from `scope`.
    pub fn resolve(&self, scope: ScopeId, name: &QualifiedName) -> Result<&Binding, Error> {
        self.lookup(scope, name)
            .ok_or_else(|| Error::NotFound(name.clone()))
    }

    fn lookup(&self, scope: ScopeId, name: &QualifiedName) -> Option<&Binding> {
        let (local, path) = name.segments.split_last()?;
        let Some((head, rest)) = path.split_first() else {
            return self
                .chain(scope)
                .find_map(|s| self.scopes.get(&s)?.bindings.get(local));
        };

        self.chain(scope).find_map(|id| {
            let entry = self.scopes.get(&id)?;
            let own = (entry.name == *head)
                .then(|| self.descend(id, rest, local))
                .flatten();
            own.or_else(|| {
                let child = *entry.children.get(head)?;
                self.descend(child, rest, local)
            })
        })
    }

    fn descend(&self, mut scope: ScopeId, path: &[String], local: &str) -> Option<&Binding> {
        for segment in path {
            scope = *self.scopes.get(&scope)?.children.get(segment)?;
        }
        self.scopes.get(&scope)?.bindings.get(local)
    }

    /// Every binding with its qualified name, sorted by name.
    pub fn bindings(&self) -> Vec<(QualifiedName, &Binding)> {
        let mut out: Vec<_> = self
            .scopes
            .keys()
            .filter_map(|&id| {
                let path = self.scope_path(id).ok()?;
                let scope = self.scopes.get(&id)?;
                Some(
                    scope
                        .bindings
                        .iter()
                        .map(move |(name, b)| (path.child(name.as_str()), b))
                        .collect::<Vec<_>>(),
                )
            })
            .flatten()
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

/// A document's symbol table behind a reader-writer lock, with a version
/// counter bumped after every pipeline run that changed a value.
#[derive(Debug)]
pub struct Region {
    name: String,
    table: RwLock<SymbolTable>,
    version: AtomicU64,
}

impl Region {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: RwLock::new(SymbolTable::new()),
            version: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn read(&self) -> Result<RwLockReadGuard<'_, SymbolTable>, Error> {
        self.table.read().map_err(|_| Error::Poisoned)
    }

    pub fn write(&self) -> Result<RwLockWriteGuard<'_, SymbolTable>, Error> {
        self.table.write().map_err(|_| Error::Poisoned)
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Increments the version, returning the new value.
    #[inline]
    pub fn bump(&self) -> u64 {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Idx;

    fn id(n: u32) -> NodeId {
        Idx::from_raw(n)
    }

    /// Doc ⊃ A ⊃ B ⊃ C, each binding `x`, with `y` only in A.
    fn nested() -> SymbolTable {
        let mut table = SymbolTable::new();
        table.open_scope(id(0), None, "Doc");
        table.open_scope(id(1), Some(id(0)), "A");
        table.open_scope(id(2), Some(id(1)), "B");
        table.open_scope(id(3), Some(id(2)), "C");
        for (scope, definer) in [(1, 11), (2, 12), (3, 13)] {
            table.define(id(scope), "x", id(definer)).unwrap();
        }
        table.define(id(1), "y", id(21)).unwrap();
        table
    }

    #[test]
    fn test_shadowing() {
        let table = nested();
        let b = table.resolve(id(3), &"x".into()).unwrap();
        assert_eq!(b.definer, id(13));
        let b = table.resolve(id(3), &"y".into()).unwrap();
        assert_eq!(b.definer, id(21));
    }

    #[test]
    fn test_qualified_lookup() {
        let table = nested();
        assert_eq!(table.resolve(id(3), &"A.x".into()).unwrap().definer, id(11));
        assert_eq!(table.resolve(id(3), &"B.x".into()).unwrap().definer, id(12));
        assert_eq!(table.resolve(id(0), &"A.B.C.x".into()).unwrap().definer, id(13));
        assert_eq!(table.resolve(id(3), &"Doc.A.x".into()).unwrap().definer, id(11));
    }

    #[test]
    fn test_never_searches_children_or_siblings() {
        let mut table = nested();
        table.open_scope(id(4), Some(id(0)), "Side");
        table.define(id(4), "z", id(30)).unwrap();

        assert!(matches!(
            table.resolve(id(3), &"z".into()),
            Err(Error::NotFound(_))
        ));
        assert!(table.resolve(id(0), &"x".into()).is_err());
        assert_eq!(table.resolve(id(3), &"Side.z".into()).unwrap().definer, id(30));
    }

    #[test]
    fn test_duplicate_definition() {
        let mut table = nested();
        let err = table.define(id(2), "x", id(99)).unwrap_err();
        assert_eq!(
            err,
            Error::DuplicateDefinition {
                scope: QualifiedName::parse("Doc.A.B"),
                name: "x".into(),
            }
        );
        assert_eq!(table.get(id(2), "x").map(|b| b.definer), Some(id(12)));
    }

    #[test]
    fn test_close_scope_is_recursive() {
        let mut table = nested();
        table.close_scope(id(1));
        assert_eq!(table.scope_count(), 1);
        assert!(table.resolve(id(0), &"A.x".into()).is_err());
    }

    #[test]
    fn test_close_scope_reaches_same_named_siblings() {
        let mut table = nested();
        table.open_scope(id(5), Some(id(1)), "S");
        table.open_scope(id(6), Some(id(1)), "S");
        table.open_scope(id(7), Some(id(6)), "T");
        assert_eq!(table.scope_count(), 7);
        table.close_scope(id(1));
        assert_eq!(table.scope_count(), 1);
        assert!(!table.contains_scope(id(7)));
    }

    #[test]
    fn test_rename_and_undefine_if() {
        let mut table = nested();
        table.rename_scope(id(1), "Renamed").unwrap();
        assert!(table.resolve(id(0), &"A.y".into()).is_err());
        assert!(table.resolve(id(0), &"Renamed.y".into()).is_ok());

        assert!(!table.undefine_if(id(1), "y", id(99)));
        assert!(table.undefine_if(id(1), "y", id(21)));
        assert!(table.get(id(1), "y").is_none());
    }

    #[test]
    fn test_bindings_sorted() {
        let table = nested();
        let names: Vec<String> = table.bindings().iter().map(|(n, _)| n.to_string()).collect();
        assert_eq!(names, ["Doc.A.B.C.x", "Doc.A.B.x", "Doc.A.x", "Doc.A.y"]);
    }

    #[test]
    fn test_region_version() {
        let region = Region::new("Doc");
        assert_eq!(region.version(), 0);
        assert_eq!(region.bump(), 1);
        region.write().unwrap().open_scope(id(0), None, "Doc");
        assert_eq!(region.read().unwrap().root(), Some(id(0)));
    }
}
