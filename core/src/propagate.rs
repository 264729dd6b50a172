//! Fixpoint propagation of element values.
//!
//! Each pass walks the elements in document order (ancestors before
//! descendants), re-resolves the references of every element that may be
//! stale and re-evaluates it. A pass that changes nothing is the fixpoint.
//!
//! Dependency edges are never stored between runs: an element's `deps` are
//! simply the definers its references resolved to on its last evaluation.
//! All bookkeeping for one call (change ticks, revisit counts, the rollback
//! journal) is scratch state dropped when the call returns.

use core::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::PipelineConfig;
use crate::error::Error;
use crate::symbols::{QualifiedName, Region, ScopeId};
use crate::traits::{Environment, Lookup, Value};
use crate::tree::{EvalState, Node, NodeId, Tree};

/// Cooperative cancellation flag shared between a pipeline run and whoever
/// may supersede it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Clears the flag before a new run.
    #[inline]
    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A read from another document's region.
#[derive(Debug, Clone)]
pub struct ForeignRead {
    pub document: String,
    /// Region version observed at the time of the read.
    pub version: u64,
    pub lookup: Lookup,
}

/// Resolves names that point into other documents.
pub trait ForeignResolver: Send + Sync {
    /// Resolves `name` on behalf of document `from`. Returns `None` when the
    /// first segment does not name another document.
    fn resolve(&self, from: &str, name: &QualifiedName) -> Option<ForeignRead>;
}

/// No other documents.
impl ForeignResolver for () {
    #[inline]
    fn resolve(&self, _from: &str, _name: &QualifiedName) -> Option<ForeignRead> {
        None
    }
}

/// An element left waiting for names nobody defines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingNode {
    pub node: QualifiedName,
    pub missing: Vec<QualifiedName>,
}

/// Summary of a converged propagation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Propagation {
    pub passes: usize,
    /// Element evaluations performed, across all passes.
    pub evaluated: usize,
    /// Evaluations whose value differed from the previous one.
    pub changed: usize,
    pub pending: Vec<PendingNode>,
}

/// Mutually dependent elements that can never settle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("reference cycle: {}", Members(.members))]
pub struct CycleError {
    /// Qualified names of the cycle members, sorted.
    pub members: Vec<QualifiedName>,
}

struct Members<'a>(&'a [QualifiedName]);

impl fmt::Display for Members<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, name) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            write!(f, "{name}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PropagateError {
    /// The rest of the tree converged; cycle members are marked and unbound.
    #[error(transparent)]
    Cycle(#[from] CycleError),

    /// The pass cap ran out without a detected cycle. The tree keeps its
    /// last values and reports itself unconverged.
    #[error("propagation did not converge within {passes} passes")]
    IterationCapExceeded { passes: usize },

    /// A superseding edit cancelled the run. Every change it made was rolled
    /// back.
    #[error("propagation cancelled")]
    Cancelled,

    #[error(transparent)]
    Pipeline(#[from] Error),
}

/// Runs passes over `tree` until nothing changes.
///
/// Bindings in `region` are written per element under the write lock;
/// resolution takes the read lock. `cancel` is checked after every element
/// mutation.
pub fn propagate(
    tree: &mut Tree,
    region: &Region,
    foreign: &dyn ForeignResolver,
    config: &PipelineConfig,
    cancel: &CancelToken,
) -> Result<Propagation, PropagateError> {
    let mut run = Propagator::new(tree, region, foreign, cancel);
    match run.run(config) {
        Ok(summary) => Ok(summary),
        Err(PropagateError::Cancelled) => {
            run.rollback()?;
            log::debug!("propagation of `{}` cancelled and rolled back", region.name());
            Err(PropagateError::Cancelled)
        }
        Err(err) => Err(err),
    }
}

/// Whether `next` is a different kind of state than `prev` in a way
/// dependents can observe. A dirty element becoming ready is judged by its
/// value alone.
fn transitioned(prev: &EvalState, next: &EvalState) -> bool {
    match (prev, next) {
        (EvalState::Dirty, EvalState::Ready(_)) => false,
        _ => std::mem::discriminant(prev) != std::mem::discriminant(next),
    }
}

/// One element's resolved reference.
enum Resolved {
    Local {
        definer: NodeId,
        value: Option<Value>,
    },
    Foreign(ForeignRead),
    Missing,
}

/// Lookups prefetched before evaluation, so no lock is held while user code
/// runs.
struct Prefetched(FxHashMap<QualifiedName, Lookup>);

impl Environment for Prefetched {
    fn lookup(&self, name: &QualifiedName) -> Lookup {
        self.0.get(name).cloned().unwrap_or(Lookup::Missing)
    }
}

struct JournalEntry {
    id: NodeId,
    state: EvalState,
    serialized: Option<Vec<u8>>,
    deps: Vec<NodeId>,
    foreign: Vec<(String, u64)>,
    binding: Option<(ScopeId, String, Option<Value>)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    Skipped,
    Unchanged,
    Changed,
}

/// Per-call scratch state.
struct Propagator<'a> {
    tree: &'a mut Tree,
    region: &'a Region,
    foreign: &'a dyn ForeignResolver,
    cancel: &'a CancelToken,
    tick: u64,
    evaluated_at: FxHashMap<NodeId, u64>,
    changed_at: FxHashMap<NodeId, u64>,
    revisits: FxHashMap<NodeId, usize>,
    cycle_members: FxHashSet<NodeId>,
    cycles: Vec<Vec<NodeId>>,
    journal: Vec<JournalEntry>,
    summary: Propagation,
}

impl<'a> Propagator<'a> {
    fn new(
        tree: &'a mut Tree,
        region: &'a Region,
        foreign: &'a dyn ForeignResolver,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            tree,
            region,
            foreign,
            cancel,
            tick: 1,
            evaluated_at: FxHashMap::default(),
            changed_at: FxHashMap::default(),
            revisits: FxHashMap::default(),
            cycle_members: FxHashSet::default(),
            cycles: Vec::new(),
            journal: Vec::new(),
            summary: Propagation::default(),
        }
    }

    fn run(&mut self, config: &PipelineConfig) -> Result<Propagation, PropagateError> {
        let order = self.tree.elements();
        for &id in &order {
            let Some(element) = self.tree.get_mut(id).and_then(Node::as_element_mut) else {
                continue;
            };
            if matches!(element.state, EvalState::Cycle) {
                let state = std::mem::replace(&mut element.state, EvalState::Dirty);
                self.journal.push(JournalEntry {
                    id,
                    state,
                    serialized: element.serialized.clone(),
                    deps: element.deps.clone(),
                    foreign: element.foreign.clone(),
                    binding: None,
                });
            }
        }

        let cap = config.pass_cap(self.tree.node_count());
        loop {
            if self.summary.passes >= cap {
                self.tree.set_converged(false);
                if let Some(err) = self.cycle_error() {
                    return Err(err.into());
                }
                log::warn!(
                    "`{}` did not converge within {cap} passes",
                    self.region.name()
                );
                return Err(PropagateError::IterationCapExceeded { passes: cap });
            }
            self.summary.passes += 1;

            let mut changed = 0;
            for &id in &order {
                if self.cycle_members.contains(&id) {
                    continue;
                }
                if self.visit(id)? == Visit::Changed {
                    changed += 1;
                    let count = self.revisits.entry(id).or_insert(0);
                    *count += 1;
                    let toggling = *count > config.revisit_limit;
                    if toggling {
                        let graph: FxHashSet<NodeId> = order.iter().copied().collect();
                        let mut done = FxHashSet::default();
                        if let Some(cycle) = self.find_cycle(id, &graph, &mut done) {
                            self.mark_cycle(cycle)?;
                        }
                    }
                }
            }
            log::debug!(
                "`{}` pass {}: {changed} changed",
                self.region.name(),
                self.summary.passes
            );
            self.summary.changed += changed;
            if changed > 0 {
                continue;
            }

            // Fixpoint: every element's deps now match its references. Values
            // bound before an edit can make a new cycle look settled, so
            // search the whole graph, not just elements left waiting.
            let mut remaining: FxHashSet<NodeId> = order
                .iter()
                .copied()
                .filter(|id| !self.cycle_members.contains(id))
                .collect();
            let mut found = false;
            while let Some(cycle) = self.first_cycle(&order, &remaining) {
                for member in &cycle {
                    remaining.remove(member);
                }
                self.mark_cycle(cycle)?;
                found = true;
            }
            if !found {
                break;
            }
        }

        self.tree.set_converged(true);
        self.summary.pending = order
            .iter()
            .filter_map(|&id| match &self.tree.element(id)?.state {
                EvalState::Pending(missing) => Some(PendingNode {
                    node: self.tree.qualified_name(id),
                    missing: missing.clone(),
                }),
                _ => None,
            })
            .collect();
        match self.cycle_error() {
            Some(err) => Err(err.into()),
            None => Ok(std::mem::take(&mut self.summary)),
        }
    }

    fn visit(&mut self, id: NodeId) -> Result<Visit, PropagateError> {
        let Some(node) = self.tree.get(id) else {
            return Ok(Visit::Skipped);
        };
        let Some(element) = node.as_element() else {
            return Ok(Visit::Skipped);
        };
        let scope = node.parent().node();
        let ident = node.ident().to_owned();
        let refs = element.references().to_vec();

        let mut resolved = Vec::with_capacity(refs.len());
        let bound = {
            let table = self.region.read()?;
            for name in &refs {
                let local = scope.and_then(|s| table.resolve(s, name).ok());
                resolved.push(match local {
                    Some(binding) => Resolved::Local {
                        definer: binding.definer,
                        value: binding.value.clone(),
                    },
                    None => Resolved::Missing,
                });
            }
            match scope {
                Some(scope) if element.defines() => {
                    table.get(scope, &ident).map(|b| b.value.is_some())
                }
                _ => None,
            }
        };
        for (name, slot) in refs.iter().zip(resolved.iter_mut()) {
            if matches!(slot, Resolved::Missing) {
                if let Some(read) = self.foreign.resolve(self.region.name(), name) {
                    *slot = Resolved::Foreign(read);
                }
            }
        }

        let mut deps = Vec::new();
        let mut foreign = Vec::new();
        for slot in &resolved {
            match slot {
                Resolved::Local { definer, .. } if !deps.contains(definer) => deps.push(*definer),
                Resolved::Foreign(read) => {
                    let seen = (read.document.clone(), read.version);
                    if !foreign.contains(&seen) {
                        foreign.push(seen);
                    }
                }
                _ => {}
            }
        }

        let seen_at = self.evaluated_at.get(&id).copied().unwrap_or(0);
        let stale = matches!(
            element.state,
            EvalState::Dirty | EvalState::Pending(_) | EvalState::Waiting(_)
        ) || deps != element.deps
            || foreign != element.foreign
            || deps.iter().any(|dep| {
                self.changed_at
                    .get(dep)
                    .is_some_and(|&at| at > seen_at || (*dep == id && at >= seen_at && at > 0))
            });
        if !stale {
            return Ok(Visit::Unchanged);
        }

        let state = self.evaluate(element.payload.as_ref(), &refs, resolved);
        let serialized = state.value().map(|v| v.serialize());
        // A definer going from waiting to failed publishes no value either
        // way, but its dependents must still hear about it.
        let changed = serialized != element.serialized || transitioned(&element.state, &state);
        let value = state.value().cloned();
        let rebind = scope.is_some() && bound.is_some_and(|has| changed || has != value.is_some());

        let tick = self.tick;
        self.tick += 1;
        self.evaluated_at.insert(id, tick);
        self.summary.evaluated += 1;
        log::trace!("evaluated {id:?} `{ident}`: changed={changed}");

        let binding = match scope {
            Some(scope) if rebind => {
                let mut table = self.region.write()?;
                let old = table.set_value(scope, &ident, value)?;
                Some((scope, ident, old))
            }
            _ => None,
        };
        if let Some(element) = self.tree.get_mut(id).and_then(Node::as_element_mut) {
            self.journal.push(JournalEntry {
                id,
                state: std::mem::replace(&mut element.state, state),
                serialized: std::mem::replace(&mut element.serialized, serialized),
                deps: std::mem::replace(&mut element.deps, deps),
                foreign: std::mem::replace(&mut element.foreign, foreign),
                binding,
            });
        }

        if self.cancel.is_cancelled() {
            return Err(PropagateError::Cancelled);
        }
        if changed || rebind {
            self.changed_at.insert(id, tick);
            Ok(Visit::Changed)
        } else {
            Ok(Visit::Unchanged)
        }
    }

    fn evaluate(
        &self,
        payload: Option<&Value>,
        refs: &[QualifiedName],
        resolved: Vec<Resolved>,
    ) -> EvalState {
        let mut missing = Vec::new();
        let mut waiting = Vec::new();
        let mut broken = None;
        let mut env = FxHashMap::default();

        for (name, slot) in refs.iter().zip(resolved) {
            let lookup = match slot {
                Resolved::Local {
                    value: Some(value), ..
                } => Lookup::Value(value),
                Resolved::Local {
                    definer,
                    value: None,
                } => {
                    let failed = self.cycle_members.contains(&definer)
                        || self.tree.element(definer).is_some_and(|e| {
                            matches!(e.state, EvalState::Failed(_) | EvalState::Cycle)
                        });
                    if failed && broken.is_none() {
                        broken = Some(name.clone());
                    }
                    if !waiting.contains(&definer) {
                        waiting.push(definer);
                    }
                    Lookup::Unevaluated
                }
                Resolved::Foreign(read) => match read.lookup {
                    Lookup::Value(value) => Lookup::Value(value),
                    _ => {
                        missing.push(name.clone());
                        Lookup::Missing
                    }
                },
                Resolved::Missing => {
                    missing.push(name.clone());
                    Lookup::Missing
                }
            };
            env.insert(name.clone(), lookup);
        }

        if !missing.is_empty() {
            return EvalState::Pending(missing);
        }
        if let Some(name) = broken {
            return EvalState::Failed(format!("`{name}` has no value"));
        }
        if !waiting.is_empty() {
            return EvalState::Waiting(waiting);
        }
        match payload {
            Some(payload) => match payload.eval(&Prefetched(env)) {
                Ok(value) => EvalState::Ready(value),
                Err(err) => EvalState::Failed(err.to_string()),
            },
            None => EvalState::Failed("element has no value".to_owned()),
        }
    }

    /// First cycle among `within`, searching from each element in order.
    /// Nodes proven acyclic by one search are not searched again.
    fn first_cycle(&self, order: &[NodeId], within: &FxHashSet<NodeId>) -> Option<Vec<NodeId>> {
        let mut done = FxHashSet::default();
        order
            .iter()
            .filter(|id| within.contains(id))
            .find_map(|&start| {
                if done.contains(&start) {
                    return None;
                }
                self.find_cycle(start, within, &mut done)
            })
    }

    /// Depth-first search for a cycle through `start`'s current dependency
    /// edges, restricted to `within`. Finished nodes go into `done`.
    fn find_cycle(
        &self,
        start: NodeId,
        within: &FxHashSet<NodeId>,
        done: &mut FxHashSet<NodeId>,
    ) -> Option<Vec<NodeId>> {
        struct Frame {
            node: NodeId,
            next: usize,
        }

        let mut gray: FxHashSet<NodeId> = FxHashSet::default();
        let mut stack: Vec<Frame> = vec![Frame {
            node: start,
            next: 0,
        }];
        gray.insert(start);

        while let Some(frame) = stack.last_mut() {
            let edges = self
                .tree
                .element(frame.node)
                .map_or(&[][..], |e| e.deps.as_slice());
            let Some(&next) = edges.get(frame.next) else {
                gray.remove(&frame.node);
                done.insert(frame.node);
                stack.pop();
                continue;
            };
            frame.next += 1;
            if !within.contains(&next) || self.cycle_members.contains(&next) || done.contains(&next) {
                continue;
            }
            if gray.contains(&next) {
                let from = stack.iter().position(|f| f.node == next).unwrap_or(0);
                return Some(stack[from..].iter().map(|f| f.node).collect());
            }
            gray.insert(next);
            stack.push(Frame { node: next, next: 0 });
        }
        None
    }

    fn mark_cycle(&mut self, members: Vec<NodeId>) -> Result<(), PropagateError> {
        let names: Vec<String> = members
            .iter()
            .map(|&id| self.tree.qualified_name(id).to_string())
            .collect();
        log::warn!("reference cycle in `{}`: {}", self.region.name(), names.join(" -> "));

        for &id in &members {
            let Some(node) = self.tree.get(id) else {
                continue;
            };
            let scope = node.parent().node();
            let ident = node.ident().to_owned();
            let defines = node.as_element().is_some_and(|e| e.defines());

            let binding = match scope {
                Some(scope) if defines => {
                    let mut table = self.region.write()?;
                    let old = table.set_value(scope, &ident, None)?;
                    Some((scope, ident, old))
                }
                _ => None,
            };
            if let Some(element) = self.tree.get_mut(id).and_then(Node::as_element_mut) {
                self.journal.push(JournalEntry {
                    id,
                    state: std::mem::replace(&mut element.state, EvalState::Cycle),
                    serialized: element.serialized.take(),
                    deps: element.deps.clone(),
                    foreign: element.foreign.clone(),
                    binding,
                });
            }
            self.cycle_members.insert(id);
            self.changed_at.insert(id, self.tick);
        }
        self.tick += 1;
        self.cycles.push(members);

        if self.cancel.is_cancelled() {
            return Err(PropagateError::Cancelled);
        }
        Ok(())
    }

    /// The smallest cycle found, with members sorted by qualified name.
    fn cycle_error(&self) -> Option<CycleError> {
        let smallest = self.cycles.iter().min_by_key(|c| c.len())?;
        let mut members: Vec<QualifiedName> = smallest
            .iter()
            .map(|&id| self.tree.qualified_name(id))
            .collect();
        members.sort();
        Some(CycleError { members })
    }

    /// Undoes every change journaled by this call, newest first.
    fn rollback(&mut self) -> Result<(), Error> {
        let mut table = self.region.write()?;
        while let Some(entry) = self.journal.pop() {
            if let Some((scope, name, value)) = entry.binding {
                // The binding may be gone if its scope was torn down meanwhile.
                table.set_value(scope, &name, value).ok();
            }
            if let Some(element) = self.tree.get_mut(entry.id).and_then(Node::as_element_mut) {
                element.state = entry.state;
                element.serialized = entry.serialized;
                element.deps = entry.deps;
                element.foreign = entry.foreign;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use test_case::test_case;

    use super::*;
    use crate::diff::{diff_tokens, ChangeSet};
    use crate::queue::TokenSequence;
    use crate::token::tests::Lit;
    use crate::token::{Param, SyntaxKind, Token};
    use crate::traits::{EvalError, Evaluable, Span, TypeTag};
    use crate::tree::rebuild;

    /// Sum of a constant and the referenced numbers.
    #[derive(Debug)]
    struct Sum(i64, Vec<&'static str>);

    impl fmt::Display for Sum {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)?;
            for name in &self.1 {
                write!(f, "+{{{name}}}")?;
            }
            Ok(())
        }
    }

    impl Evaluable for Sum {
        fn type_tag(&self) -> TypeTag {
            TypeTag("number")
        }

        fn eval(&self, env: &dyn Environment) -> Result<Value, EvalError> {
            let mut total = self.0;
            for name in &self.1 {
                let name = QualifiedName::parse(name);
                match env.lookup(&name) {
                    Lookup::Value(v) => {
                        let bytes: [u8; 8] = v
                            .serialize()
                            .try_into()
                            .map_err(|_| EvalError::Failed("not a number".into()))?;
                        total += i64::from_le_bytes(bytes);
                    }
                    Lookup::Unevaluated => return Err(EvalError::Unevaluated(name)),
                    Lookup::Missing => return Err(EvalError::Unresolved(name)),
                }
            }
            Ok(Arc::new(Sum(total, Vec::new())))
        }

        fn serialize(&self) -> Vec<u8> {
            let mut out = self.0.to_le_bytes().to_vec();
            for name in &self.1 {
                out.extend_from_slice(name.as_bytes());
                out.push(0);
            }
            out
        }

        fn references(&self) -> Vec<QualifiedName> {
            self.1.iter().map(|n| QualifiedName::parse(n)).collect()
        }
    }

    fn cell(at: usize, name: &'static str, base: i64, refs: &[&'static str]) -> Token {
        Token::new(SyntaxKind::Element, Span::new(at, at + 1)).with_params(vec![
            Param::new("name", Arc::new(Lit(name))),
            Param::new("value", Arc::new(Sum(base, refs.to_vec()))),
        ])
    }

    struct Doc {
        tree: Tree,
        region: Region,
        tokens: TokenSequence,
    }

    impl Doc {
        fn new(tokens: Vec<Token>) -> Self {
            let region = Region::new("Doc");
            let tokens = TokenSequence::from_parts(tokens, 0, Vec::new());
            let tree = {
                let mut table = region.write().unwrap();
                let mut tree = Tree::new("Doc", &mut table);
                let changes = ChangeSet::initial(tokens.len());
                rebuild(&mut tree, &changes, &tokens, &mut table, &PipelineConfig::DEFAULT)
                    .unwrap();
                tree
            };
            Self {
                tree,
                region,
                tokens,
            }
        }

        fn edit(&mut self, tokens: Vec<Token>) {
            let next = TokenSequence::from_parts(tokens, 0, Vec::new());
            let changes = diff_tokens(self.tokens.as_slice(), next.as_slice(), None);
            let mut table = self.region.write().unwrap();
            rebuild(&mut self.tree, &changes, &next, &mut table, &PipelineConfig::DEFAULT)
                .unwrap();
            self.tokens = next;
        }

        fn run(&mut self, config: &PipelineConfig) -> Result<Propagation, PropagateError> {
            propagate(&mut self.tree, &self.region, &(), config, &CancelToken::new())
        }

        fn value(&self, name: &str) -> Option<String> {
            let table = self.region.read().unwrap();
            let binding = table.resolve(self.tree.root(), &QualifiedName::parse(name)).ok()?;
            binding.value.as_ref().map(|v| v.to_string())
        }
    }

    #[test]
    fn test_chain_converges_and_updates() {
        let mut doc = Doc::new(vec![cell(0, "A", 1, &[]), cell(2, "B", 1, &["A"])]);
        doc.run(&PipelineConfig::DEFAULT).unwrap();
        assert_eq!(doc.value("A").as_deref(), Some("1"));
        assert_eq!(doc.value("B").as_deref(), Some("2"));

        doc.edit(vec![cell(0, "A", 5, &[]), cell(2, "B", 1, &["A"])]);
        let summary = doc.run(&PipelineConfig::DEFAULT).unwrap();
        assert_eq!(doc.value("B").as_deref(), Some("6"));
        assert_eq!(summary.changed, 2);
        assert!(doc.tree.converged());
    }

    #[test]
    fn test_forward_reference_settles_in_later_pass() {
        let mut doc = Doc::new(vec![cell(0, "B", 0, &["C"]), cell(2, "C", 3, &[])]);
        let summary = doc.run(&PipelineConfig::DEFAULT).unwrap();
        assert_eq!(doc.value("B").as_deref(), Some("3"));
        assert_eq!(summary.passes, 3);
    }

    #[test]
    fn test_mutual_references_are_a_cycle() {
        let mut doc = Doc::new(vec![
            cell(0, "x", 0, &["y"]),
            cell(2, "y", 0, &["x"]),
            cell(4, "z", 5, &[]),
        ]);
        let err = doc.run(&PipelineConfig::DEFAULT).unwrap_err();
        let PropagateError::Cycle(cycle) = err else {
            panic!("expected a cycle, got {err:?}");
        };
        let members: Vec<String> = cycle.members.iter().map(ToString::to_string).collect();
        assert_eq!(members, ["Doc.x", "Doc.y"]);
        assert_eq!(doc.value("z").as_deref(), Some("5"));
        assert_eq!(doc.value("x"), None);
        assert!(doc.tree.converged());
    }

    #[test]
    fn test_self_reference_toggles_into_cycle() {
        let mut doc = Doc::new(vec![cell(0, "A", 1, &[])]);
        doc.run(&PipelineConfig::DEFAULT).unwrap();
        doc.edit(vec![cell(0, "A", 1, &["A"])]);

        let err = doc.run(&PipelineConfig::DEFAULT).unwrap_err();
        assert!(matches!(&err, PropagateError::Cycle(c) if c.members.len() == 1));
        assert_eq!(doc.value("A"), None);
    }

    #[test]
    fn test_cycle_dependents_fail() {
        let mut doc = Doc::new(vec![
            cell(0, "x", 0, &["y"]),
            cell(2, "y", 0, &["x"]),
            cell(4, "w", 1, &["x"]),
        ]);
        assert!(doc.run(&PipelineConfig::DEFAULT).is_err());
        let w = doc.tree.elements()[2];
        assert!(matches!(
            doc.tree.element(w).map(|e| &e.state),
            Some(EvalState::Failed(_))
        ));
    }

    #[test]
    fn test_missing_name_is_pending() {
        let mut doc = Doc::new(vec![cell(0, "B", 1, &["Nope"])]);
        let summary = doc.run(&PipelineConfig::DEFAULT).unwrap();
        assert_eq!(summary.pending.len(), 1);
        assert_eq!(summary.pending[0].node.to_string(), "Doc.B");
        assert_eq!(summary.pending[0].missing, vec![QualifiedName::parse("Nope")]);
        assert_eq!(doc.value("B"), None);
    }

    #[test]
    fn test_cancel_rolls_back() {
        let mut doc = Doc::new(vec![cell(0, "A", 1, &[]), cell(2, "B", 1, &["A"])]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = propagate(
            &mut doc.tree,
            &doc.region,
            &(),
            &PipelineConfig::DEFAULT,
            &cancel,
        )
        .unwrap_err();
        assert_eq!(err, PropagateError::Cancelled);
        assert_eq!(doc.value("A"), None);
        let a = doc.tree.elements()[0];
        assert!(matches!(
            doc.tree.element(a).map(|e| &e.state),
            Some(EvalState::Dirty)
        ));
    }

    #[test]
    fn test_failure_found_in_a_later_pass_reaches_dependents() {
        // `B` reads `C` before `C` has a value; `C` then fails on a
        // non-number, after `B` was already visited in that pass.
        let word = Token::new(SyntaxKind::Element, Span::new(4, 5)).with_params(vec![
            Param::new("name", Arc::new(Lit("D"))),
            Param::new("value", Arc::new(Lit("word"))),
        ]);
        let mut doc = Doc::new(vec![
            cell(0, "B", 0, &["C"]),
            cell(2, "C", 0, &["D"]),
            word,
        ]);
        doc.run(&PipelineConfig::DEFAULT).unwrap();

        let state = |i: usize| {
            let id = doc.tree.elements()[i];
            doc.tree.element(id).map(|e| e.state.clone())
        };
        assert!(matches!(state(1), Some(EvalState::Failed(_))));
        assert!(matches!(state(0), Some(EvalState::Failed(reason)) if reason == "`C` has no value"));
        assert_eq!(doc.value("B"), None);
    }

    #[test_case(1 ; "one pass")]
    #[test_case(2 ; "two passes")]
    fn test_pass_cap_is_soft(cap: usize) {
        let mut doc = Doc::new(vec![
            cell(0, "A", 0, &["B"]),
            cell(2, "B", 0, &["C"]),
            cell(4, "C", 1, &[]),
        ]);
        let err = doc.run(&PipelineConfig::new().with_max_passes(cap)).unwrap_err();
        assert_eq!(err, PropagateError::IterationCapExceeded { passes: cap });
        assert!(!doc.tree.converged());
        assert_eq!(doc.value("C").as_deref(), Some("1"));
    }
}
