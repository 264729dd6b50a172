//! Incremental tree rebuild from a token change set.
//!
//! Tokens outside every change keep the nodes they produced. Updated tokens
//! keep their node and swap its payload. Inserted and retyped tokens get
//! fresh nodes, deleted ones retire theirs. Container links are then
//! re-derived by walking the interior of the innermost container that
//! encloses every change, and only containers whose child list actually
//! differs are relinked. Nothing is touched until that walk succeeded.

use rustc_hash::{FxHashMap, FxHashSet};

use super::{
    token_name, token_payload, ElementNode, EvalState, MatrixNode, Node, NodeData, NodeId,
    Owner, Parent, Shape, Tree, VectorNode,
};
use crate::config::{PipelineConfig, RecursionGuard};
use crate::diff::{ChangeOp, ChangeSet};
use crate::error::Error;
use crate::queue::TokenSequence;
use crate::symbols::{QualifiedName, SymbolTable};
use crate::token::{SyntaxKind, Token};

/// What a rebuild did to the tree.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RebuildReport {
    pub created: Vec<NodeId>,
    pub removed: Vec<NodeId>,
    /// Nodes whose payload or identifier was replaced in place.
    pub updated: Vec<NodeId>,
    /// Containers whose children changed.
    pub relinked: Vec<NodeId>,
    /// Definitions rejected because the name was already bound.
    pub duplicates: Vec<QualifiedName>,
}

impl RebuildReport {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.removed.is_empty()
            && self.updated.is_empty()
            && self.relinked.is_empty()
    }
}

#[derive(Debug)]
enum Slot {
    Keep(Owner),
    Fresh,
}

/// Applies `changes` to `tree` so that it matches `tokens`, keeping
/// `symbols` in step.
///
/// An empty change set is a no-op. A change set that does not line up with
/// the tree's ownership table is an [`Error::Invariant`].
pub fn rebuild(
    tree: &mut Tree,
    changes: &ChangeSet,
    tokens: &TokenSequence,
    symbols: &mut SymbolTable,
    config: &PipelineConfig,
) -> Result<RebuildReport, Error> {
    if changes.is_empty() {
        if tree.owners.len() != tokens.len() {
            return Err(Error::Invariant(format!(
                "tree owns {} tokens but the sequence has {}",
                tree.owners.len(),
                tokens.len()
            )));
        }
        return Ok(RebuildReport::default());
    }

    let mut rebuild = Rebuild {
        tree,
        symbols,
        report: RebuildReport::default(),
        created: FxHashSet::default(),
        old_idents: FxHashMap::default(),
        old_parents: FxHashMap::default(),
    };
    rebuild.run(changes, tokens.as_slice(), config)?;
    log::debug!(
        "rebuilt `{}`: {} created, {} removed, {} updated, {} relinked",
        rebuild.tree.name(),
        rebuild.report.created.len(),
        rebuild.report.removed.len(),
        rebuild.report.updated.len(),
        rebuild.report.relinked.len()
    );
    Ok(rebuild.report)
}

fn mismatch(what: &str) -> Error {
    Error::Invariant(format!("change set does not match the tree: {what}"))
}

/// Lines a window of the old ownership table up with the new tokens.
///
/// `old` holds the owners from token `base` on, and `new_len` counts the new
/// tokens of the window. Returns one slot per new token, the owners of
/// removed tokens, and the window-relative indices of updated tokens.
fn align(
    old: &[Owner],
    changes: &ChangeSet,
    base: usize,
    new_len: usize,
) -> Result<(Vec<Slot>, Vec<Owner>, Vec<usize>), Error> {
    let old_len = old.len();
    let mut old = old.iter().cloned();
    let mut slots = Vec::with_capacity(new_len);
    let mut retired = Vec::new();
    let mut updated = Vec::new();
    let (mut oi, mut ni) = (0, 0);

    for change in changes {
        let (Some(old_start), Some(new_start)) = (
            change.old.start.checked_sub(base),
            change.new.start.checked_sub(base),
        ) else {
            return Err(mismatch("change before the window"));
        };
        if old_start < oi || new_start < ni {
            return Err(mismatch("changes out of order"));
        }
        let gap = old_start - oi;
        if new_start - ni != gap {
            return Err(mismatch("unchanged runs differ in length"));
        }
        for _ in 0..gap {
            slots.push(Slot::Keep(old.next().ok_or_else(|| mismatch("too few owners"))?));
        }
        match change.op {
            ChangeOp::Update => {
                if change.old.len() != change.new.len() {
                    return Err(mismatch("update changes the token count"));
                }
                updated.extend(new_start..new_start + change.new.len());
                for _ in change.old.clone() {
                    slots.push(Slot::Keep(old.next().ok_or_else(|| mismatch("too few owners"))?));
                }
            }
            ChangeOp::Insert | ChangeOp::Delete | ChangeOp::Retype => {
                for _ in change.old.clone() {
                    retired.push(old.next().ok_or_else(|| mismatch("too few owners"))?);
                }
                slots.extend(change.new.clone().map(|_| Slot::Fresh));
            }
        }
        oi = old_start + change.old.len();
        ni = new_start + change.new.len();
    }

    if old_len < oi || new_len < ni || old_len - oi != new_len - ni {
        return Err(mismatch("trailing runs differ in length"));
    }
    slots.extend(old.map(Slot::Keep));
    Ok((slots, retired, updated))
}

/// The token range a rebuild re-walks: the interior of `container`.
#[derive(Debug, Clone, Copy)]
struct Window {
    container: NodeId,
    /// First interior token; the same index before and after the edit.
    start: usize,
    /// One past the interior in the old tokens.
    old_end: usize,
    /// One past the interior in the new tokens.
    new_end: usize,
}

/// Owners and layout of a walked window, before anything is applied.
struct Structure {
    window: Window,
    retired: Vec<Owner>,
    /// Kept owners of updated tokens, with the token's index.
    updates: Vec<(Owner, usize)>,
    layout: Layout,
}

/// An open container during the walk.
struct Frame {
    id: NodeId,
    opener: SyntaxKind,
    children: Vec<NodeId>,
    rows: Vec<Vec<NodeId>>,
}

impl Frame {
    fn new(id: NodeId, opener: SyntaxKind) -> Self {
        Self {
            id,
            opener,
            children: Vec::new(),
            rows: Vec::new(),
        }
    }

    fn is_matrix(&self) -> bool {
        self.opener == SyntaxKind::TableStart
    }
}

/// Output of the structural walk.
struct Layout {
    owners: Vec<Owner>,
    /// Closed containers, innermost first, the walked container last.
    frames: Vec<Frame>,
    /// Every node with its new parent, in document order.
    placed: Vec<(NodeId, NodeId)>,
}

struct Rebuild<'a> {
    tree: &'a mut Tree,
    symbols: &'a mut SymbolTable,
    report: RebuildReport,
    created: FxHashSet<NodeId>,
    old_idents: FxHashMap<NodeId, String>,
    old_parents: FxHashMap<NodeId, Parent>,
}

impl Rebuild<'_> {
    fn run(
        &mut self,
        changes: &ChangeSet,
        tokens: &[Token],
        config: &PipelineConfig,
    ) -> Result<(), Error> {
        let whole = Window {
            container: self.tree.root(),
            start: 0,
            old_end: self.tree.owners.len(),
            new_end: tokens.len(),
        };
        let structure = match self.window(changes, tokens.len()) {
            Some(window) => match self.structure(changes, tokens, window, config) {
                Ok(structure) => structure,
                Err(err) => {
                    // The edit reshaped the enclosing container itself.
                    log::debug!("window walk of `{}` failed ({err}); walking it all", self.tree.name());
                    self.structure(changes, tokens, whole, config)?
                }
            },
            None => self.structure(changes, tokens, whole, config)?,
        };
        let Structure {
            window,
            retired,
            updates,
            layout,
        } = structure;

        for (owner, index) in &updates {
            if let Some(token) = tokens.get(*index) {
                self.update(owner, token);
            }
        }

        let mut dead_containers = Vec::new();
        for owner in retired {
            match owner {
                Owner::Node(id) => match self.tree.get(id) {
                    Some(node) if node.is_container() => dead_containers.push(id),
                    Some(_) => self.retire_element(id),
                    None => {}
                },
                Owner::Row { cells, .. } => cells.into_iter().for_each(|c| self.retire_element(c)),
                Owner::None | Owner::Close(_) => {}
            }
        }

        drop(
            self.tree
                .owners
                .splice(window.start..window.old_end, layout.owners),
        );

        for &(id, parent) in &layout.placed {
            let Some(node) = self.tree.get_mut(id) else {
                continue;
            };
            let parent = Parent::Node(parent);
            if node.parent != parent {
                let old = std::mem::replace(&mut node.parent, parent);
                if !self.created.contains(&id) {
                    self.old_parents.insert(id, old);
                }
            }
        }

        let mut relinked_containers = Vec::new();
        for frame in &layout.frames {
            if self.relink(frame) {
                relinked_containers.push(frame.id);
            }
        }

        for id in dead_containers {
            self.symbols.drop_scope(id);
            self.tree.nodes.remove(id);
            self.report.removed.push(id);
        }

        self.detach_definitions();
        self.sync_scopes(&layout.placed, &relinked_containers)?;
        self.define(&layout.placed)
    }

    /// Aligns and walks one window without touching the tree. On failure
    /// the nodes the walk allocated are freed again.
    fn structure(
        &mut self,
        changes: &ChangeSet,
        tokens: &[Token],
        window: Window,
        config: &PipelineConfig,
    ) -> Result<Structure, Error> {
        let old = self
            .tree
            .owners
            .get(window.start..window.old_end)
            .ok_or_else(|| mismatch("window outside the old tokens"))?;
        let new = tokens
            .get(window.start..window.new_end)
            .ok_or_else(|| mismatch("window outside the new tokens"))?;
        let (slots, retired, updated) = align(old, changes, window.start, new.len())?;
        let updates = updated
            .into_iter()
            .filter_map(|index| match slots.get(index) {
                Some(Slot::Keep(owner)) => Some((owner.clone(), window.start + index)),
                _ => None,
            })
            .collect();
        match self.walk(new, slots, window.container, config) {
            Ok(layout) => Ok(Structure {
                window,
                retired,
                updates,
                layout,
            }),
            Err(err) => {
                for id in self.created.drain() {
                    self.tree.nodes.remove(id);
                }
                self.report.created.clear();
                Err(err)
            }
        }
    }

    /// The interior of the innermost container whose opener and closer both
    /// lie outside every change. `None` when that is the root.
    fn window(&self, changes: &ChangeSet, new_len: usize) -> Option<Window> {
        let root = self.tree.root();
        let (first, last) = (changes.as_slice().first()?, changes.as_slice().last()?);
        let old_len = self.tree.owners.len();
        let (start, end) = (first.old.start, last.old.end);
        if end > old_len {
            return None;
        }

        // An opener right before the changes or a closer right after them
        // bounds its own interior.
        let before = match start.checked_sub(1) {
            Some(index) => match self.tree.owners.get(index)? {
                Owner::Node(id) if self.tree.get(*id)?.is_container() => *id,
                _ => self.enclosing(index)?,
            },
            None => root,
        };
        let after = match self.tree.owners.get(end) {
            Some(Owner::Close(id)) => *id,
            Some(_) => self.enclosing(end)?,
            None => root,
        };
        let container = self.common_ancestor(before, after)?;
        if container == root {
            return None;
        }

        let opener = self
            .tree
            .owners
            .get(..start)?
            .iter()
            .rposition(|o| *o == Owner::Node(container))?;
        let closer = self
            .tree
            .owners
            .get(end..)?
            .iter()
            .position(|o| *o == Owner::Close(container))?;
        let old_end = end + closer;
        Some(Window {
            container,
            start: opener + 1,
            old_end,
            new_end: new_len.checked_sub(old_len - old_end)?,
        })
    }

    /// The container whose interior holds old token `index`.
    fn enclosing(&self, index: usize) -> Option<NodeId> {
        let parent = |id: NodeId| {
            let node = self.tree.get(id)?;
            Some(node.parent.node().unwrap_or(self.tree.root()))
        };
        match self.tree.owners.get(index)? {
            Owner::Node(id) | Owner::Close(id) => return parent(*id),
            Owner::Row { table, .. } => return Some(*table),
            Owner::None => {}
        }
        // Text belongs to whatever the nearest owned token before it left open.
        for owner in self.tree.owners.get(..index)?.iter().rev() {
            match owner {
                Owner::None => {}
                Owner::Node(id) if self.tree.get(*id)?.is_container() => return Some(*id),
                Owner::Node(id) | Owner::Close(id) => return parent(*id),
                Owner::Row { table, .. } => return Some(*table),
            }
        }
        Some(self.tree.root())
    }

    fn common_ancestor(&self, a: NodeId, b: NodeId) -> Option<NodeId> {
        let chain: FxHashSet<NodeId> = self.tree.ancestors(a).collect();
        self.tree.ancestors(b).find(|n| chain.contains(n))
    }

    fn update(&mut self, owner: &Owner, token: &Token) {
        match owner {
            Owner::Node(id) => {
                let Some(node) = self.tree.get_mut(*id) else {
                    return;
                };
                if let Some(name) = token_name(token) {
                    if name != node.ident {
                        let old = std::mem::replace(&mut node.ident, name);
                        self.old_idents.entry(*id).or_insert(old);
                    }
                }
                if let Some(element) = node.as_element_mut() {
                    element.set_payload(token_payload(token));
                }
                self.report.updated.push(*id);
            }
            Owner::Row { cells, .. } => {
                for (cell, param) in cells.iter().zip(token.params()) {
                    let element = self.tree.get_mut(*cell).and_then(Node::as_element_mut);
                    if let Some(element) = element {
                        element.set_payload(Some(param.value.clone()));
                        self.report.updated.push(*cell);
                    }
                }
            }
            Owner::None | Owner::Close(_) => {}
        }
    }

    fn retire_element(&mut self, id: NodeId) {
        let Some(node) = self.tree.nodes.remove(id) else {
            return;
        };
        if let (Some(scope), Some(element)) = (node.parent.node(), node.as_element()) {
            if element.defines {
                self.symbols.undefine_if(scope, &node.ident, id);
            }
        }
        self.tree.rejected.retain(|&r| r != id);
        self.report.removed.push(id);
    }

    fn create(&mut self, token: &Token) -> Result<NodeId, Error> {
        let name = token_name(token);
        let data = match token.kind {
            SyntaxKind::Heading | SyntaxKind::ListStart => NodeData::Vector(VectorNode::default()),
            SyntaxKind::TableStart => NodeData::Matrix(MatrixNode::default()),
            _ => NodeData::Element(ElementNode::new(token_payload(token))),
        };
        let id = self.tree.nodes.alloc(Node {
            parent: Parent::Root,
            anonymous: name.is_none(),
            ident: name.unwrap_or_default(),
            kind: token.kind,
            data,
        })?;
        self.created.insert(id);
        self.report.created.push(id);
        Ok(id)
    }

    fn create_cells(&mut self, token: &Token) -> Result<Vec<NodeId>, Error> {
        let values: Vec<_> = token.params().iter().map(|p| p.value.clone()).collect();
        values
            .into_iter()
            .map(|value| {
                let id = self.tree.nodes.alloc(Node {
                    parent: Parent::Root,
                    ident: String::new(),
                    anonymous: true,
                    kind: token.kind,
                    data: NodeData::Element(ElementNode::new(Some(value))),
                })?;
                self.created.insert(id);
                self.report.created.push(id);
                Ok(id)
            })
            .collect()
    }

    /// Re-derives ownership and container membership from the new tokens.
    ///
    /// `tokens` is the interior of `base`, which stays open throughout.
    fn walk(
        &mut self,
        tokens: &[Token],
        slots: Vec<Slot>,
        base: NodeId,
        config: &PipelineConfig,
    ) -> Result<Layout, Error> {
        let opener = self
            .tree
            .get(base)
            .map(Node::kind)
            .ok_or_else(|| mismatch("window container is gone"))?;
        let mut stack = vec![Frame::new(base, opener)];
        let mut layout = Layout {
            owners: Vec::with_capacity(tokens.len()),
            frames: Vec::new(),
            placed: Vec::new(),
        };
        let mut nesting = RecursionGuard::for_config(config);
        for _ in self.tree.ancestors(base).skip(1) {
            nesting.enter()?;
        }

        for (index, (token, slot)) in tokens.iter().zip(slots).enumerate() {
            let kind = token.kind;
            if kind == SyntaxKind::Text {
                layout.owners.push(Owner::None);
                continue;
            }

            if kind.is_close() {
                if stack.len() < 2 {
                    return Err(Error::Invariant(format!(
                        "token {index}: {kind} closes the walked container"
                    )));
                }
                let Some(frame) = stack.pop() else {
                    break;
                };
                if frame.opener.closer() != Some(kind) {
                    return Err(Error::Invariant(format!(
                        "token {index}: {kind} closes a {}",
                        frame.opener
                    )));
                }
                nesting.leave();
                layout.owners.push(Owner::Close(frame.id));
                layout.frames.push(frame);
                continue;
            }

            let in_matrix = stack.last().is_some_and(Frame::is_matrix);
            if kind == SyntaxKind::TableRow {
                if !in_matrix {
                    return Err(Error::Invariant(format!("token {index}: row outside a table")));
                }
                let cells = match slot {
                    Slot::Keep(Owner::Row { cells, .. }) => cells,
                    Slot::Fresh => self.create_cells(token)?,
                    Slot::Keep(other) => {
                        return Err(Error::Invariant(format!(
                            "token {index}: row kept as {other:?}"
                        )));
                    }
                };
                let Some(top) = stack.last_mut() else {
                    break;
                };
                layout.placed.extend(cells.iter().map(|&c| (c, top.id)));
                top.rows.push(cells.clone());
                layout.owners.push(Owner::Row {
                    table: top.id,
                    cells,
                });
                continue;
            }
            if in_matrix {
                return Err(Error::Invariant(format!("token {index}: {kind} inside a table")));
            }

            let id = match slot {
                Slot::Keep(Owner::Node(id)) if self.tree.contains(id) => id,
                Slot::Fresh => self.create(token)?,
                Slot::Keep(other) => {
                    return Err(Error::Invariant(format!(
                        "token {index}: {kind} kept as {other:?}"
                    )));
                }
            };
            let Some(top) = stack.last_mut() else {
                break;
            };
            layout.placed.push((id, top.id));
            top.children.push(id);
            layout.owners.push(Owner::Node(id));
            if kind.is_open() {
                nesting.enter()?;
                stack.push(Frame::new(id, kind));
            }
        }

        if stack.len() != 1 {
            return Err(Error::Invariant(format!(
                "{} containers left open",
                stack.len().saturating_sub(1)
            )));
        }
        layout.frames.extend(stack.pop());
        Ok(layout)
    }

    /// Installs a frame's children on its container. Returns whether they
    /// changed.
    fn relink(&mut self, frame: &Frame) -> bool {
        let Some(node) = self.tree.get_mut(frame.id) else {
            return false;
        };
        let positional: Vec<(NodeId, String)> = match &mut node.data {
            NodeData::Vector(vector) => {
                if vector.children == frame.children {
                    return false;
                }
                vector.children = frame.children.clone();
                frame
                    .children
                    .iter()
                    .enumerate()
                    .map(|(pos, &child)| (child, pos.to_string()))
                    .collect()
            }
            NodeData::Matrix(matrix) => {
                if matrix.rows() == frame.rows {
                    return false;
                }
                let cols = frame.rows.iter().map(Vec::len).max().unwrap_or(0);
                matrix.shape = Shape::new(frame.rows.len(), cols);
                matrix.cells = frame
                    .rows
                    .iter()
                    .flat_map(|row| (0..cols).map(move |c| row.get(c).copied()))
                    .collect();
                frame
                    .rows
                    .iter()
                    .enumerate()
                    .flat_map(|(r, row)| {
                        row.iter()
                            .enumerate()
                            .map(move |(c, &cell)| (cell, format!("r{r}c{c}")))
                    })
                    .collect()
            }
            NodeData::Element(_) => return false,
        };
        self.report.relinked.push(frame.id);

        for (child, ident) in positional {
            let Some(node) = self.tree.get_mut(child) else {
                continue;
            };
            if node.anonymous && node.ident != ident {
                let old = std::mem::replace(&mut node.ident, ident);
                if !self.created.contains(&child) {
                    self.old_idents.entry(child).or_insert(old);
                }
            }
        }
        true
    }

    /// Drops the bindings of surviving elements that moved or were renamed.
    fn detach_definitions(&mut self) {
        let touched: FxHashSet<NodeId> = self
            .old_idents
            .keys()
            .chain(self.old_parents.keys())
            .copied()
            .collect();
        for id in touched {
            let Some(node) = self.tree.get(id) else {
                continue;
            };
            let Some(defines) = node.as_element().map(|e| e.defines) else {
                continue;
            };
            if defines {
                let old_scope = self.old_parents.get(&id).copied().unwrap_or(node.parent);
                let old_name = self.old_idents.get(&id).unwrap_or(&node.ident);
                if let Some(scope) = old_scope.node() {
                    self.symbols.undefine_if(scope, old_name, id);
                }
            }
            if let Some(element) = self.tree.get_mut(id).and_then(Node::as_element_mut) {
                element.defines = false;
                element.state = EvalState::Dirty;
            }
        }
    }

    /// Opens scopes for new containers and moves or renames surviving ones.
    ///
    /// Child scopes are re-registered on every relinked container and on
    /// the parent of every renamed one, so a sibling that shares a name
    /// with a renamed scope becomes reachable again.
    fn sync_scopes(
        &mut self,
        placed: &[(NodeId, NodeId)],
        relinked: &[NodeId],
    ) -> Result<(), Error> {
        let mut affected: Vec<NodeId> = relinked.to_vec();
        for &(id, parent) in placed {
            let Some(node) = self.tree.get(id) else {
                continue;
            };
            if !node.is_container() {
                continue;
            }
            if self.created.contains(&id) {
                self.symbols.open_scope(id, Some(parent), node.ident.clone());
                continue;
            }
            if self.old_parents.contains_key(&id) {
                self.symbols.reparent_scope(id, parent)?;
            }
            if self.old_idents.contains_key(&id) {
                self.symbols.rename_scope(id, node.ident.clone())?;
                if !affected.contains(&parent) {
                    affected.push(parent);
                }
            }
        }

        for container in affected {
            let scopes: Vec<(String, NodeId)> = self
                .tree
                .children(container)
                .iter()
                .filter_map(|&child| {
                    let node = self.tree.get(child)?;
                    node.is_container().then(|| (node.ident.clone(), child))
                })
                .collect();
            self.symbols.set_child_scopes(container, scopes);
        }
        Ok(())
    }

    /// Binds new, moved, renamed and previously rejected elements. When two
    /// elements claim a name, the one earlier in the document holds it and
    /// the other is rejected, even if the later one was bound first.
    fn define(&mut self, placed: &[(NodeId, NodeId)]) -> Result<(), Error> {
        let mut candidates: FxHashSet<NodeId> = self.created.iter().copied().collect();
        candidates.extend(self.old_idents.keys().copied());
        candidates.extend(self.old_parents.keys().copied());
        let retry = std::mem::take(&mut self.tree.rejected);
        candidates.extend(retry.iter().copied());

        let walked: FxHashSet<NodeId> = placed.iter().map(|&(id, _)| id).collect();
        let mut queue: Vec<(NodeId, NodeId)> = placed
            .iter()
            .copied()
            .filter(|(id, _)| candidates.contains(id))
            .collect();
        // Rejected elements outside the walked window keep their scope.
        queue.extend(retry.iter().filter(|id| !walked.contains(id)).filter_map(|&id| {
            let scope = self.tree.get(id)?.parent.node()?;
            Some((id, scope))
        }));

        let mut rejected = Vec::new();
        for (id, scope) in queue {
            let Some(node) = self.tree.get(id) else {
                continue;
            };
            if node.kind == SyntaxKind::Embed || node.as_element().is_none_or(|e| e.defines) {
                continue;
            }
            let ident = node.ident.clone();
            match self.symbols.define(scope, &ident, id) {
                Ok(()) => self.bind(id),
                Err(Error::DuplicateDefinition { scope: path, name }) => {
                    let holder = self.symbols.get(scope, &ident).map(|b| b.definer);
                    let loser = match holder {
                        Some(holder) if self.tree.precedes(id, holder) => {
                            self.symbols.undefine_if(scope, &ident, holder);
                            self.symbols.define(scope, &ident, id)?;
                            self.bind(id);
                            // Dependents see a new definer and re-evaluate.
                            if let Some(element) =
                                self.tree.get_mut(holder).and_then(Node::as_element_mut)
                            {
                                element.defines = false;
                                element.state = EvalState::Dirty;
                            }
                            holder
                        }
                        _ => id,
                    };
                    let qualified = path.child(name);
                    log::warn!("duplicate definition of `{qualified}`; keeping the earlier one");
                    if !rejected.contains(&loser) {
                        rejected.push(loser);
                    }
                    self.report.duplicates.push(qualified);
                }
                Err(err) => return Err(err),
            }
        }
        self.tree.rejected = rejected;
        Ok(())
    }

    /// A fresh binding holds no value until the next evaluation publishes
    /// one.
    fn bind(&mut self, id: NodeId) {
        if let Some(element) = self.tree.get_mut(id).and_then(Node::as_element_mut) {
            element.defines = true;
            element.state = EvalState::Dirty;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::diff::diff_tokens;
    use crate::token::tests::{element, Lit};
    use crate::token::Param;
    use crate::traits::Span;

    fn heading(start: usize, end: usize, name: &'static str) -> Token {
        Token::new(SyntaxKind::Heading, Span::new(start, end))
            .with_level(1)
            .with_params(vec![Param::new("name", Arc::new(Lit(name)))])
    }

    fn section_end(at: usize) -> Token {
        Token::new(SyntaxKind::SectionEnd, Span::empty(at)).with_level(1)
    }

    fn seq(tokens: Vec<Token>) -> TokenSequence {
        TokenSequence::from_parts(tokens, 0, Vec::new())
    }

    struct Fixture {
        tree: Tree,
        symbols: SymbolTable,
        tokens: TokenSequence,
    }

    impl Fixture {
        fn new(tokens: Vec<Token>) -> Self {
            let mut symbols = SymbolTable::new();
            let mut tree = Tree::new("Doc", &mut symbols);
            let tokens = seq(tokens);
            let changes = ChangeSet::initial(tokens.len());
            rebuild(&mut tree, &changes, &tokens, &mut symbols, &PipelineConfig::DEFAULT)
                .unwrap();
            Self {
                tree,
                symbols,
                tokens,
            }
        }

        fn apply(&mut self, tokens: Vec<Token>) -> RebuildReport {
            let next = seq(tokens);
            let changes = diff_tokens(self.tokens.as_slice(), next.as_slice(), None);
            let report = rebuild(
                &mut self.tree,
                &changes,
                &next,
                &mut self.symbols,
                &PipelineConfig::DEFAULT,
            )
            .unwrap();
            self.tokens = next;
            report
        }

        fn resolve(&self, name: &str) -> Option<NodeId> {
            self.symbols
                .resolve(self.tree.root(), &QualifiedName::parse(name))
                .ok()
                .map(|b| b.definer)
        }
    }

    #[test]
    fn test_initial_build_defines_elements() {
        let fx = Fixture::new(vec![
            element(0, 4, "A", "1"),
            heading(5, 10, "Sec"),
            element(11, 15, "x", "2"),
            section_end(15),
        ]);
        assert_eq!(fx.tree.owners().len(), 4);
        let a = fx.resolve("A").unwrap();
        let x = fx.resolve("Sec.x").unwrap();
        assert_eq!(fx.tree.qualified_name(x).to_string(), "Doc.Sec.x");
        assert_eq!(fx.tree.qualified_name(a).to_string(), "Doc.A");
        assert_eq!(fx.tree.elements(), vec![a, x]);
    }

    #[test]
    fn test_update_keeps_node_identity() {
        let mut fx = Fixture::new(vec![element(0, 4, "A", "1"), element(5, 9, "B", "2")]);
        let b = fx.resolve("B").unwrap();
        let report = fx.apply(vec![element(0, 4, "A", "1"), element(5, 9, "B", "3")]);

        assert_eq!(report.updated, vec![b]);
        assert!(report.created.is_empty());
        assert!(report.removed.is_empty());
        assert_eq!(fx.resolve("B"), Some(b));
        let payload = fx.tree.element(b).and_then(|e| e.payload.as_ref()).unwrap();
        assert_eq!(payload.to_string(), "3");
    }

    #[test]
    fn test_rename_moves_binding() {
        let mut fx = Fixture::new(vec![element(0, 4, "A", "1")]);
        let a = fx.resolve("A").unwrap();
        fx.apply(vec![element(0, 4, "Z", "1")]);
        assert_eq!(fx.resolve("A"), None);
        assert_eq!(fx.resolve("Z"), Some(a));
    }

    #[test]
    fn test_insert_shifts_without_touching_suffix() {
        let mut fx = Fixture::new(vec![element(0, 4, "A", "1"), element(5, 9, "B", "2")]);
        let b = fx.resolve("B").unwrap();
        let report = fx.apply(vec![
            element(0, 4, "A", "1"),
            element(5, 9, "C", "7"),
            element(10, 14, "B", "2"),
        ]);
        assert_eq!(report.created.len(), 1);
        assert!(report.updated.is_empty());
        assert_eq!(fx.resolve("B"), Some(b));
        assert_eq!(report.relinked, vec![fx.tree.root()]);
    }

    #[test]
    fn test_duplicate_rejected_then_promoted() {
        let mut fx = Fixture::new(vec![element(0, 4, "A", "1"), element(5, 9, "A", "2")]);
        let first = fx.resolve("A").unwrap();
        assert_eq!(fx.tree.rejected.len(), 1);
        let second = fx.tree.rejected[0];
        assert_ne!(first, second);

        let report = fx.apply(vec![element(5, 9, "A", "2")]);
        assert_eq!(report.removed, vec![first]);
        assert_eq!(fx.resolve("A"), Some(second));
        assert!(fx.tree.rejected.is_empty());
    }

    #[test]
    fn test_removed_section_drops_scope() {
        let mut fx = Fixture::new(vec![
            heading(0, 5, "Sec"),
            element(6, 10, "x", "2"),
            section_end(10),
        ]);
        assert_eq!(fx.symbols.scope_count(), 2);
        let report = fx.apply(vec![element(6, 10, "x", "2")]);

        assert_eq!(fx.symbols.scope_count(), 1);
        assert_eq!(report.removed.len(), 1);
        assert!(fx.resolve("Sec.x").is_none());
        assert!(fx.resolve("x").is_some());
    }

    #[test]
    fn test_table_shape_and_cells() {
        let row = |start: usize, cells: &[&'static str]| {
            Token::new(SyntaxKind::TableRow, Span::new(start, start + 4)).with_params(
                cells
                    .iter()
                    .map(|&c| Param::new("cell", Arc::new(Lit(c))))
                    .collect(),
            )
        };
        let fx = Fixture::new(vec![
            Token::new(SyntaxKind::TableStart, Span::empty(0)),
            row(0, &["a", "b", "c"]),
            row(5, &["d", "e"]),
            Token::new(SyntaxKind::TableEnd, Span::empty(9)),
        ]);
        let table = fx.tree.children(fx.tree.root())[0];
        assert_eq!(fx.tree.shape(table), Some(Shape::new(2, 3)));
        assert!(fx.tree.cell(table, 1, 2).is_none());
        let cell = fx.tree.cell(table, 1, 1).unwrap();
        let payload = fx.tree.element(cell).and_then(|e| e.payload.as_ref()).unwrap();
        assert_eq!(payload.to_string(), "e");
        assert_eq!(fx.tree.get(cell).map(Node::ident), Some("r1c1"));
        assert_eq!(fx.tree.get(table).map(Node::ident), Some("0"));
    }

    #[test]
    fn test_earlier_duplicate_takes_the_name() {
        let mut fx = Fixture::new(vec![element(0, 4, "A", "7")]);
        let late = fx.resolve("A").unwrap();
        let report = fx.apply(vec![element(0, 4, "A", "1"), element(5, 9, "A", "7")]);

        let early = fx.resolve("A").unwrap();
        assert_ne!(early, late);
        let payload = fx.tree.element(early).and_then(|e| e.payload.as_ref()).unwrap();
        assert_eq!(payload.to_string(), "1");
        assert_eq!(fx.tree.rejected, vec![late]);
        assert_eq!(fx.tree.element(late).map(ElementNode::defines), Some(false));
        assert_eq!(report.duplicates, vec![QualifiedName::parse("Doc.A")]);
    }

    #[test]
    fn test_window_is_innermost_enclosing_container() {
        let mut fx = Fixture::new(vec![
            element(0, 4, "A", "1"),
            heading(5, 10, "Sec"),
            element(11, 15, "x", "2"),
            section_end(15),
            element(16, 20, "B", "3"),
        ]);
        let sec = fx.tree.children(fx.tree.root())[1];
        let b = fx.resolve("B").unwrap();
        let next = seq(vec![
            element(0, 4, "A", "1"),
            heading(5, 10, "Sec"),
            element(11, 15, "x", "2"),
            element(16, 20, "y", "4"),
            section_end(20),
            element(21, 25, "B", "3"),
        ]);
        let changes = diff_tokens(fx.tokens.as_slice(), next.as_slice(), None);
        let rebuild = Rebuild {
            tree: &mut fx.tree,
            symbols: &mut fx.symbols,
            report: RebuildReport::default(),
            created: FxHashSet::default(),
            old_idents: FxHashMap::default(),
            old_parents: FxHashMap::default(),
        };
        let window = rebuild.window(&changes, next.len()).unwrap();
        assert_eq!(window.container, sec);
        assert_eq!((window.start, window.old_end, window.new_end), (2, 3, 4));

        let report = fx.apply(next.as_slice().to_vec());
        assert_eq!(report.relinked, vec![sec]);
        assert_eq!(fx.tree.owners().len(), 6);
        assert_eq!(fx.tree.owners()[5], Owner::Node(b));
        assert_eq!(fx.tree.owners()[4], Owner::Close(sec));
        assert_eq!(fx.resolve("B"), Some(b));
        assert!(fx.resolve("Sec.y").is_some());
    }

    #[test]
    fn test_edit_at_top_level_walks_everything() {
        let mut fx = Fixture::new(vec![element(0, 4, "A", "1"), element(5, 9, "B", "2")]);
        let next = seq(vec![
            element(0, 4, "A", "1"),
            element(5, 9, "C", "3"),
            element(10, 14, "B", "2"),
        ]);
        let changes = diff_tokens(fx.tokens.as_slice(), next.as_slice(), None);
        let rebuild = Rebuild {
            tree: &mut fx.tree,
            symbols: &mut fx.symbols,
            report: RebuildReport::default(),
            created: FxHashSet::default(),
            old_idents: FxHashMap::default(),
            old_parents: FxHashMap::default(),
        };
        assert!(rebuild.window(&changes, next.len()).is_none());
    }

    #[test]
    fn test_failed_walk_leaves_tree_intact() {
        let mut fx = Fixture::new(vec![
            heading(0, 5, "Sec"),
            element(6, 10, "x", "2"),
            section_end(10),
        ]);
        let owners = fx.tree.owners().to_vec();
        let nodes = fx.tree.node_count();
        // One closer too many.
        let broken = seq(vec![
            heading(0, 5, "Sec"),
            element(6, 10, "x", "2"),
            element(11, 15, "y", "3"),
            section_end(15),
            section_end(15),
        ]);
        let changes = diff_tokens(fx.tokens.as_slice(), broken.as_slice(), None);
        let err = rebuild(
            &mut fx.tree,
            &changes,
            &broken,
            &mut fx.symbols,
            &PipelineConfig::DEFAULT,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
        assert_eq!(fx.tree.owners(), owners.as_slice());
        assert_eq!(fx.tree.node_count(), nodes);
        assert!(fx.resolve("Sec.y").is_none());

        fx.apply(vec![
            heading(0, 5, "Sec"),
            element(6, 10, "x", "2"),
            element(11, 15, "y", "3"),
            section_end(15),
        ]);
        assert!(fx.resolve("Sec.x").is_some());
        assert!(fx.resolve("Sec.y").is_some());
    }

    #[test]
    fn test_nesting_limit_leaves_tree_intact() {
        let config = PipelineConfig::new().with_max_recursion_depth(1);
        let mut symbols = SymbolTable::new();
        let mut tree = Tree::new("Doc", &mut symbols);
        let tokens = seq(vec![heading(0, 5, "Sec"), section_end(5)]);
        rebuild(&mut tree, &ChangeSet::initial(2), &tokens, &mut symbols, &config).unwrap();

        let nested = seq(vec![
            heading(0, 5, "Sec"),
            heading(6, 11, "Sub"),
            section_end(11),
            section_end(11),
        ]);
        let changes = diff_tokens(tokens.as_slice(), nested.as_slice(), None);
        let err = rebuild(&mut tree, &changes, &nested, &mut symbols, &config).unwrap_err();
        assert_eq!(err, Error::RecursionLimitExceeded { depth: 2, limit: 1 });
        assert_eq!(tree.owners().len(), 2);
        assert_eq!(tree.node_count(), 2);
        assert_eq!(symbols.scope_count(), 2);
    }

    #[test]
    fn test_misaligned_change_set_is_invariant_error() {
        let mut fx = Fixture::new(vec![element(0, 4, "A", "1")]);
        let bogus = ChangeSet::initial(3);
        let next = seq(vec![element(0, 4, "A", "1"), element(5, 9, "B", "2")]);
        let err = rebuild(
            &mut fx.tree,
            &bogus,
            &next,
            &mut fx.symbols,
            &PipelineConfig::DEFAULT,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
        assert_eq!(fx.tree.owners().len(), 1);
        assert!(fx.resolve("A").is_some());
    }
}
