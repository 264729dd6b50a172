//! Arena-backed syntax tree.
//!
//! The tree exclusively owns its nodes. Parent links are arena ids used for
//! scope-chain lookup only, and the root's parent is the explicit
//! [`Parent::Root`] sentinel. Nodes store no spans: a per-token ownership
//! table maps each token index to the node(s) it produced, so an edit that
//! shifts byte offsets never touches nodes outside the change.

mod rebuild;

use core::fmt;

use crate::arena::{Arena, Idx};
use crate::symbols::{QualifiedName, ScopeId, SymbolTable};
use crate::token::{SyntaxKind, Token};
use crate::traits::Value;

pub use rebuild::{rebuild, RebuildReport};

pub type NodeId = Idx<Node>;

/// A node's syntactic parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parent {
    /// No further scope. Only the root has this parent.
    Root,
    Node(NodeId),
}

impl Parent {
    #[inline]
    pub fn node(self) -> Option<NodeId> {
        match self {
            Parent::Root => None,
            Parent::Node(id) => Some(id),
        }
    }
}

/// Matrix dimensions. `cols` is the widest row.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Shape {
    pub rows: usize,
    pub cols: usize,
}

impl Shape {
    #[inline]
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    /// Flat position of `(row, col)`, or `None` outside the shape.
    #[inline]
    pub const fn position(&self, row: usize, col: usize) -> Option<usize> {
        if row < self.rows && col < self.cols {
            Some(row * self.cols + col)
        } else {
            None
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.rows, self.cols)
    }
}

/// Evaluation state of an element.
#[derive(Debug, Clone)]
pub enum EvalState {
    /// Needs evaluation: new, updated, or moved to another scope.
    Dirty,
    /// References no enclosing scope defines.
    Pending(Vec<QualifiedName>),
    /// References are defined but their definers have no value yet.
    Waiting(Vec<NodeId>),
    Ready(Value),
    Failed(String),
    /// Member of a reference cycle.
    Cycle,
}

impl EvalState {
    #[inline]
    pub fn value(&self) -> Option<&Value> {
        match self {
            EvalState::Ready(value) => Some(value),
            _ => None,
        }
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        matches!(self, EvalState::Ready(_))
    }
}

#[derive(Debug)]
pub struct ElementNode {
    pub payload: Option<Value>,
    pub state: EvalState,
    /// Names the payload reads, cached when the payload is set.
    pub(crate) refs: Vec<QualifiedName>,
    /// Serialization of the last value, for change detection.
    pub(crate) serialized: Option<Vec<u8>>,
    /// Whether this node owns its binding. False for embeds and rejected
    /// duplicates.
    pub(crate) defines: bool,
    /// Definers the last evaluation resolved to.
    pub(crate) deps: Vec<NodeId>,
    /// Foreign regions read by the last evaluation, with the versions seen.
    pub(crate) foreign: Vec<(String, u64)>,
}

impl ElementNode {
    pub(crate) fn new(payload: Option<Value>) -> Self {
        let refs = payload.as_ref().map(|p| p.references()).unwrap_or_default();
        Self {
            payload,
            state: EvalState::Dirty,
            refs,
            serialized: None,
            defines: false,
            deps: Vec::new(),
            foreign: Vec::new(),
        }
    }

    pub(crate) fn set_payload(&mut self, payload: Option<Value>) {
        self.refs = payload.as_ref().map(|p| p.references()).unwrap_or_default();
        self.payload = payload;
        self.state = EvalState::Dirty;
    }

    #[inline]
    pub fn references(&self) -> &[QualifiedName] {
        &self.refs
    }

    #[inline]
    pub fn defines(&self) -> bool {
        self.defines
    }

    #[inline]
    pub fn foreign_reads(&self) -> &[(String, u64)] {
        &self.foreign
    }
}

#[derive(Debug, Default)]
pub struct VectorNode {
    pub children: Vec<NodeId>,
}

#[derive(Debug, Default)]
pub struct MatrixNode {
    pub shape: Shape,
    /// Row-major cells; short rows leave `None`.
    pub cells: Vec<Option<NodeId>>,
}

impl MatrixNode {
    pub fn cell(&self, row: usize, col: usize) -> Option<NodeId> {
        let pos = self.shape.position(row, col)?;
        self.cells.get(pos).copied().flatten()
    }

    pub(crate) fn rows(&self) -> Vec<Vec<NodeId>> {
        if self.shape.cols == 0 {
            return vec![Vec::new(); self.shape.rows];
        }
        self.cells
            .chunks(self.shape.cols)
            .map(|row| row.iter().flatten().copied().collect())
            .collect()
    }
}

#[derive(Debug)]
pub enum NodeData {
    Element(ElementNode),
    Vector(VectorNode),
    Matrix(MatrixNode),
}

#[derive(Debug)]
pub struct Node {
    pub(crate) parent: Parent,
    pub(crate) ident: String,
    pub(crate) anonymous: bool,
    pub(crate) kind: SyntaxKind,
    pub(crate) data: NodeData,
}

impl Node {
    #[inline]
    pub fn parent(&self) -> Parent {
        self.parent
    }

    #[inline]
    pub fn ident(&self) -> &str {
        &self.ident
    }

    /// True when the identifier was synthesized from the node's position.
    #[inline]
    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    #[inline]
    pub fn kind(&self) -> SyntaxKind {
        self.kind
    }

    #[inline]
    pub fn data(&self) -> &NodeData {
        &self.data
    }

    #[inline]
    pub fn as_element(&self) -> Option<&ElementNode> {
        match &self.data {
            NodeData::Element(e) => Some(e),
            _ => None,
        }
    }

    #[inline]
    pub(crate) fn as_element_mut(&mut self) -> Option<&mut ElementNode> {
        match &mut self.data {
            NodeData::Element(e) => Some(e),
            _ => None,
        }
    }

    #[inline]
    pub fn is_container(&self) -> bool {
        !matches!(self.data, NodeData::Element(_))
    }
}

/// What a token produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    /// Text tokens produce nothing.
    None,
    /// An element, or the container an opening token starts.
    Node(NodeId),
    /// A table row's cells.
    Row { table: NodeId, cells: Vec<NodeId> },
    /// The container a closing token ends.
    Close(NodeId),
}

#[derive(Debug)]
pub struct Tree {
    pub(crate) nodes: Arena<Node>,
    root: NodeId,
    pub(crate) owners: Vec<Owner>,
    converged: bool,
    /// Elements whose definition was rejected as a duplicate.
    pub(crate) rejected: Vec<NodeId>,
}

impl Tree {
    /// Creates an empty tree whose root is named `name` and opens the root
    /// scope in `symbols`.
    pub fn new(name: impl Into<String>, symbols: &mut SymbolTable) -> Self {
        let name = name.into();
        // The root is a level-zero section.
        let (nodes, root) = Arena::with_first(Node {
            parent: Parent::Root,
            ident: name.clone(),
            anonymous: false,
            kind: SyntaxKind::Heading,
            data: NodeData::Vector(VectorNode::default()),
        });
        symbols.open_scope(root, None, name);
        Self {
            nodes,
            root,
            owners: Vec::new(),
            converged: true,
            rejected: Vec::new(),
        }
    }

    #[inline]
    pub fn root(&self) -> NodeId {
        self.root
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.nodes.get(self.root).map_or("", |n| n.ident.as_str())
    }

    #[inline]
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    #[inline]
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains(id)
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn element(&self, id: NodeId) -> Option<&ElementNode> {
        self.get(id)?.as_element()
    }

    /// What token `index` produced.
    #[inline]
    pub fn owner(&self, index: usize) -> Option<&Owner> {
        self.owners.get(index)
    }

    #[inline]
    pub fn owners(&self) -> &[Owner] {
        &self.owners
    }

    /// False after a propagation ran out of passes.
    #[inline]
    pub fn converged(&self) -> bool {
        self.converged
    }

    #[inline]
    pub(crate) fn set_converged(&mut self, converged: bool) {
        self.converged = converged;
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        match self.get(id).map(|n| &n.data) {
            Some(NodeData::Vector(v)) => &v.children,
            _ => &[],
        }
    }

    pub fn shape(&self, id: NodeId) -> Option<Shape> {
        match &self.get(id)?.data {
            NodeData::Matrix(m) => Some(m.shape),
            _ => None,
        }
    }

    /// Cell `(row, col)` of a matrix. Missing cells of short rows are
    /// `None`, as is anything outside the shape.
    pub fn cell(&self, matrix: NodeId, row: usize, col: usize) -> Option<NodeId> {
        match &self.get(matrix)?.data {
            NodeData::Matrix(m) => m.cell(row, col),
            _ => None,
        }
    }

    /// The scope an element's references resolve from.
    #[inline]
    pub fn scope_of(&self, id: NodeId) -> Option<ScopeId> {
        self.get(id)?.parent.node()
    }

    /// `id` followed by its enclosing containers, ending at the root.
    pub fn ancestors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(Some(id), |&n| self.get(n)?.parent.node())
    }

    /// Whether `a` comes before `b` in document order. A container comes
    /// before everything inside it.
    pub fn precedes(&self, a: NodeId, b: NodeId) -> bool {
        let mut path_a: Vec<NodeId> = self.ancestors(a).collect();
        let mut path_b: Vec<NodeId> = self.ancestors(b).collect();
        path_a.reverse();
        path_b.reverse();
        let shared = path_a.iter().zip(&path_b).take_while(|(x, y)| x == y).count();
        match (path_a.get(shared), path_b.get(shared)) {
            (Some(&x), Some(&y)) => {
                let Some(&parent) = shared.checked_sub(1).and_then(|i| path_a.get(i)) else {
                    return false;
                };
                match (self.position_in(parent, x), self.position_in(parent, y)) {
                    (Some(px), Some(py)) => px < py,
                    _ => false,
                }
            }
            (None, Some(_)) => true,
            _ => false,
        }
    }

    fn position_in(&self, container: NodeId, child: NodeId) -> Option<usize> {
        match &self.get(container)?.data {
            NodeData::Vector(v) => v.children.iter().position(|&c| c == child),
            NodeData::Matrix(m) => m.cells.iter().position(|&c| c == Some(child)),
            NodeData::Element(_) => None,
        }
    }

    /// Fully qualified name of a node.
    pub fn qualified_name(&self, id: NodeId) -> QualifiedName {
        let mut segments: Vec<String> = std::iter::successors(Some(id), |&n| {
            self.get(n).and_then(|node| node.parent.node())
        })
        .filter_map(|n| self.get(n).map(|node| node.ident.clone()))
        .collect();
        segments.reverse();
        QualifiedName::from_segments(segments)
    }

    /// Every element in document order.
    pub fn elements(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        for owner in &self.owners {
            match owner {
                Owner::Node(id) if self.element(*id).is_some() => out.push(*id),
                Owner::Row { cells, .. } => out.extend(cells.iter().copied()),
                _ => {}
            }
        }
        out
    }

    /// Marks every element with foreign reads dirty. Returns how many.
    pub fn invalidate_foreign(&mut self) -> usize {
        let mut count = 0;
        for id in self.elements() {
            if let Some(element) = self.get_mut(id).and_then(Node::as_element_mut) {
                if !element.foreign.is_empty() {
                    element.state = EvalState::Dirty;
                    count += 1;
                }
            }
        }
        count
    }

    /// Tears the tree down together with its scopes.
    pub fn close(self, symbols: &mut SymbolTable) {
        symbols.close_scope(self.root);
    }
}

/// Reads the identifying `name` parameter of a token.
pub(crate) fn token_name(token: &Token) -> Option<String> {
    token.param("name").map(|v| v.to_string())
}

/// The payload of a token, from its `value` parameter.
pub(crate) fn token_payload(token: &Token) -> Option<Value> {
    token.param("value").cloned()
}
