use std::collections::BTreeSet;

use crate::graph::NodeId;
use crate::value::Value;

/// Role of a node, with an index into the graph's distribution or function table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Constant,
    Stochastic(usize),
    Deterministic(usize),
}

/// Sub-elements of a node's value touched during the current episode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TouchedElements {
    All,
    Some(BTreeSet<usize>),
}

impl TouchedElements {
    fn add(&mut self, elements: Option<&[usize]>) {
        match (self, elements) {
            (TouchedElements::All, _) => {}
            (this, None) => *this = TouchedElements::All,
            (TouchedElements::Some(set), Some(elements)) => set.extend(elements.iter().copied()),
        }
    }

    /// `None` when the whole value was touched.
    pub fn to_vec(&self) -> Option<Vec<usize>> {
        match self {
            TouchedElements::All => None,
            TouchedElements::Some(set) => Some(set.iter().copied().collect()),
        }
    }
}

/// A vertex of the model graph.
///
/// Holds the realized value, the cached log-probability for stochastic
/// nodes, and the snapshot taken at the first touch of an episode. The
/// traversal logic lives in [`crate::graph::Graph`]; this type only knows how
/// to snapshot, commit and roll back its own state.
#[derive(Debug, Clone)]
pub struct DagNode {
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    pub(crate) value: Value,
    pub(crate) parents: Vec<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) clamped: bool,
    pub(crate) touched: bool,
    pub(crate) dirty: bool,
    pub(crate) ln_prob: f64,
    pub(crate) touched_elements: TouchedElements,
    stored_value: Option<Value>,
    stored_ln_prob: f64,
    stored_dirty: bool,
}

impl DagNode {
    pub(crate) fn new(name: &str, kind: NodeKind, value: Value, parents: Vec<NodeId>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            value,
            parents,
            children: Vec::new(),
            clamped: false,
            touched: false,
            dirty: false,
            ln_prob: 0.0,
            touched_elements: TouchedElements::Some(BTreeSet::new()),
            stored_value: None,
            stored_ln_prob: 0.0,
            stored_dirty: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn parents(&self) -> &[NodeId] {
        &self.parents
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn is_stochastic(&self) -> bool {
        matches!(self.kind, NodeKind::Stochastic(_))
    }

    pub fn is_deterministic(&self) -> bool {
        matches!(self.kind, NodeKind::Deterministic(_))
    }

    pub fn is_clamped(&self) -> bool {
        self.clamped
    }

    pub fn is_touched(&self) -> bool {
        self.touched
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Value as of the start of the open episode.
    pub fn stored_value(&self) -> Option<&Value> {
        self.stored_value.as_ref()
    }

    /// Slots in which `parent` feeds this node.
    pub(crate) fn slots_of(&self, parent: NodeId) -> Vec<usize> {
        self.parents
            .iter()
            .enumerate()
            .filter(|(_, &p)| p == parent)
            .map(|(slot, _)| slot)
            .collect()
    }

    /// Mark stale and, on the first touch of an episode, snapshot the
    /// current state. Returns `(first_touch, was_clean)`.
    pub(crate) fn begin_touch(&mut self, elements: Option<&[usize]>) -> (bool, bool) {
        let first = !self.touched;
        if first {
            self.stored_value = Some(self.value.clone());
            self.stored_ln_prob = self.ln_prob;
            self.stored_dirty = self.dirty;
            self.touched = true;
            self.touched_elements = TouchedElements::Some(BTreeSet::new());
        }
        self.touched_elements.add(elements);
        let was_clean = !self.dirty;
        self.dirty = true;
        (first, was_clean)
    }

    /// Drop the snapshot. The caller has already brought the caches up to date.
    pub(crate) fn commit(&mut self) {
        assert!(self.touched, "keep called on untouched node '{}'", self.name);
        assert!(!self.dirty, "node '{}' committed with a stale cache", self.name);
        self.stored_value = None;
        self.touched = false;
        self.touched_elements = TouchedElements::Some(BTreeSet::new());
    }

    /// Reinstate the snapshot taken at the first touch.
    pub(crate) fn rollback(&mut self) {
        assert!(self.touched, "restore called on untouched node '{}'", self.name);
        if let Some(value) = self.stored_value.take() {
            self.value = value;
        }
        self.ln_prob = self.stored_ln_prob;
        self.dirty = self.stored_dirty;
        self.touched = false;
        self.touched_elements = TouchedElements::Some(BTreeSet::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_touch_keeps_first_snapshot() {
        let mut node = DagNode::new("x", NodeKind::Stochastic(0), Value::Real(1.0), vec![]);
        node.ln_prob = -1.0;

        assert_eq!(node.begin_touch(None), (true, true));
        node.value = Value::Real(2.0);
        assert_eq!(node.begin_touch(None), (false, false));
        assert_eq!(node.stored_value(), Some(&Value::Real(1.0)));

        node.rollback();
        assert_eq!(node.value, Value::Real(1.0));
        assert_eq!(node.ln_prob, -1.0);
        assert!(!node.is_touched() && !node.is_dirty());
    }

    #[test]
    fn test_touched_elements_accumulate_until_whole() {
        let mut node = DagNode::new("v", NodeKind::Constant, Value::Vector(vec![0.0; 4]), vec![]);
        node.begin_touch(Some(&[2]));
        node.begin_touch(Some(&[0]));
        assert_eq!(node.touched_elements.to_vec(), Some(vec![0, 2]));
        node.begin_touch(None);
        assert_eq!(node.touched_elements.to_vec(), None);
    }

    #[test]
    #[should_panic(expected = "restore called on untouched node")]
    fn test_rollback_without_touch_panics() {
        let mut node = DagNode::new("x", NodeKind::Constant, Value::Real(0.0), vec![]);
        node.rollback();
    }
}
