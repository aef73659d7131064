use std::collections::HashMap;

use rand_chacha::ChaCha8Rng;

use crate::distributions::{Affecter, Distribution};
use crate::error::{ModelError, Result};
use crate::functions::{Arithmetic, Function};
use crate::node::{DagNode, NodeKind};
use crate::value::Value;

/// Unique identifier for a node in the model graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Directed acyclic graph of constant, stochastic and deterministic nodes.
///
/// Owns the touch/keep/restore protocol. A touch snapshots a node, marks it
/// dirty and cascades to every descendant; the nodes touched since the last
/// resolution form the open episode, which is then either kept (caches
/// brought up to date, snapshots dropped) or restored (snapshots
/// reinstated). Distributions and functions live in side tables so a node's
/// density can borrow its parents' values while mutating its own cache.
pub struct Graph {
    nodes: Vec<DagNode>,
    distributions: Vec<Box<dyn Distribution>>,
    functions: Vec<Box<dyn Function>>,
    name_to_node: HashMap<String, NodeId>,
    /// Topological rank of each node.
    rank: Vec<usize>,
    /// Nodes touched since the last resolution, in touch order.
    episode: Vec<NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            distributions: Vec::new(),
            functions: Vec::new(),
            name_to_node: HashMap::new(),
            rank: Vec::new(),
            episode: Vec::new(),
        }
    }

    // ── assembly ────────────────────────────────────────────────────

    fn check_id(&self, id: NodeId) -> Result<()> {
        if id.0 < self.nodes.len() {
            Ok(())
        } else {
            Err(ModelError::UnknownNode(id))
        }
    }

    fn push_node(&mut self, name: &str, kind: NodeKind, value: Value, parents: &[NodeId]) -> NodeId {
        let id = NodeId(self.nodes.len());
        for &p in parents {
            if !self.nodes[p.0].children.contains(&id) {
                self.nodes[p.0].children.push(id);
            }
        }
        self.nodes
            .push(DagNode::new(name, kind, value, parents.to_vec()));
        self.name_to_node.insert(name.to_string(), id);
        // parents always exist before their children, so insertion order is topological
        self.rank.push(id.0);
        id
    }

    fn check_new(&self, name: &str, parents: &[NodeId]) -> Result<()> {
        if self.name_to_node.contains_key(name) {
            return Err(ModelError::DuplicateName(name.to_string()));
        }
        parents.iter().try_for_each(|&p| self.check_id(p))
    }

    pub fn add_constant(&mut self, name: &str, value: Value) -> Result<NodeId> {
        self.check_new(name, &[])?;
        Ok(self.push_node(name, NodeKind::Constant, value, &[]))
    }

    /// Add a stochastic node and evaluate its log-probability immediately.
    pub fn add_stochastic<D>(
        &mut self,
        name: &str,
        distribution: D,
        parents: &[NodeId],
        initial: Value,
    ) -> Result<NodeId>
    where
        D: Distribution + 'static,
    {
        self.check_new(name, parents)?;
        for &p in parents {
            self.refresh(p);
        }
        {
            let parent_values: Vec<&Value> = parents.iter().map(|p| &self.nodes[p.0].value).collect();
            distribution.check(name, &initial, &parent_values)?;
        }
        let index = self.distributions.len();
        self.distributions.push(Box::new(distribution));
        let id = self.push_node(name, NodeKind::Stochastic(index), initial, parents);
        self.nodes[id.0].dirty = true;
        self.ln_probability(id);
        Ok(id)
    }

    /// Add a deterministic node and compute its value immediately.
    pub fn add_deterministic<F>(&mut self, name: &str, function: F, parents: &[NodeId]) -> Result<NodeId>
    where
        F: Function + 'static,
    {
        self.check_new(name, parents)?;
        for &p in parents {
            self.refresh(p);
        }
        let value = {
            let parent_values: Vec<&Value> = parents.iter().map(|p| &self.nodes[p.0].value).collect();
            function.check(name, &parent_values)?;
            function.compute(&parent_values)
        };
        let index = self.functions.len();
        self.functions.push(Box::new(function));
        Ok(self.push_node(name, NodeKind::Deterministic(index), value, parents))
    }

    pub fn arithmetic(&mut self, name: &str, op: Arithmetic, operands: &[NodeId]) -> Result<NodeId> {
        self.add_deterministic(name, op, operands)
    }

    /// Fix a stochastic node to observed data. Its probability still counts
    /// toward the model, but proposals may no longer write it.
    pub fn clamp(&mut self, id: NodeId, observed: Value) -> Result<()> {
        self.check_id(id)?;
        let NodeKind::Stochastic(index) = self.nodes[id.0].kind else {
            return Err(ModelError::NotStochastic(self.nodes[id.0].name.clone()));
        };
        {
            let node = &self.nodes[id.0];
            let parent_values: Vec<&Value> = node.parents.iter().map(|p| &self.nodes[p.0].value).collect();
            self.distributions[index].check(&node.name, &observed, &parent_values)?;
        }
        self.assert_no_episode("clamp");
        self.nodes[id.0].clamped = false;
        self.set_value(id, observed);
        self.nodes[id.0].clamped = true;
        self.keep_all();
        Ok(())
    }

    pub fn unclamp(&mut self, id: NodeId) -> Result<()> {
        self.check_id(id)?;
        self.nodes[id.0].clamped = false;
        Ok(())
    }

    /// Validate relinking `child` from `old` to `new` without changing any
    /// edge. Only lazy caches of `new` may be brought up to date.
    pub fn check_swap_parent(&mut self, child: NodeId, old: NodeId, new: NodeId) -> Result<()> {
        self.check_id(child)?;
        self.check_id(old)?;
        self.check_id(new)?;
        if !self.nodes[child.0].parents.contains(&old) {
            return Err(ModelError::MissingEdge { child, parent: old });
        }
        if new == child || self.descendants(child).contains(&new) {
            return Err(ModelError::Cycle { child, parent: new });
        }
        self.assert_no_episode("swap_parent");

        self.refresh(new);
        let node = &self.nodes[child.0];
        let parent_values: Vec<&Value> = node
            .parents
            .iter()
            .map(|&p| if p == old { &self.nodes[new.0].value } else { &self.nodes[p.0].value })
            .collect();
        match node.kind {
            NodeKind::Stochastic(i) => self.distributions[i].check(&node.name, &node.value, &parent_values),
            NodeKind::Deterministic(i) => self.functions[i].check(&node.name, &parent_values),
            NodeKind::Constant => Ok(()),
        }
    }

    /// Relink `child` from `old` to `new` without rebuilding the graph, then
    /// bring the child and its dependents up to date.
    pub fn swap_parent(&mut self, child: NodeId, old: NodeId, new: NodeId) -> Result<()> {
        self.check_swap_parent(child, old, new)?;

        for p in self.nodes[child.0].parents.iter_mut() {
            if *p == old {
                *p = new;
            }
        }
        self.nodes[old.0].children.retain(|&c| c != child);
        if !self.nodes[new.0].children.contains(&child) {
            self.nodes[new.0].children.push(child);
        }
        self.rank = self.topological_rank();
        tracing::debug!(
            child = %self.nodes[child.0].name,
            old = %self.nodes[old.0].name,
            new = %self.nodes[new.0].name,
            "swapped parent"
        );

        self.touch(child);
        self.keep_all();
        Ok(())
    }

    fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = self.nodes[id.0].children.clone();
        let mut out = Vec::new();
        while let Some(c) = stack.pop() {
            if !seen[c.0] {
                seen[c.0] = true;
                out.push(c);
                stack.extend(self.nodes[c.0].children.iter().copied());
            }
        }
        out
    }

    fn topological_rank(&self) -> Vec<usize> {
        let n = self.nodes.len();
        let mut indegree: Vec<usize> = self.nodes.iter().map(|node| node.parents.len()).collect();
        let mut ready: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).rev().collect();
        let mut rank = vec![0; n];
        let mut next = 0;
        while let Some(i) = ready.pop() {
            rank[i] = next;
            next += 1;
            for c in &self.nodes[i].children {
                let edges = self.nodes[c.0].parents.iter().filter(|&&p| p.0 == i).count();
                indegree[c.0] -= edges;
                if indegree[c.0] == 0 {
                    ready.push(c.0);
                }
            }
        }
        assert_eq!(next, n, "graph contains a cycle");
        rank
    }

    // ── queries ─────────────────────────────────────────────────────

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: NodeId) -> &DagNode {
        &self.nodes[id.0]
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len()).map(NodeId)
    }

    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.name_to_node.get(name).copied()
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.nodes[id.0].name
    }

    pub fn rank(&self, id: NodeId) -> usize {
        self.rank[id.0]
    }

    /// Cached value. For a dirty deterministic node this is the value before
    /// the pending recomputation; use [`Graph::value`] for a fresh one.
    pub fn cached_value(&self, id: NodeId) -> &Value {
        &self.nodes[id.0].value
    }

    /// Current value, recomputing a dirty deterministic node first.
    pub fn value(&mut self, id: NodeId) -> &Value {
        self.refresh(id);
        &self.nodes[id.0].value
    }

    pub fn distribution_name(&self, id: NodeId) -> Option<&'static str> {
        match self.nodes[id.0].kind {
            NodeKind::Stochastic(i) => Some(self.distributions[i].name()),
            _ => None,
        }
    }

    pub fn has_pending_touches(&self) -> bool {
        !self.episode.is_empty()
    }

    /// Nodes touched in the open episode.
    pub fn episode(&self) -> &[NodeId] {
        &self.episode
    }

    // ── evaluation ──────────────────────────────────────────────────

    /// Recompute a dirty deterministic node after its parents.
    fn refresh(&mut self, id: NodeId) {
        let node = &self.nodes[id.0];
        let NodeKind::Deterministic(index) = node.kind else {
            return;
        };
        if !node.dirty {
            return;
        }
        let parents = node.parents.clone();
        for &p in &parents {
            self.refresh(p);
        }
        let value = {
            let parent_values: Vec<&Value> = parents.iter().map(|p| &self.nodes[p.0].value).collect();
            self.functions[index].compute(&parent_values)
        };
        let node = &mut self.nodes[id.0];
        node.value = value;
        node.dirty = false;
    }

    /// Log-probability of a stochastic node, recomputed only when dirty.
    /// Non-stochastic nodes contribute zero.
    pub fn ln_probability(&mut self, id: NodeId) -> f64 {
        let node = &self.nodes[id.0];
        let NodeKind::Stochastic(index) = node.kind else {
            return 0.0;
        };
        if !node.dirty {
            return node.ln_prob;
        }
        let parents = node.parents.clone();
        for &p in &parents {
            self.refresh(p);
        }
        let mut ln_prob = {
            let parent_values: Vec<&Value> = parents.iter().map(|p| &self.nodes[p.0].value).collect();
            self.distributions[index].ln_probability(&self.nodes[id.0].value, &parent_values)
        };
        if ln_prob.is_nan() {
            tracing::warn!(node = %self.nodes[id.0].name, "log-probability is NaN, treating as impossible");
            ln_prob = f64::NEG_INFINITY;
        }
        let node = &mut self.nodes[id.0];
        node.ln_prob = ln_prob;
        node.dirty = false;
        ln_prob
    }

    /// Draw a new value for an unclamped stochastic node from its
    /// distribution. Opens (or joins) a touch episode.
    pub fn redraw(&mut self, id: NodeId, rng: &mut ChaCha8Rng) {
        let node = &self.nodes[id.0];
        let NodeKind::Stochastic(index) = node.kind else {
            return;
        };
        if node.clamped {
            return;
        }
        let parents = node.parents.clone();
        for &p in &parents {
            self.refresh(p);
        }
        let value = {
            let parent_values: Vec<&Value> = parents.iter().map(|p| &self.nodes[p.0].value).collect();
            self.distributions[index].redraw(&parent_values, rng)
        };
        self.set_value(id, value);
    }

    // ── touch / keep / restore ──────────────────────────────────────

    fn assert_no_episode(&self, operation: &str) {
        assert!(
            self.episode.is_empty(),
            "{} while {} touched node(s) are unresolved",
            operation,
            self.episode.len()
        );
    }

    /// Replace a node's value, touching it first.
    pub fn set_value(&mut self, id: NodeId, value: Value) {
        self.update_value(id, None, move |v| *v = value);
    }

    /// Mutate a node's value in place. `elements` names the sub-elements
    /// being changed so structured dependents can limit recomputation;
    /// `None` means the whole value.
    pub fn update_value<R>(
        &mut self,
        id: NodeId,
        elements: Option<&[usize]>,
        f: impl FnOnce(&mut Value) -> R,
    ) -> R {
        assert!(
            !self.nodes[id.0].clamped,
            "attempt to write clamped node '{}'",
            self.nodes[id.0].name
        );
        self.touch_elements(id, elements);
        f(&mut self.nodes[id.0].value)
    }

    /// Touch a whole node. A node already touched in this episode is left
    /// alone, so several paths to the same node coalesce into one snapshot.
    pub fn touch(&mut self, id: NodeId) {
        if self.nodes[id.0].touched {
            return;
        }
        self.touch_elements(id, None);
    }

    /// Touch specific sub-elements of a node's value and cascade to all
    /// dependents. Always forwards the element hint, even when the node is
    /// already touched, because a later change may concern other elements.
    pub fn touch_elements(&mut self, id: NodeId, elements: Option<&[usize]>) {
        let (first, _) = self.nodes[id.0].begin_touch(elements);
        if first {
            self.episode.push(id);
        }
        if let NodeKind::Stochastic(index) = self.nodes[id.0].kind {
            self.distributions[index].touch(Affecter::Value(elements));
        }

        // the value itself changes, so every dependent is affected
        let mut stack: Vec<(NodeId, NodeId)> =
            self.nodes[id.0].children.iter().map(|&c| (c, id)).collect();
        while let Some((child, from)) = stack.pop() {
            let (first, was_clean) = self.nodes[child.0].begin_touch(None);
            if first {
                self.episode.push(child);
            }
            if let NodeKind::Stochastic(index) = self.nodes[child.0].kind {
                let hint = self.nodes[from.0].touched_elements.to_vec();
                for slot in self.nodes[child.0].slots_of(from) {
                    self.distributions[index].touch(Affecter::Parent {
                        slot,
                        elements: hint.as_deref(),
                    });
                }
            }
            if first || was_clean {
                stack.extend(self.nodes[child.0].children.iter().map(|&c| (c, child)));
            }
        }
    }

    fn sorted_episode(&mut self) -> Vec<NodeId> {
        let mut episode = std::mem::take(&mut self.episode);
        episode.sort_by_key(|id| self.rank[id.0]);
        episode.dedup();
        episode
    }

    fn keep_node(&mut self, id: NodeId) {
        match self.nodes[id.0].kind {
            NodeKind::Stochastic(index) => {
                self.ln_probability(id);
                self.distributions[index].keep();
            }
            NodeKind::Deterministic(_) => self.refresh(id),
            NodeKind::Constant => self.nodes[id.0].dirty = false,
        }
        self.nodes[id.0].commit();
    }

    fn restore_node(&mut self, id: NodeId) {
        if let NodeKind::Stochastic(index) = self.nodes[id.0].kind {
            self.distributions[index].restore();
        }
        self.nodes[id.0].rollback();
    }

    /// Commit every node of the open episode in topological order.
    pub fn keep_all(&mut self) {
        for id in self.sorted_episode() {
            if self.nodes[id.0].touched {
                self.keep_node(id);
            }
        }
    }

    /// Roll back every node of the open episode.
    pub fn restore_all(&mut self) {
        for id in self.sorted_episode() {
            if self.nodes[id.0].touched {
                self.restore_node(id);
            }
        }
    }

    /// Commit `id` and every touched node downstream of it.
    ///
    /// Panics if `id` is not touched: resolving a touch twice is a protocol
    /// violation.
    pub fn keep(&mut self, id: NodeId) {
        assert!(
            self.nodes[id.0].touched,
            "keep called on untouched node '{}'",
            self.nodes[id.0].name
        );
        let resolved = self.resolve_downstream(id, true);
        self.episode.retain(|n| !resolved.contains(n));
    }

    /// Roll back `id` and every touched node downstream of it.
    ///
    /// Panics if `id` is not touched.
    pub fn restore(&mut self, id: NodeId) {
        assert!(
            self.nodes[id.0].touched,
            "restore called on untouched node '{}'",
            self.nodes[id.0].name
        );
        let resolved = self.resolve_downstream(id, false);
        self.episode.retain(|n| !resolved.contains(n));
    }

    fn resolve_downstream(&mut self, id: NodeId, keep: bool) -> Vec<NodeId> {
        let mut reached = vec![id];
        reached.extend(self.descendants(id));
        reached.retain(|n| self.nodes[n.0].touched);
        reached.sort_by_key(|n| self.rank[n.0]);
        for &n in &reached {
            if keep {
                self.keep_node(n);
            } else {
                self.restore_node(n);
            }
        }
        reached
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{Exponential, Normal};
    use proptest::prelude::*;
    use rand::SeedableRng;

    /// a ~ Normal(0, 1); b = exp(a); c ~ Exponential(b); d ~ Normal(0, 1) unrelated.
    fn chain_graph() -> (Graph, [NodeId; 4]) {
        let mut g = Graph::new();
        let a = Normal::prior(&mut g, "a", 0.0, 1.0).unwrap();
        let b = g.arithmetic("b", Arithmetic::Exp, &[a]).unwrap();
        let c = g.add_stochastic("c", Exponential, &[b], Value::Real(0.5)).unwrap();
        let d = Normal::prior(&mut g, "d", 0.0, 1.0).unwrap();
        (g, [a, b, c, d])
    }

    #[test]
    fn test_dirty_propagates_forward_only() {
        let (mut g, [a, b, c, d]) = chain_graph();
        g.set_value(a, Value::Real(0.3));

        assert!(g.node(a).is_dirty());
        assert!(g.node(b).is_dirty() && g.node(b).is_touched());
        assert!(g.node(c).is_dirty() && g.node(c).is_touched());
        assert!(!g.node(d).is_dirty() && !g.node(d).is_touched());
        g.keep_all();
    }

    #[test]
    fn test_touch_restore_round_trip() {
        let (mut g, [a, b, c, _]) = chain_graph();
        let before: Vec<(Value, f64)> = [a, b, c]
            .iter()
            .map(|&id| (g.cached_value(id).clone(), g.ln_probability(id)))
            .collect();

        g.set_value(a, Value::Real(1.7));
        // evaluate the speculative state so every cache is overwritten
        let _ = g.ln_probability(c);
        assert_ne!(g.value(b), &before[1].0);

        g.restore_all();
        for (i, &id) in [a, b, c].iter().enumerate() {
            assert_eq!(g.cached_value(id), &before[i].0);
            assert_eq!(g.ln_probability(id).to_bits(), before[i].1.to_bits());
            assert!(!g.node(id).is_dirty() && !g.node(id).is_touched());
        }
        assert!(!g.has_pending_touches());
    }

    #[test]
    fn test_keep_matches_fresh_evaluation() {
        let (mut g, [a, b, c, _]) = chain_graph();
        g.set_value(a, Value::Real(-0.4));
        g.keep_all();

        assert!(!g.node(c).is_dirty() && !g.node(c).is_touched());
        let expected_b = (-0.4f64).exp();
        assert!((g.cached_value(b).as_real() - expected_b).abs() < 1e-12);
        let expected_c = expected_b.ln() - expected_b * 0.5;
        assert!((g.ln_probability(c) - expected_c).abs() < 1e-12);
    }

    #[test]
    fn test_repeated_touch_keeps_original_snapshot() {
        let (mut g, [a, _, _, _]) = chain_graph();
        g.set_value(a, Value::Real(1.0));
        g.set_value(a, Value::Real(2.0));
        g.touch(a);
        assert_eq!(g.node(a).stored_value(), Some(&Value::Real(0.0)));
        assert_eq!(g.episode().iter().filter(|&&n| n == a).count(), 1);
        g.restore_all();
        assert_eq!(g.cached_value(a), &Value::Real(0.0));
    }

    #[test]
    fn test_node_level_keep_forwards_to_children() {
        let (mut g, [a, b, c, _]) = chain_graph();
        g.set_value(a, Value::Real(0.25));
        g.keep(a);
        assert!(!g.node(b).is_touched() && !g.node(c).is_touched());
        assert!(!g.has_pending_touches());
    }

    fn snapshot(g: &Graph, ids: &[NodeId]) -> Vec<(Value, u64, bool, bool)> {
        ids.iter()
            .map(|&id| {
                let n = g.node(id);
                (n.value.clone(), n.ln_prob.to_bits(), n.is_dirty(), n.is_touched())
            })
            .collect()
    }

    #[test]
    fn test_node_level_restore_round_trip() {
        let (mut g, ids) = chain_graph();
        let [a, b, c, _] = ids;
        let before = snapshot(&g, &ids);

        g.set_value(a, Value::Real(-2.2));
        let _ = g.ln_probability(c);
        assert!(g.node(b).is_touched());

        g.restore(a);
        assert_eq!(snapshot(&g, &ids), before);
        assert!(!g.has_pending_touches());
    }

    #[test]
    fn test_resolution_order_does_not_matter() {
        for keep in [true, false] {
            let mut results = Vec::new();
            for reverse in [false, true] {
                let (mut g, ids) = chain_graph();
                g.set_value(ids[0], Value::Real(0.8));
                g.set_value(ids[3], Value::Real(-0.3));
                let mut episode: Vec<NodeId> = g.episode().to_vec();
                episode.sort_by_key(|&id| g.rank(id));
                if reverse {
                    episode.reverse();
                }
                for id in episode {
                    if !g.node(id).is_touched() {
                        continue;
                    }
                    if keep {
                        g.keep(id);
                    } else {
                        g.restore(id);
                    }
                }
                assert!(!g.has_pending_touches());
                results.push(snapshot(&g, &ids));
            }
            assert_eq!(results[0], results[1], "keep={}", keep);
        }
    }

    #[test]
    #[should_panic(expected = "keep called on untouched node")]
    fn test_resolving_twice_panics() {
        let (mut g, [a, _, _, _]) = chain_graph();
        g.set_value(a, Value::Real(0.25));
        g.keep(a);
        g.keep(a);
    }

    #[test]
    fn test_clamped_node_keeps_probability_term() {
        let (mut g, [_, _, c, _]) = chain_graph();
        g.clamp(c, Value::Real(2.0)).unwrap();
        assert!(g.node(c).is_clamped());
        assert_eq!(g.cached_value(c), &Value::Real(2.0));
        assert!(g.ln_probability(c).is_finite());

        g.unclamp(c).unwrap();
        assert!(!g.node(c).is_clamped());
        assert_eq!(g.unclamp(NodeId(99)), Err(ModelError::UnknownNode(NodeId(99))));
    }

    #[test]
    #[should_panic(expected = "attempt to write clamped node")]
    fn test_writing_clamped_node_panics() {
        let (mut g, [_, _, c, _]) = chain_graph();
        g.clamp(c, Value::Real(2.0)).unwrap();
        g.set_value(c, Value::Real(3.0));
    }

    #[test]
    fn test_swap_parent_relinks_and_recomputes() {
        let (mut g, [a, b, c, d]) = chain_graph();
        g.set_value(d, Value::Real(1.0));
        g.keep_all();

        g.swap_parent(b, a, d).unwrap();
        assert_eq!(g.node(b).parents(), &[d]);
        assert!(!g.node(a).children().contains(&b));
        assert!((g.cached_value(b).as_real() - 1.0f64.exp()).abs() < 1e-12);
        assert!(!g.node(c).is_dirty());
        assert!(!g.has_pending_touches());
    }

    #[test]
    fn test_swap_parent_errors() {
        let (mut g, [a, b, c, d]) = chain_graph();
        assert_eq!(
            g.swap_parent(c, a, d),
            Err(ModelError::MissingEdge { child: c, parent: a })
        );
        assert_eq!(g.swap_parent(b, a, c), Err(ModelError::Cycle { child: b, parent: c }));
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let mut g = Graph::new();
        g.add_constant("k", Value::Real(1.0)).unwrap();
        assert_eq!(
            g.add_constant("k", Value::Real(2.0)),
            Err(ModelError::DuplicateName("k".to_string()))
        );
    }

    #[test]
    fn test_redraw_is_reproducible() {
        let draw = |seed| {
            let (mut g, [a, ..]) = chain_graph();
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            g.redraw(a, &mut rng);
            g.keep_all();
            g.cached_value(a).as_real()
        };
        assert_eq!(draw(11).to_bits(), draw(11).to_bits());
    }

    proptest! {
        #[test]
        fn prop_touch_restore_is_bit_exact(a_new in -5.0f64..5.0, d_new in -5.0f64..5.0, touch_d: bool) {
            let (mut g, ids) = chain_graph();
            let before: Vec<(Value, u64, bool, bool)> = ids
                .iter()
                .map(|&id| {
                    let lp = g.ln_probability(id).to_bits();
                    let n = g.node(id);
                    (n.value.clone(), lp, n.is_dirty(), n.is_touched())
                })
                .collect();

            g.set_value(ids[0], Value::Real(a_new));
            if touch_d {
                g.set_value(ids[3], Value::Real(d_new));
            }
            for &id in &ids {
                g.ln_probability(id);
            }
            g.restore_all();

            for (i, &id) in ids.iter().enumerate() {
                let n = g.node(id);
                prop_assert_eq!(&n.value, &before[i].0);
                prop_assert_eq!(n.ln_prob.to_bits(), before[i].1);
                prop_assert_eq!((n.is_dirty(), n.is_touched()), (before[i].2, before[i].3));
            }
        }
    }
}
