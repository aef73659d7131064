use std::collections::HashSet;

use rand_chacha::ChaCha8Rng;

use crate::error::{ModelError, Result};
use crate::graph::{Graph, NodeId};
use crate::value::Value;

/// The part of a graph reachable from a set of declared roots.
///
/// Membership is the closure over parent edges, kept in topological order.
/// The total log-probability sums the cached terms of every stochastic
/// member, so after the first evaluation it costs work proportional to the
/// number of dirty nodes.
pub struct Model {
    graph: Graph,
    roots: Vec<NodeId>,
    members: Vec<NodeId>,
    member_set: HashSet<NodeId>,
}

impl Model {
    pub fn new(graph: Graph, roots: &[NodeId]) -> Result<Self> {
        for &r in roots {
            if r.0 >= graph.num_nodes() {
                return Err(ModelError::UnknownNode(r));
            }
        }
        let mut model = Self {
            graph,
            roots: roots.to_vec(),
            members: Vec::new(),
            member_set: HashSet::new(),
        };
        model.collect_members();
        tracing::debug!(
            roots = model.roots.len(),
            members = model.members.len(),
            "model assembled"
        );
        Ok(model)
    }

    fn collect_members(&mut self) {
        let mut seen = HashSet::new();
        let mut stack = self.roots.clone();
        while let Some(id) = stack.pop() {
            if seen.insert(id) {
                stack.extend(self.graph.node(id).parents().iter().copied());
            }
        }
        let mut members: Vec<NodeId> = seen.iter().copied().collect();
        members.sort_by_key(|&id| self.graph.rank(id));
        self.members = members;
        self.member_set = seen;
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Direct graph access for kernels and assembly. Changing edges through
    /// this handle bypasses membership bookkeeping; use
    /// [`Model::swap_parent`] instead.
    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn into_graph(self) -> Graph {
        self.graph
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Members in topological order.
    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.member_set.contains(&id)
    }

    pub fn stochastic_members(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members
            .iter()
            .copied()
            .filter(|&id| self.graph.node(id).is_stochastic())
    }

    /// Members a proposal may write.
    pub fn free_parameters(&self) -> Vec<NodeId> {
        self.stochastic_members()
            .filter(|&id| !self.graph.node(id).is_clamped())
            .collect()
    }

    /// Sum of the log-probabilities of every stochastic member. Any NaN term
    /// makes the whole sum negative infinity.
    pub fn total_ln_probability(&mut self) -> f64 {
        let mut total = 0.0;
        for i in 0..self.members.len() {
            let id = self.members[i];
            if !self.graph.node(id).is_stochastic() {
                continue;
            }
            let lp = self.graph.ln_probability(id);
            if lp == f64::NEG_INFINITY {
                return f64::NEG_INFINITY;
            }
            total += lp;
        }
        if total.is_nan() {
            f64::NEG_INFINITY
        } else {
            total
        }
    }

    /// Log-likelihood: the summed terms of the clamped members only.
    pub fn ln_likelihood(&mut self) -> f64 {
        let clamped: Vec<NodeId> = self
            .stochastic_members()
            .filter(|&id| self.graph.node(id).is_clamped())
            .collect();
        clamped.into_iter().map(|id| self.graph.ln_probability(id)).sum()
    }

    pub fn clamp(&mut self, id: NodeId, observed: Value) -> Result<()> {
        self.graph.clamp(id, observed)?;
        tracing::debug!(node = %self.graph.name(id), "clamped");
        Ok(())
    }

    pub fn swap_parent(&mut self, child: NodeId, old: NodeId, new: NodeId) -> Result<()> {
        self.graph.swap_parent(child, old, new)?;
        self.collect_members();
        Ok(())
    }

    /// Relink every child of `old` to `new`. Returns the relinked children.
    /// `new` itself keeps its edge to `old` when it is derived from it.
    ///
    /// Every relink is validated before the first edge changes, so an error
    /// leaves the model untouched.
    pub fn swap_parameter(&mut self, old: NodeId, new: NodeId) -> Result<Vec<NodeId>> {
        if old.0 >= self.graph.num_nodes() {
            return Err(ModelError::UnknownNode(old));
        }
        if new.0 >= self.graph.num_nodes() {
            return Err(ModelError::UnknownNode(new));
        }
        let children: Vec<NodeId> = self
            .graph
            .node(old)
            .children()
            .iter()
            .copied()
            .filter(|&c| c != new)
            .collect();
        for &child in &children {
            self.graph.check_swap_parent(child, old, new)?;
        }
        for &child in &children {
            self.graph.swap_parent(child, old, new)?;
        }
        if let Some(root) = self.roots.iter_mut().find(|r| **r == old) {
            *root = new;
        }
        self.collect_members();
        Ok(children)
    }

    /// Resimulate every free parameter from its distribution, parents first.
    pub fn redraw(&mut self, rng: &mut ChaCha8Rng) {
        for id in self.free_parameters() {
            self.graph.redraw(id, rng);
        }
        self.graph.keep_all();
    }

    /// Check that a proposal may write `id`.
    pub fn check_target(&self, id: NodeId) -> Result<()> {
        self.check_writable(id)?;
        if !self.contains(id) {
            return Err(ModelError::OutsideModel(self.graph.name(id).to_string()));
        }
        Ok(())
    }

    /// Like [`Model::check_target`] but without the membership test, for a
    /// node about to replace a member.
    pub fn check_writable(&self, id: NodeId) -> Result<()> {
        if id.0 >= self.graph.num_nodes() {
            return Err(ModelError::UnknownNode(id));
        }
        let node = self.graph.node(id);
        if !node.is_stochastic() {
            return Err(ModelError::NotStochastic(node.name().to_string()));
        }
        if node.is_clamped() {
            return Err(ModelError::ClampedTarget(node.name().to_string()));
        }
        Ok(())
    }

    pub fn column_names(&self, ids: &[NodeId]) -> Vec<String> {
        ids.iter()
            .flat_map(|&id| self.graph.cached_value(id).column_names(self.graph.name(id)))
            .collect()
    }

    /// Current values of `ids` flattened into monitor columns.
    pub fn columns(&mut self, ids: &[NodeId]) -> Vec<f64> {
        let mut out = Vec::new();
        for &id in ids {
            out.extend(self.graph.value(id).columns());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{Exponential, Normal};
    use crate::functions::Arithmetic;
    use rand::SeedableRng;

    fn small_model() -> (Model, NodeId, NodeId, NodeId) {
        let mut g = Graph::new();
        let mu = Normal::prior(&mut g, "mu", 0.0, 1.0).unwrap();
        let sigma = Exponential::prior(&mut g, "sigma", 1.0).unwrap();
        let y = g
            .add_stochastic("y", Normal, &[mu, sigma], Value::Real(0.5))
            .unwrap();
        g.add_constant("unused", Value::Real(3.0)).unwrap();
        let model = Model::new(g, &[y]).unwrap();
        (model, mu, sigma, y)
    }

    #[test]
    fn test_members_are_parent_closure_in_topological_order() {
        let (model, mu, sigma, y) = small_model();
        let unused = model.graph().node_by_name("unused").unwrap();
        assert!(model.contains(mu) && model.contains(sigma) && model.contains(y));
        assert!(!model.contains(unused));
        let ranks: Vec<usize> = model.members().iter().map(|&id| model.graph().rank(id)).collect();
        assert!(ranks.windows(2).all(|w| w[0] < w[1]), "members must be topologically sorted");
    }

    #[test]
    fn test_total_is_sum_of_stochastic_terms() {
        let (mut model, mu, sigma, y) = small_model();
        let expected = model.graph_mut().ln_probability(mu)
            + model.graph_mut().ln_probability(sigma)
            + model.graph_mut().ln_probability(y);
        assert!((model.total_ln_probability() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_impossible_state_gives_negative_infinity() {
        let (mut model, _, sigma, _) = small_model();
        model.graph_mut().set_value(sigma, Value::Real(-1.0));
        assert_eq!(model.total_ln_probability(), f64::NEG_INFINITY);
        model.graph_mut().restore_all();
        assert!(model.total_ln_probability().is_finite());
    }

    #[test]
    fn test_clamped_node_is_not_a_target() {
        let (mut model, mu, _, y) = small_model();
        model.clamp(y, Value::Real(1.2)).unwrap();
        assert_eq!(model.check_target(y), Err(ModelError::ClampedTarget("y".into())));
        assert!(model.check_target(mu).is_ok());
        assert!(model.ln_likelihood().is_finite());
        assert!(!model.free_parameters().contains(&y));
    }

    #[test]
    fn test_swap_parameter_updates_membership() {
        let (mut model, mu, _, y) = small_model();
        let shift = model
            .graph_mut()
            .arithmetic("shift", Arithmetic::Neg, &[mu])
            .unwrap();
        assert!(!model.contains(shift));
        model.swap_parameter(mu, shift).unwrap();
        assert!(model.contains(shift) && model.contains(mu));
        assert_eq!(model.graph().node(y).parents()[0], shift);
    }

    #[test]
    fn test_failed_swap_parameter_changes_nothing() {
        let mut g = Graph::new();
        let a = Normal::prior(&mut g, "a", 0.0, 1.0).unwrap();
        let s = g.add_constant("s", Value::Real(1.0)).unwrap();
        let y = g.add_stochastic("y", Normal, &[a, s], Value::Real(0.5)).unwrap();
        let z = g.add_stochastic("z", Normal, &[a, s], Value::Real(0.1)).unwrap();
        let w = g.arithmetic("w", Arithmetic::Exp, &[z]).unwrap();
        let mut model = Model::new(g, &[y, w]).unwrap();

        // y could be relinked to w, but z cannot: w depends on z
        let err = model.swap_parameter(a, w);
        assert_eq!(err, Err(ModelError::Cycle { child: z, parent: w }));
        assert_eq!(model.graph().node(y).parents(), &[a, s]);
        assert_eq!(model.graph().node(z).parents(), &[a, s]);
        assert!(model.graph().node(a).children().contains(&y));
        assert!(model.contains(a));
        assert_eq!(model.roots(), &[y, w]);
    }

    #[test]
    fn test_redraw_leaves_no_open_episode() {
        let (mut model, _, _, _) = small_model();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        model.redraw(&mut rng);
        assert!(!model.graph().has_pending_touches());
        assert!(model.total_ln_probability().is_finite());
    }
}
