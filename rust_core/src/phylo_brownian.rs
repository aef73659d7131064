//! Brownian motion of a continuous trait along a tree, evaluated
//! incrementally with per-node double-buffered partial likelihoods.

use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution as _, Exp, Normal as NormalSampler};

use crate::buffer::BufferedCache;
use crate::distributions::{expect_kind, expect_parents, Affecter, Distribution, Exponential, ScalarDensity};
use crate::error::{ModelError, Result};
use crate::tree::Tree;
use crate::value::Value;

const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Pruned summary of the subtree below a node.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Partial {
    /// Weighted mean trait value at the node.
    mean: f64,
    /// Variance of `mean`, including the node's own branch.
    variance: f64,
    /// Log-likelihood of the independent contrasts inside the subtree.
    ln_lik: f64,
}

const EMPTY: Partial = Partial {
    mean: 0.0,
    variance: 0.0,
    ln_lik: 0.0,
};

/// Restricted likelihood of tip values under Brownian motion with rate
/// `sigma^2`, computed by pruning independent contrasts.
///
/// Parents: `[tree, sigma]`. Value: one real per tip, in tip index order.
///
/// Each tree node keeps two partial-likelihood slots. A change to a branch
/// or a tip dirties only the path from that node to the root; evaluation
/// recomputes only dirty nodes, and a rejected proposal reactivates the
/// previous slots without recomputation.
pub struct PhyloBrownian {
    partials: BufferedCache<Partial>,
    parent_of: Vec<Option<usize>>,
    last_recomputed: Vec<usize>,
}

impl PhyloBrownian {
    pub fn new() -> Self {
        Self {
            partials: BufferedCache::new(0, EMPTY),
            parent_of: Vec::new(),
            last_recomputed: Vec::new(),
        }
    }

    /// Nodes recomputed by the most recent evaluation.
    pub fn last_recomputed(&self) -> &[usize] {
        &self.last_recomputed
    }

    /// Buffer slot currently active for tree node `index`.
    pub fn active_slot(&self, index: usize) -> usize {
        self.partials.active_slot(index)
    }

    fn flag_path(&mut self, from: usize) {
        if from >= self.parent_of.len() {
            self.partials.mark_all_dirty();
            return;
        }
        let mut node = Some(from);
        while let Some(i) = node {
            // a dirty node already has a dirty path above it
            if !self.partials.mark_dirty(i) {
                break;
            }
            node = self.parent_of[i];
        }
    }

    fn sync_topology(&mut self, tree: &Tree) {
        let n = tree.num_nodes();
        let same = self.parent_of.len() == n
            && (0..n).all(|i| self.parent_of[i] == tree.node(i).parent);
        if !same {
            self.parent_of = (0..n).map(|i| tree.node(i).parent).collect();
            self.partials.resize(n);
        }
    }

    fn update(&mut self, tree: &Tree, tips: &[f64], rate: f64, index: usize) {
        if !self.partials.is_dirty(index) {
            return;
        }
        let own = if tree.is_root(index) {
            0.0
        } else {
            rate * tree.branch_length(index)
        };

        let partial = if tree.is_tip(index) {
            Partial {
                mean: tips[index],
                variance: own,
                ln_lik: 0.0,
            }
        } else {
            let children = &tree.node(index).children;
            for &c in children {
                self.update(tree, tips, rate, c);
            }
            let (l, r) = (*self.partials.active(children[0]), *self.partials.active(children[1]));
            let total = l.variance + r.variance;
            let contrast = l.mean - r.mean;
            if total > 0.0 {
                Partial {
                    mean: (l.mean * r.variance + r.mean * l.variance) / total,
                    variance: l.variance * r.variance / total + own,
                    ln_lik: l.ln_lik + r.ln_lik - 0.5 * (LN_2PI + total.ln() + contrast * contrast / total),
                }
            } else {
                Partial {
                    mean: l.mean,
                    variance: own,
                    ln_lik: f64::NEG_INFINITY,
                }
            }
        };
        self.partials.store(index, partial);
        self.last_recomputed.push(index);
    }
}

impl Default for PhyloBrownian {
    fn default() -> Self {
        Self::new()
    }
}

impl Distribution for PhyloBrownian {
    fn name(&self) -> &'static str {
        "phylo_brownian"
    }

    fn ln_probability(&mut self, value: &Value, parents: &[&Value]) -> f64 {
        let tree = parents[0].as_tree();
        let sigma = parents[1].as_real();
        if sigma <= 0.0 {
            return f64::NEG_INFINITY;
        }
        self.sync_topology(tree);
        self.last_recomputed.clear();
        self.update(tree, value.as_vector(), sigma * sigma, tree.root());
        self.partials.active(tree.root()).ln_lik
    }

    fn redraw(&self, parents: &[&Value], rng: &mut ChaCha8Rng) -> Value {
        let tree = parents[0].as_tree();
        let sigma = parents[1].as_real();
        let mut states = vec![0.0; tree.num_nodes()];
        // parents precede children in reverse postorder
        for &i in tree.postorder().iter().rev() {
            if let Some(p) = tree.node(i).parent {
                let sd = sigma * tree.branch_length(i).sqrt();
                let step = NormalSampler::new(0.0, sd).map(|d| d.sample(rng)).unwrap_or(0.0);
                states[i] = states[p] + step;
            }
        }
        states.truncate(tree.num_tips());
        Value::Vector(states)
    }

    fn check(&self, node: &str, value: &Value, parents: &[&Value]) -> Result<()> {
        expect_kind(node, value, "vector")?;
        expect_parents(node, parents, 2)?;
        expect_kind(node, parents[0], "tree")?;
        let tips = parents[0].as_tree().num_tips();
        if value.as_vector().len() != tips {
            return Err(ModelError::LengthMismatch {
                what: format!("tip values of {}", node),
                expected: tips,
                found: value.as_vector().len(),
            });
        }
        Ok(())
    }

    fn touch(&mut self, affecter: Affecter<'_>) {
        match affecter {
            Affecter::Value(Some(tips)) | Affecter::Parent { slot: 0, elements: Some(tips) } => {
                for &i in tips {
                    self.flag_path(i);
                }
            }
            _ => self.partials.mark_all_dirty(),
        }
    }

    fn keep(&mut self) {
        self.partials.keep();
    }

    fn restore(&mut self) {
        self.partials.restore();
    }
}

/// Fixed-topology tree with independent exponential branch lengths.
///
/// Parents: `[rate]`. The root branch is ignored.
pub struct ExponentialBranchLengths {
    topology: Tree,
}

impl ExponentialBranchLengths {
    pub fn new(topology: Tree) -> Self {
        Self { topology }
    }
}

impl Distribution for ExponentialBranchLengths {
    fn name(&self) -> &'static str {
        "exponential_branch_lengths"
    }

    fn ln_probability(&mut self, value: &Value, parents: &[&Value]) -> f64 {
        let tree = value.as_tree();
        let rate = parents[0].as_real();
        (0..tree.num_nodes())
            .filter(|&i| !tree.is_root(i))
            .map(|i| Exponential.ln_density(tree.branch_length(i), &[rate]))
            .sum()
    }

    fn redraw(&self, parents: &[&Value], rng: &mut ChaCha8Rng) -> Value {
        let mut tree = self.topology.clone();
        if let Ok(lengths) = Exp::new(parents[0].as_real()) {
            for i in 0..tree.num_nodes() {
                if !tree.is_root(i) {
                    tree.set_branch_length(i, lengths.sample(rng));
                }
            }
        }
        Value::Tree(tree)
    }

    fn check(&self, node: &str, value: &Value, parents: &[&Value]) -> Result<()> {
        expect_kind(node, value, "tree")?;
        expect_parents(node, parents, 1)?;
        if value.as_tree().num_nodes() != self.topology.num_nodes() {
            return Err(ModelError::InvalidTree(format!(
                "'{}' does not match the fixed topology",
                node
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Graph, NodeId};
    use crate::kernels::BranchLengthScale;
    use crate::model::Model;
    use crate::moves::Move;
    use crate::settings::Settings;
    use rand::SeedableRng;

    /// ((t0, t1), t2) with all branches 1.
    fn three_tips() -> Tree {
        Tree::from_parents(&[Some(3), Some(3), Some(4), Some(4), None], &[1.0, 1.0, 1.0, 1.0, 0.0]).unwrap()
    }

    fn ln_normal(x: f64, var: f64) -> f64 {
        -0.5 * (LN_2PI + var.ln() + x * x / var)
    }

    fn evaluate(d: &mut PhyloBrownian, tree: &Tree, tips: &[f64], sigma: f64) -> f64 {
        let tree = Value::Tree(tree.clone());
        let sigma = Value::Real(sigma);
        d.ln_probability(&Value::Vector(tips.to_vec()), &[&tree, &sigma])
    }

    #[test]
    fn test_matches_hand_computed_contrasts() {
        let tree = three_tips();
        let mut d = PhyloBrownian::new();
        let lp = evaluate(&mut d, &tree, &[1.0, 3.0, 0.0], 1.0);
        // contrast t0 - t1 has variance 2; their mean 2 sits on a branch of
        // total variance 0.5 + 1, contrasted with t2 over 1.5 + 1
        let expected = ln_normal(-2.0, 2.0) + ln_normal(2.0, 2.5);
        assert!((lp - expected).abs() < 1e-12, "{} vs {}", lp, expected);
    }

    #[test]
    fn test_tip_change_recomputes_only_its_path() {
        let tree = three_tips();
        let mut d = PhyloBrownian::new();
        evaluate(&mut d, &tree, &[1.0, 3.0, 0.0], 1.0);
        d.keep();

        d.touch(Affecter::Value(Some(&[0])));
        let lp = evaluate(&mut d, &tree, &[1.5, 3.0, 0.0], 1.0);
        let mut recomputed = d.last_recomputed().to_vec();
        recomputed.sort_unstable();
        assert_eq!(recomputed, vec![0, 3, 4]);

        let mut fresh = PhyloBrownian::new();
        assert_eq!(lp, evaluate(&mut fresh, &tree, &[1.5, 3.0, 0.0], 1.0));
    }

    #[test]
    fn test_restore_reactivates_previous_slots() {
        let tree = three_tips();
        let mut d = PhyloBrownian::new();
        let before = evaluate(&mut d, &tree, &[1.0, 3.0, 0.0], 1.0);
        d.keep();
        let slots: Vec<usize> = (0..5).map(|i| d.active_slot(i)).collect();

        d.touch(Affecter::Value(Some(&[2])));
        d.touch(Affecter::Value(Some(&[2])));
        evaluate(&mut d, &tree, &[9.0, 3.0, 0.0], 1.0);
        assert_ne!(d.active_slot(2), slots[2], "dirtied node flips once");
        d.restore();

        let after: Vec<usize> = (0..5).map(|i| d.active_slot(i)).collect();
        assert_eq!(after, slots);
        let clean = evaluate(&mut d, &tree, &[1.0, 3.0, 0.0], 1.0);
        assert!(d.last_recomputed().is_empty(), "restored caches need no work");
        assert_eq!(clean, before);
    }

    #[test]
    fn test_sigma_change_recomputes_everything() {
        let tree = three_tips();
        let mut d = PhyloBrownian::new();
        evaluate(&mut d, &tree, &[1.0, 3.0, 0.0], 1.0);
        d.keep();
        d.touch(Affecter::Parent { slot: 1, elements: None });
        evaluate(&mut d, &tree, &[1.0, 3.0, 0.0], 2.0);
        assert_eq!(d.last_recomputed().len(), 5);
    }

    fn brownian_graph() -> (Graph, NodeId, NodeId) {
        let mut g = Graph::new();
        let rate = g.add_constant("rate", Value::Real(1.0)).unwrap();
        let tree = g
            .add_stochastic(
                "tree",
                ExponentialBranchLengths::new(three_tips()),
                &[rate],
                Value::Tree(three_tips()),
            )
            .unwrap();
        let sigma = g.add_constant("sigma", Value::Real(1.0)).unwrap();
        let x = g
            .add_stochastic("x", PhyloBrownian::new(), &[tree, sigma], Value::Vector(vec![1.0, 3.0, 0.0]))
            .unwrap();
        (g, tree, x)
    }

    #[test]
    fn test_incremental_chain_matches_fresh_evaluation() {
        let (mut g, tree, x) = brownian_graph();
        g.clamp(x, Value::Vector(vec![1.0, 3.0, 0.0])).unwrap();
        let mut model = Model::new(g, &[x]).unwrap();
        let mut mv = Move::new(Box::new(BranchLengthScale::new(tree, 0.5)), 1.0);
        let mut rng = ChaCha8Rng::seed_from_u64(21);
        let settings = Settings {
            verify_restore: true,
            ..Settings::default()
        };

        for _ in 0..500 {
            mv.perform(&mut model, &mut rng, 1.0, &settings);
        }
        let incremental = model.graph_mut().ln_probability(x);
        let current = model.graph().cached_value(tree).clone();
        let mut fresh = PhyloBrownian::new();
        let expected = evaluate_tree(&mut fresh, &current);
        assert!((incremental - expected).abs() < 1e-9, "{} vs {}", incremental, expected);
    }

    fn evaluate_tree(d: &mut PhyloBrownian, tree: &Value) -> f64 {
        let sigma = Value::Real(1.0);
        d.ln_probability(&Value::Vector(vec![1.0, 3.0, 0.0]), &[tree, &sigma])
    }

    #[test]
    fn test_redraw_gives_one_value_per_tip() {
        let (mut g, _, x) = brownian_graph();
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        g.redraw(x, &mut rng);
        g.keep_all();
        assert_eq!(g.cached_value(x).as_vector().len(), 3);
        assert!(g.ln_probability(x).is_finite());
    }
}
