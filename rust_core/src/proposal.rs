//! The proposal capability driven by [`crate::moves::Move`].

use rand_chacha::ChaCha8Rng;

use crate::error::Result;
use crate::graph::{Graph, NodeId};
use crate::settings::Settings;

/// Result of a single `propose` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Proposed {
    /// A mutation was made; the payload is ln q(old|new) - ln q(new|old).
    Hastings(f64),
    /// No valid mutation exists this cycle. The move skips evaluation.
    Abort,
}

/// Tunable scale of a proposal.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuning {
    pub lambda: f64,
    pub target: f64,
    pub max: f64,
}

impl Tuning {
    pub fn new(lambda: f64) -> Self {
        Self::with_settings(lambda, &Settings::default())
    }

    pub fn with_settings(lambda: f64, settings: &Settings) -> Self {
        Self {
            lambda,
            target: settings.default_target_acceptance,
            max: settings.max_tuning_parameter,
        }
    }

    pub fn with_target(mut self, target: f64) -> Self {
        self.target = target;
        self
    }

    /// Move `lambda` toward the target acceptance rate: grow it when moves
    /// are accepted too often, shrink it otherwise.
    pub fn tune(&mut self, rate: f64) {
        let p = self.target;
        if rate > p {
            self.lambda *= 1.0 + (rate - p) / (1.0 - p);
        } else {
            self.lambda /= 2.0 - rate / p;
        }
        self.lambda = self.lambda.min(self.max);
    }
}

/// A strategy that mutates one or more node values in place.
///
/// Kernels write through [`Graph::update_value`], which touches the target,
/// and keep just enough state between `propose` and `undo` to revert their
/// own change.
pub trait Proposal: Send {
    fn name(&self) -> &str;

    /// Nodes whose values this kernel writes.
    fn nodes(&self) -> Vec<NodeId>;

    /// Reject targets whose value kind the kernel cannot write.
    fn check(&self, graph: &Graph) -> Result<()>;

    /// Bookkeeping before mutation, such as choosing an element.
    fn prepare(&mut self, _graph: &Graph, _rng: &mut ChaCha8Rng) {}

    fn propose(&mut self, graph: &mut Graph, rng: &mut ChaCha8Rng) -> Proposed;

    /// Revert the last `propose`. Safe to call after an abort.
    fn undo(&mut self, graph: &mut Graph);

    fn tuning(&self) -> Option<&Tuning> {
        None
    }

    fn tuning_mut(&mut self) -> Option<&mut Tuning> {
        None
    }

    fn tune(&mut self, rate: f64) {
        if let Some(t) = self.tuning_mut() {
            t.tune(rate);
        }
    }

    /// Retarget the kernel after a parameter swap.
    fn swap_node(&mut self, old: NodeId, new: NodeId);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tune_grows_when_accepting_too_often() {
        let mut t = Tuning::new(1.0);
        t.tune(0.72);
        assert!((t.lambda - 1.5).abs() < 1e-12, "lambda was {}", t.lambda);
    }

    #[test]
    fn test_tune_shrinks_when_rejecting() {
        let mut t = Tuning::new(1.0);
        t.tune(0.0);
        assert!((t.lambda - 0.5).abs() < 1e-12);
        t.tune(0.22);
        assert!((t.lambda - 0.5 / 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_tune_at_target_is_stationary() {
        let mut t = Tuning::new(2.0);
        t.tune(0.44);
        assert!((t.lambda - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_tune_respects_upper_bound() {
        let mut t = Tuning::new(9_000.0);
        t.tune(1.0);
        assert_eq!(t.lambda, 10_000.0);
    }
}
