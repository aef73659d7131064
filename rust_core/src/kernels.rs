//! Concrete proposal kernels.
//!
//! Every kernel checks whether it can act before touching the graph, so an
//! abort usually leaves no open episode behind.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution as _, Exp};

use crate::distributions::expect_kind;
use crate::error::Result;
use crate::events::Event;
use crate::graph::{Graph, NodeId};
use crate::proposal::{Proposal, Proposed, Tuning};
use crate::value::Value;

fn expect_target(graph: &Graph, target: NodeId, kind: &'static str) -> Result<()> {
    expect_kind(graph.name(target), graph.cached_value(target), kind)
}

fn retarget(target: &mut NodeId, old: NodeId, new: NodeId) {
    if *target == old {
        *target = new;
    }
}

/// Multiplier `exp(lambda * (u - 0.5))` and its log.
fn scale_factor(lambda: f64, rng: &mut ChaCha8Rng) -> (f64, f64) {
    let u: f64 = rng.gen();
    let ln_f = lambda * (u - 0.5);
    (ln_f.exp(), ln_f)
}

// ── Slide ───────────────────────────────────────────────────────────

/// Symmetric additive window on a real-valued node.
pub struct Slide {
    target: NodeId,
    tuning: Tuning,
    stored: f64,
}

impl Slide {
    pub fn new(target: NodeId, lambda: f64) -> Self {
        Self::with_tuning(target, Tuning::new(lambda))
    }

    pub fn with_tuning(target: NodeId, tuning: Tuning) -> Self {
        Self {
            target,
            tuning,
            stored: 0.0,
        }
    }
}

impl Proposal for Slide {
    fn name(&self) -> &str {
        "slide"
    }

    fn nodes(&self) -> Vec<NodeId> {
        vec![self.target]
    }

    fn check(&self, graph: &Graph) -> Result<()> {
        expect_target(graph, self.target, "real")
    }

    fn propose(&mut self, graph: &mut Graph, rng: &mut ChaCha8Rng) -> Proposed {
        let u: f64 = rng.gen();
        let delta = self.tuning.lambda * (u - 0.5);
        self.stored = graph.update_value(self.target, None, |v| {
            let old = v.as_real();
            *v = Value::Real(old + delta);
            old
        });
        Proposed::Hastings(0.0)
    }

    fn undo(&mut self, graph: &mut Graph) {
        graph.set_value(self.target, Value::Real(self.stored));
    }

    fn tuning(&self) -> Option<&Tuning> {
        Some(&self.tuning)
    }

    fn tuning_mut(&mut self) -> Option<&mut Tuning> {
        Some(&mut self.tuning)
    }

    fn swap_node(&mut self, old: NodeId, new: NodeId) {
        retarget(&mut self.target, old, new);
    }
}

// ── Scale ───────────────────────────────────────────────────────────

/// Multiplicative move on a real-valued node.
pub struct Scale {
    target: NodeId,
    tuning: Tuning,
    stored: f64,
}

impl Scale {
    pub fn new(target: NodeId, lambda: f64) -> Self {
        Self {
            target,
            tuning: Tuning::new(lambda),
            stored: 0.0,
        }
    }
}

impl Proposal for Scale {
    fn name(&self) -> &str {
        "scale"
    }

    fn nodes(&self) -> Vec<NodeId> {
        vec![self.target]
    }

    fn check(&self, graph: &Graph) -> Result<()> {
        expect_target(graph, self.target, "real")
    }

    fn propose(&mut self, graph: &mut Graph, rng: &mut ChaCha8Rng) -> Proposed {
        let (f, ln_f) = scale_factor(self.tuning.lambda, rng);
        self.stored = graph.update_value(self.target, None, |v| {
            let old = v.as_real();
            *v = Value::Real(old * f);
            old
        });
        Proposed::Hastings(ln_f)
    }

    fn undo(&mut self, graph: &mut Graph) {
        graph.set_value(self.target, Value::Real(self.stored));
    }

    fn tuning(&self) -> Option<&Tuning> {
        Some(&self.tuning)
    }

    fn tuning_mut(&mut self) -> Option<&mut Tuning> {
        Some(&mut self.tuning)
    }

    fn swap_node(&mut self, old: NodeId, new: NodeId) {
        retarget(&mut self.target, old, new);
    }
}

// ── ElementScale ────────────────────────────────────────────────────

/// Scales one randomly chosen element of a vector node.
pub struct ElementScale {
    target: NodeId,
    tuning: Tuning,
    index: Option<usize>,
    stored: f64,
}

impl ElementScale {
    pub fn new(target: NodeId, lambda: f64) -> Self {
        Self {
            target,
            tuning: Tuning::new(lambda),
            index: None,
            stored: 0.0,
        }
    }
}

impl Proposal for ElementScale {
    fn name(&self) -> &str {
        "element_scale"
    }

    fn nodes(&self) -> Vec<NodeId> {
        vec![self.target]
    }

    fn check(&self, graph: &Graph) -> Result<()> {
        expect_target(graph, self.target, "vector")
    }

    fn prepare(&mut self, graph: &Graph, rng: &mut ChaCha8Rng) {
        let len = graph.cached_value(self.target).as_vector().len();
        self.index = (len > 0).then(|| rng.gen_range(0..len));
    }

    fn propose(&mut self, graph: &mut Graph, rng: &mut ChaCha8Rng) -> Proposed {
        let Some(i) = self.index else {
            return Proposed::Abort;
        };
        let (f, ln_f) = scale_factor(self.tuning.lambda, rng);
        self.stored = graph.update_value(self.target, Some(&[i]), |v| {
            let x = &mut v.as_vector_mut()[i];
            let old = *x;
            *x *= f;
            old
        });
        Proposed::Hastings(ln_f)
    }

    fn undo(&mut self, graph: &mut Graph) {
        if let Some(i) = self.index.take() {
            let stored = self.stored;
            graph.update_value(self.target, Some(&[i]), |v| v.as_vector_mut()[i] = stored);
        }
    }

    fn tuning(&self) -> Option<&Tuning> {
        Some(&self.tuning)
    }

    fn tuning_mut(&mut self) -> Option<&mut Tuning> {
        Some(&mut self.tuning)
    }

    fn swap_node(&mut self, old: NodeId, new: NodeId) {
        retarget(&mut self.target, old, new);
    }
}

// ── ElementSwap ─────────────────────────────────────────────────────

/// Exchanges two distinct elements of a vector node.
pub struct ElementSwap {
    target: NodeId,
    pair: Option<(usize, usize)>,
}

impl ElementSwap {
    pub fn new(target: NodeId) -> Self {
        Self { target, pair: None }
    }
}

impl Proposal for ElementSwap {
    fn name(&self) -> &str {
        "element_swap"
    }

    fn nodes(&self) -> Vec<NodeId> {
        vec![self.target]
    }

    fn check(&self, graph: &Graph) -> Result<()> {
        expect_target(graph, self.target, "vector")
    }

    fn prepare(&mut self, graph: &Graph, rng: &mut ChaCha8Rng) {
        let len = graph.cached_value(self.target).as_vector().len();
        self.pair = if len < 2 {
            None
        } else {
            let i = rng.gen_range(0..len);
            let j = (i + rng.gen_range(1..len)) % len;
            Some((i, j))
        };
    }

    fn propose(&mut self, graph: &mut Graph, _rng: &mut ChaCha8Rng) -> Proposed {
        let Some((i, j)) = self.pair else {
            return Proposed::Abort;
        };
        graph.update_value(self.target, Some(&[i, j]), |v| v.as_vector_mut().swap(i, j));
        Proposed::Hastings(0.0)
    }

    fn undo(&mut self, graph: &mut Graph) {
        if let Some((i, j)) = self.pair.take() {
            graph.update_value(self.target, Some(&[i, j]), |v| v.as_vector_mut().swap(i, j));
        }
    }

    fn swap_node(&mut self, old: NodeId, new: NodeId) {
        retarget(&mut self.target, old, new);
    }
}

// ── EventScale ──────────────────────────────────────────────────────

/// Scales the mark of one event of an events node.
pub struct EventScale {
    target: NodeId,
    tuning: Tuning,
    chosen: Option<Event>,
}

impl EventScale {
    pub fn new(target: NodeId, lambda: f64) -> Self {
        Self {
            target,
            tuning: Tuning::new(lambda),
            chosen: None,
        }
    }
}

impl Proposal for EventScale {
    fn name(&self) -> &str {
        "event_scale"
    }

    fn nodes(&self) -> Vec<NodeId> {
        vec![self.target]
    }

    fn check(&self, graph: &Graph) -> Result<()> {
        expect_target(graph, self.target, "events")
    }

    fn prepare(&mut self, graph: &Graph, rng: &mut ChaCha8Rng) {
        let events = graph.cached_value(self.target).as_events();
        self.chosen = if events.is_empty() {
            None
        } else {
            events.get(rng.gen_range(0..events.len())).copied()
        };
    }

    fn propose(&mut self, graph: &mut Graph, rng: &mut ChaCha8Rng) -> Proposed {
        let Some(event) = self.chosen else {
            return Proposed::Abort;
        };
        let (f, ln_f) = scale_factor(self.tuning.lambda, rng);
        let changed = graph.update_value(self.target, None, |v| {
            v.as_events_mut().change_event(event.time, event.mark * f)
        });
        if changed {
            Proposed::Hastings(ln_f)
        } else {
            self.chosen = None;
            Proposed::Abort
        }
    }

    fn undo(&mut self, graph: &mut Graph) {
        if let Some(event) = self.chosen.take() {
            graph.update_value(self.target, None, |v| {
                v.as_events_mut().change_event(event.time, event.mark)
            });
        }
    }

    fn tuning(&self) -> Option<&Tuning> {
        Some(&self.tuning)
    }

    fn tuning_mut(&mut self) -> Option<&mut Tuning> {
        Some(&mut self.tuning)
    }

    fn swap_node(&mut self, old: NodeId, new: NodeId) {
        retarget(&mut self.target, old, new);
    }
}

// ── EventBirthDeath ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Jump {
    Birth(f64),
    Death(Event),
}

/// Reversible-jump insertion or deletion of one event, each with
/// probability one half. New times are uniform on the horizon and new marks
/// exponential with `mark_rate`.
pub struct EventBirthDeath {
    target: NodeId,
    mark_rate: f64,
    last: Option<Jump>,
}

impl EventBirthDeath {
    pub fn new(target: NodeId, mark_rate: f64) -> Self {
        Self {
            target,
            mark_rate,
            last: None,
        }
    }

    fn ln_mark_density(&self, mark: f64) -> f64 {
        self.mark_rate.ln() - self.mark_rate * mark
    }
}

impl Proposal for EventBirthDeath {
    fn name(&self) -> &str {
        "event_birth_death"
    }

    fn nodes(&self) -> Vec<NodeId> {
        vec![self.target]
    }

    fn check(&self, graph: &Graph) -> Result<()> {
        expect_target(graph, self.target, "events")
    }

    fn propose(&mut self, graph: &mut Graph, rng: &mut ChaCha8Rng) -> Proposed {
        self.last = None;
        let (horizon, k) = {
            let events = graph.cached_value(self.target).as_events();
            (events.horizon(), events.len())
        };

        if rng.gen::<f64>() < 0.5 {
            let time = rng.gen::<f64>() * horizon;
            let Ok(marks) = Exp::new(self.mark_rate) else {
                return Proposed::Abort;
            };
            let mark = marks.sample(rng);
            let collides = graph
                .cached_value(self.target)
                .as_events()
                .index_of(time)
                .is_some();
            if collides {
                return Proposed::Abort;
            }
            graph.update_value(self.target, None, |v| v.as_events_mut().add_event(time, mark));
            self.last = Some(Jump::Birth(time));
            Proposed::Hastings(horizon.ln() - ((k + 1) as f64).ln() - self.ln_mark_density(mark))
        } else {
            if k == 0 {
                return Proposed::Abort;
            }
            let index = rng.gen_range(0..k);
            let removed = graph.update_value(self.target, None, |v| v.as_events_mut().remove_event(index));
            self.last = Some(Jump::Death(removed));
            Proposed::Hastings((k as f64).ln() - horizon.ln() + self.ln_mark_density(removed.mark))
        }
    }

    fn undo(&mut self, graph: &mut Graph) {
        match self.last.take() {
            Some(Jump::Birth(time)) => {
                graph.update_value(self.target, None, |v| {
                    let events = v.as_events_mut();
                    if let Some(i) = events.index_of(time) {
                        events.remove_event(i);
                    }
                });
            }
            Some(Jump::Death(event)) => {
                graph.update_value(self.target, None, |v| {
                    v.as_events_mut().add_event(event.time, event.mark)
                });
            }
            None => {}
        }
    }

    fn swap_node(&mut self, old: NodeId, new: NodeId) {
        retarget(&mut self.target, old, new);
    }
}

// ── BranchLengthScale ───────────────────────────────────────────────

/// Scales the length of one non-root branch of a tree node, touching only
/// that branch.
pub struct BranchLengthScale {
    target: NodeId,
    tuning: Tuning,
    branch: Option<usize>,
    stored: f64,
}

impl BranchLengthScale {
    pub fn new(target: NodeId, lambda: f64) -> Self {
        Self {
            target,
            tuning: Tuning::new(lambda),
            branch: None,
            stored: 0.0,
        }
    }
}

impl Proposal for BranchLengthScale {
    fn name(&self) -> &str {
        "branch_length_scale"
    }

    fn nodes(&self) -> Vec<NodeId> {
        vec![self.target]
    }

    fn check(&self, graph: &Graph) -> Result<()> {
        expect_target(graph, self.target, "tree")
    }

    fn prepare(&mut self, graph: &Graph, rng: &mut ChaCha8Rng) {
        let tree = graph.cached_value(self.target).as_tree();
        let n = tree.num_nodes();
        self.branch = if n < 2 {
            None
        } else {
            let pick = rng.gen_range(0..n - 1);
            Some(if pick >= tree.root() { pick + 1 } else { pick })
        };
    }

    fn propose(&mut self, graph: &mut Graph, rng: &mut ChaCha8Rng) -> Proposed {
        let Some(b) = self.branch else {
            return Proposed::Abort;
        };
        let (f, ln_f) = scale_factor(self.tuning.lambda, rng);
        self.stored = graph.update_value(self.target, Some(&[b]), |v| {
            let tree = v.as_tree_mut();
            let old = tree.branch_length(b);
            tree.set_branch_length(b, old * f);
            old
        });
        Proposed::Hastings(ln_f)
    }

    fn undo(&mut self, graph: &mut Graph) {
        if let Some(b) = self.branch.take() {
            let stored = self.stored;
            graph.update_value(self.target, Some(&[b]), |v| v.as_tree_mut().set_branch_length(b, stored));
        }
    }

    fn tuning(&self) -> Option<&Tuning> {
        Some(&self.tuning)
    }

    fn tuning_mut(&mut self) -> Option<&mut Tuning> {
        Some(&mut self.tuning)
    }

    fn swap_node(&mut self, old: NodeId, new: NodeId) {
        retarget(&mut self.target, old, new);
    }
}
