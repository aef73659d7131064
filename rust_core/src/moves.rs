use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::model::Model;
use crate::proposal::{Proposal, Proposed};
use crate::settings::Settings;

/// How a single proposal cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    Accepted,
    Rejected,
    /// The kernel could not produce a mutation; no probability was evaluated.
    Aborted,
}

/// Acceptance bookkeeping, overall and since the last tuning point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MoveStats {
    pub tried: usize,
    pub accepted: usize,
    pub aborted: usize,
    tried_since_tune: usize,
    accepted_since_tune: usize,
    aborted_since_tune: usize,
}

impl MoveStats {
    fn record(&mut self, outcome: MoveOutcome) {
        self.tried += 1;
        self.tried_since_tune += 1;
        match outcome {
            MoveOutcome::Accepted => {
                self.accepted += 1;
                self.accepted_since_tune += 1;
            }
            MoveOutcome::Aborted => {
                self.aborted += 1;
                self.aborted_since_tune += 1;
            }
            MoveOutcome::Rejected => {}
        }
    }

    /// Accepted fraction of evaluated proposals. Aborts are not evaluations
    /// and are left out of the denominator.
    pub fn acceptance_rate(&self) -> f64 {
        rate(self.accepted, self.tried - self.aborted)
    }

    fn window_rate(&self) -> Option<f64> {
        let evaluated = self.tried_since_tune - self.aborted_since_tune;
        (evaluated > 0).then(|| rate(self.accepted_since_tune, evaluated))
    }

    fn reset_window(&mut self) {
        self.tried_since_tune = 0;
        self.accepted_since_tune = 0;
        self.aborted_since_tune = 0;
    }
}

fn rate(accepted: usize, evaluated: usize) -> f64 {
    if evaluated == 0 {
        0.0
    } else {
        accepted as f64 / evaluated as f64
    }
}

/// Log acceptance ratio `heat * (ln_new - ln_old) + ln_hastings`.
/// Any NaN or an impossible new state yields negative infinity.
pub fn acceptance_ratio(ln_new: f64, ln_old: f64, ln_hastings: f64, heat: f64) -> f64 {
    if ln_new == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    let ratio = heat * (ln_new - ln_old) + ln_hastings;
    if ratio.is_nan() {
        f64::NEG_INFINITY
    } else {
        ratio
    }
}

/// Metropolis-Hastings rule: accept iff `ln(u) < ratio`.
pub fn accepts(ratio: f64, u: f64) -> bool {
    u.ln() < ratio
}

/// Snapshot of a move for reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveSummary {
    pub name: String,
    pub weight: f64,
    pub tried: usize,
    pub accepted: usize,
    pub aborted: usize,
    pub acceptance_rate: f64,
    pub lambda: Option<f64>,
}

/// A proposal kernel plus the transaction that brackets it.
pub struct Move {
    proposal: Box<dyn Proposal>,
    weight: f64,
    stats: MoveStats,
}

impl Move {
    pub fn new(proposal: Box<dyn Proposal>, weight: f64) -> Self {
        Self {
            proposal,
            weight,
            stats: MoveStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        self.proposal.name()
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn stats(&self) -> &MoveStats {
        &self.stats
    }

    pub fn proposal(&self) -> &dyn Proposal {
        self.proposal.as_ref()
    }

    pub fn proposal_mut(&mut self) -> &mut dyn Proposal {
        self.proposal.as_mut()
    }

    /// Run one propose, evaluate, accept-or-reject cycle.
    ///
    /// Panics if the graph still has touched nodes from an earlier cycle.
    pub fn perform(
        &mut self,
        model: &mut Model,
        rng: &mut ChaCha8Rng,
        heat: f64,
        settings: &Settings,
    ) -> MoveOutcome {
        assert!(
            !model.graph().has_pending_touches(),
            "move '{}' started with unresolved touches",
            self.proposal.name()
        );
        let ln_old = model.total_ln_probability();

        self.proposal.prepare(model.graph(), rng);
        let outcome = match self.proposal.propose(model.graph_mut(), rng) {
            Proposed::Abort => {
                self.proposal.undo(model.graph_mut());
                if model.graph().has_pending_touches() {
                    model.graph_mut().restore_all();
                }
                MoveOutcome::Aborted
            }
            Proposed::Hastings(ln_hastings) => {
                for id in self.proposal.nodes() {
                    model.graph_mut().touch(id);
                }
                let ln_new = model.total_ln_probability();
                let ratio = acceptance_ratio(ln_new, ln_old, ln_hastings, heat);

                if accepts(ratio, rng.gen::<f64>()) {
                    model.graph_mut().keep_all();
                    MoveOutcome::Accepted
                } else {
                    self.proposal.undo(model.graph_mut());
                    model.graph_mut().restore_all();
                    if settings.verify_restore {
                        let restored = model.total_ln_probability();
                        assert!(
                            settings.approx_eq(restored, ln_old),
                            "move '{}' restored ln posterior {} but started from {}",
                            self.proposal.name(),
                            restored,
                            ln_old
                        );
                    }
                    MoveOutcome::Rejected
                }
            }
        };

        tracing::trace!(proposal = %self.proposal.name(), ?outcome, "move performed");
        self.stats.record(outcome);
        outcome
    }

    /// Tune the kernel from the acceptance rate since the last call.
    pub fn auto_tune(&mut self) {
        let Some(rate) = self.stats.window_rate() else {
            return;
        };
        let before = self.proposal.tuning().map(|t| t.lambda);
        self.proposal.tune(rate);
        if let (Some(old), Some(t)) = (before, self.proposal.tuning()) {
            tracing::debug!(
                proposal = %self.proposal.name(),
                rate,
                old,
                new = t.lambda,
                "tuned"
            );
        }
        self.stats.reset_window();
    }

    pub fn reset_stats(&mut self) {
        self.stats = MoveStats::default();
    }

    pub fn summary(&self) -> MoveSummary {
        MoveSummary {
            name: self.proposal.name().to_string(),
            weight: self.weight,
            tried: self.stats.tried,
            accepted: self.stats.accepted,
            aborted: self.stats.aborted,
            acceptance_rate: self.stats.acceptance_rate(),
            lambda: self.proposal.tuning().map(|t| t.lambda),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{Normal, Uniform};
    use crate::graph::{Graph, NodeId};
    use crate::kernels::{ElementSwap, Scale, Slide};
    use crate::value::Value;
    use rand::SeedableRng;

    fn settings() -> Settings {
        Settings {
            verify_restore: true,
            ..Settings::default()
        }
    }

    #[test]
    fn test_acceptance_law() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let trials = 10_000;
        let always = (0..trials).filter(|_| accepts(0.0, rng.gen())).count();
        let never = (0..trials)
            .filter(|_| accepts(f64::NEG_INFINITY, rng.gen()))
            .count();
        assert_eq!(always, trials, "ratio 0 must always accept");
        assert_eq!(never, 0, "ratio -inf must never accept");
    }

    #[test]
    fn test_nan_ratio_is_impossible() {
        assert_eq!(acceptance_ratio(f64::NAN, 0.0, 0.0, 1.0), f64::NEG_INFINITY);
        assert_eq!(
            acceptance_ratio(f64::NEG_INFINITY, f64::NEG_INFINITY, 0.0, 1.0),
            f64::NEG_INFINITY
        );
        assert_eq!(acceptance_ratio(-1.0, -3.0, 0.5, 1.0), 2.5);
    }

    fn flat_model() -> (Model, NodeId) {
        let mut g = Graph::new();
        let x = Uniform::prior(&mut g, "x", -1e6, 1e6).unwrap();
        let model = Model::new(g, &[x]).unwrap();
        (model, x)
    }

    #[test]
    fn test_flat_slide_always_accepts() {
        let (mut model, x) = flat_model();
        let mut mv = Move::new(Box::new(Slide::new(x, 1.0)), 1.0);
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        for _ in 0..1_000 {
            assert_eq!(mv.perform(&mut model, &mut rng, 1.0, &settings()), MoveOutcome::Accepted);
        }
        assert_eq!(mv.stats().acceptance_rate(), 1.0);
    }

    #[test]
    fn test_reject_restores_exact_value() {
        let mut g = Graph::new();
        let x = Uniform::prior(&mut g, "x", 4.99, 5.01).unwrap();
        g.set_value(x, Value::Real(5.0));
        g.keep_all();
        let mut model = Model::new(g, &[x]).unwrap();
        let mut mv = Move::new(Box::new(Scale::new(x, 10.0)), 1.0);
        let mut rng = ChaCha8Rng::seed_from_u64(5);

        let mut rejections = 0;
        for _ in 0..200 {
            let before = model.graph().cached_value(x).as_real();
            if mv.perform(&mut model, &mut rng, 1.0, &settings()) == MoveOutcome::Rejected {
                rejections += 1;
                assert_eq!(model.graph().cached_value(x).as_real().to_bits(), before.to_bits());
            }
        }
        assert!(rejections > 100, "a scale of width 10 should leave the support almost always");
        assert!(!model.graph().has_pending_touches());
    }

    #[test]
    fn test_aborts_are_not_counted_as_rejections() {
        let mut g = Graph::new();
        let mu = g.add_constant("mu", Value::Real(0.0)).unwrap();
        let sd = g.add_constant("sd", Value::Real(1.0)).unwrap();
        let v = g
            .add_stochastic(
                "v",
                crate::distributions::Iid::new(Normal, 1),
                &[mu, sd],
                Value::Vector(vec![0.3]),
            )
            .unwrap();
        let mut model = Model::new(g, &[v]).unwrap();
        let mut mv = Move::new(Box::new(ElementSwap::new(v)), 1.0);
        let mut rng = ChaCha8Rng::seed_from_u64(9);

        for _ in 0..10 {
            assert_eq!(mv.perform(&mut model, &mut rng, 1.0, &settings()), MoveOutcome::Aborted);
        }
        assert_eq!(mv.stats().aborted, 10);
        assert_eq!(mv.stats().acceptance_rate(), 0.0);
        mv.auto_tune();
        assert_eq!(mv.summary().tried, 10);
    }

    #[test]
    fn test_tuning_converges_from_both_sides() {
        for start in [1.0, 1000.0] {
            let mut g = Graph::new();
            let x = Normal::prior(&mut g, "x", 0.0, 1.0).unwrap();
            let mut model = Model::new(g, &[x]).unwrap();
            let mut mv = Move::new(Box::new(Slide::new(x, start)), 1.0);
            let mut rng = ChaCha8Rng::seed_from_u64(17);
            let s = Settings::default();

            for _ in 0..200 {
                for _ in 0..500 {
                    mv.perform(&mut model, &mut rng, 1.0, &s);
                }
                mv.auto_tune();
            }
            mv.reset_stats();
            for _ in 0..20_000 {
                mv.perform(&mut model, &mut rng, 1.0, &s);
            }
            let rate = mv.stats().acceptance_rate();
            assert!(
                (rate - 0.44).abs() < 0.05,
                "start lambda {} ended with acceptance {}",
                start,
                rate
            );
        }
    }

    #[test]
    #[should_panic(expected = "unresolved touches")]
    fn test_open_episode_is_a_protocol_violation() {
        let (mut model, x) = flat_model();
        model.graph_mut().set_value(x, Value::Real(1.0));
        let mut mv = Move::new(Box::new(Slide::new(x, 1.0)), 1.0);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        mv.perform(&mut model, &mut rng, 1.0, &settings());
    }
}
