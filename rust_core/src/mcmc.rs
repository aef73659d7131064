use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::distributions::expect_kind;
use crate::error::{ModelError, Result};
use crate::graph::NodeId;
use crate::model::Model;
use crate::moves::{Move, MoveOutcome, MoveSummary};
use crate::progress::ProgressState;
use crate::proposal::Proposal;
use crate::settings::Settings;

/// Schedule for a single chain.
#[derive(Debug, Clone)]
pub struct McmcConfig {
    /// Iterations recorded after burn-in.
    pub num_iterations: usize,
    pub burn_in: usize,
    /// Burn-in iterations between tuning points. 0 disables tuning.
    pub tuning_interval: usize,
    /// Record every `thinning`-th post-burn-in iteration.
    pub thinning: usize,
    /// Posterior power, 1.0 for the untempered chain.
    pub heat: f64,
    pub settings: Settings,
}

impl Default for McmcConfig {
    fn default() -> Self {
        Self {
            num_iterations: 10_000,
            burn_in: 1_000,
            tuning_interval: 100,
            thinning: 1,
            heat: 1.0,
            settings: Settings::default(),
        }
    }
}

/// Output of one chain.
#[derive(Debug, Clone)]
pub struct ChainResult {
    pub column_names: Vec<String>,
    /// samples[draw][column]
    pub samples: Vec<Vec<f64>>,
    pub ln_posterior: Vec<f64>,
    /// Per recorded draw, the log-likelihood of each likelihood monitor.
    pub ln_likelihoods: Vec<Vec<f64>>,
    pub moves: Vec<MoveSummary>,
    /// Acceptance rate over the post-burn-in phase.
    pub accept_rate: f64,
}

impl ChainResult {
    /// Log pseudo-marginal likelihood: the sum of the log conditional
    /// predictive ordinates of every likelihood monitor.
    pub fn ln_pseudo_marginal_likelihood(&self) -> f64 {
        let num_monitors = self.ln_likelihoods.first().map_or(0, |d| d.len());
        (0..num_monitors)
            .map(|m| {
                let draws: Vec<f64> = self.ln_likelihoods.iter().map(|d| d[m]).collect();
                crate::diagnostics::conditional_predictive_ordinate(&draws)
            })
            .sum()
    }
}

/// One Markov chain: a model, a weighted move schedule and monitors.
pub struct Mcmc {
    model: Model,
    moves: Vec<Move>,
    monitors: Vec<NodeId>,
    likelihood_monitors: Vec<NodeId>,
}

impl Mcmc {
    pub fn new(model: Model) -> Self {
        Self {
            model,
            moves: Vec::new(),
            monitors: Vec::new(),
            likelihood_monitors: Vec::new(),
        }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut Model {
        &mut self.model
    }

    pub fn moves(&self) -> &[Move] {
        &self.moves
    }

    /// Schedule a proposal. Every node it writes must be a free parameter of
    /// the model.
    pub fn add_move<P: Proposal + 'static>(&mut self, proposal: P, weight: f64) -> Result<()> {
        if !(weight > 0.0 && weight.is_finite()) {
            return Err(ModelError::InvalidParameter {
                node: proposal.name().to_string(),
                reason: format!("move weight must be positive, got {}", weight),
            });
        }
        for id in proposal.nodes() {
            self.model.check_target(id)?;
        }
        proposal.check(self.model.graph())?;
        self.moves.push(Move::new(Box::new(proposal), weight));
        Ok(())
    }

    /// Record the value of `id` at every sample.
    pub fn monitor(&mut self, id: NodeId) -> Result<()> {
        if id.0 >= self.model.graph().num_nodes() {
            return Err(ModelError::UnknownNode(id));
        }
        self.monitors.push(id);
        Ok(())
    }

    /// Record the log-probability of a clamped node at every sample, for
    /// predictive-ordinate estimates.
    pub fn monitor_likelihood(&mut self, id: NodeId) -> Result<()> {
        if id.0 >= self.model.graph().num_nodes() {
            return Err(ModelError::UnknownNode(id));
        }
        let node = self.model.graph().node(id);
        if !node.is_stochastic() {
            return Err(ModelError::NotStochastic(node.name().to_string()));
        }
        self.likelihood_monitors.push(id);
        Ok(())
    }

    /// Replace parameter `old` by `new` throughout the model, the move
    /// schedule and the monitors, without rebuilding anything else.
    ///
    /// On error the model, the moves and the monitors are left as they were.
    pub fn swap_parameter(&mut self, old: NodeId, new: NodeId) -> Result<()> {
        let retargeted = self.moves.iter().any(|m| m.proposal().nodes().contains(&old));
        if retargeted {
            self.model.check_writable(new)?;
            let graph = self.model.graph();
            expect_kind(graph.name(new), graph.cached_value(new), graph.cached_value(old).kind())?;
        }
        self.model.swap_parameter(old, new)?;
        if retargeted {
            for m in &mut self.moves {
                m.proposal_mut().swap_node(old, new);
            }
        }
        for id in self.monitors.iter_mut().chain(self.likelihood_monitors.iter_mut()) {
            if *id == old {
                *id = new;
            }
        }
        tracing::info!(
            old = %self.model.graph().name(old),
            new = %self.model.graph().name(new),
            "swapped parameter"
        );
        Ok(())
    }

    fn pick_move(&self, total_weight: f64, rng: &mut ChaCha8Rng) -> usize {
        let mut u = rng.gen::<f64>() * total_weight;
        for (i, m) in self.moves.iter().enumerate() {
            u -= m.weight();
            if u < 0.0 {
                return i;
            }
        }
        self.moves.len() - 1
    }

    fn record(&mut self, result: &mut ChainResult) {
        result.samples.push(self.model.columns(&self.monitors));
        result.ln_posterior.push(self.model.total_ln_probability());
        let graph = self.model.graph_mut();
        result
            .ln_likelihoods
            .push(self.likelihood_monitors.iter().map(|&id| graph.ln_probability(id)).collect());
    }

    /// Run burn-in with periodic tuning, then sample.
    ///
    /// Each iteration performs `round(total weight)` moves, chosen in
    /// proportion to their weights.
    pub fn run(
        &mut self,
        config: &McmcConfig,
        rng: &mut ChaCha8Rng,
        progress: Option<&ProgressState>,
    ) -> Result<ChainResult> {
        if self.moves.is_empty() {
            return Err(ModelError::EmptySchedule);
        }
        let total_weight: f64 = self.moves.iter().map(|m| m.weight()).sum();
        let picks = (total_weight.round() as usize).max(1);
        let thinning = config.thinning.max(1);

        tracing::info!(
            moves = self.moves.len(),
            picks,
            burn_in = config.burn_in,
            iterations = config.num_iterations,
            "starting chain"
        );

        let mut result = ChainResult {
            column_names: self.model.column_names(&self.monitors),
            samples: Vec::with_capacity(config.num_iterations / thinning + 1),
            ln_posterior: Vec::new(),
            ln_likelihoods: Vec::new(),
            moves: Vec::new(),
            accept_rate: 0.0,
        };
        let (mut accepted, mut evaluated) = (0usize, 0usize);

        for iter in 0..config.burn_in + config.num_iterations {
            let sampling = iter >= config.burn_in;
            for _ in 0..picks {
                let i = self.pick_move(total_weight, rng);
                let outcome = self.moves[i].perform(&mut self.model, rng, config.heat, &config.settings);
                if let Some(p) = progress {
                    p.record(outcome);
                }
                if sampling {
                    match outcome {
                        MoveOutcome::Accepted => {
                            accepted += 1;
                            evaluated += 1;
                        }
                        MoveOutcome::Rejected => evaluated += 1,
                        MoveOutcome::Aborted => {}
                    }
                }
            }

            if !sampling
                && config.tuning_interval > 0
                && (iter + 1) % config.tuning_interval == 0
            {
                for m in &mut self.moves {
                    m.auto_tune();
                }
            }
            if sampling && (iter - config.burn_in) % thinning == 0 {
                self.record(&mut result);
            }
            if let Some(p) = progress {
                p.increment();
            }
        }

        result.moves = self.moves.iter().map(Move::summary).collect();
        result.accept_rate = if evaluated == 0 {
            0.0
        } else {
            accepted as f64 / evaluated as f64
        };
        tracing::info!(
            samples = result.samples.len(),
            accept_rate = result.accept_rate,
            "chain finished"
        );
        Ok(result)
    }
}
