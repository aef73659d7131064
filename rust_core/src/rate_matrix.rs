//! Rate generators and the transition-probability service.

use ndarray::Array2;
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::distributions::{expect_kind, expect_parents, Distribution};
use crate::error::{ModelError, Result};
use crate::value::Value;

/// Validated instantaneous rate matrix of a continuous-time Markov chain:
/// square, non-negative off the diagonal, rows summing to zero.
#[derive(Debug, Clone, PartialEq)]
pub struct RateMatrix {
    rates: Array2<f64>,
}

impl RateMatrix {
    pub fn new(rates: Array2<f64>, tolerance: f64) -> Result<Self> {
        let (rows, cols) = rates.dim();
        if rows != cols || rows == 0 {
            return Err(ModelError::InvalidRateMatrix(format!(
                "expected a non-empty square matrix, got {}x{}",
                rows, cols
            )));
        }
        for (i, row) in rates.rows().into_iter().enumerate() {
            if let Some((j, r)) = row.iter().enumerate().find(|&(j, &r)| j != i && r < 0.0) {
                return Err(ModelError::InvalidRateMatrix(format!(
                    "negative rate {} from state {} to {}",
                    r, i, j
                )));
            }
            let sum: f64 = row.sum();
            if sum.abs() > tolerance {
                return Err(ModelError::InvalidRateMatrix(format!(
                    "row {} sums to {}",
                    i, sum
                )));
            }
        }
        Ok(Self { rates })
    }

    /// Symmetric model with equal rates between all `n` states.
    pub fn jukes_cantor(n: usize) -> Result<Self> {
        let (diag, off) = if n > 1 { (-1.0, 1.0 / (n - 1) as f64) } else { (0.0, 0.0) };
        let rates = Array2::from_shape_fn((n, n), |(i, j)| if i == j { diag } else { off });
        Self::new(rates, 1e-12)
    }

    pub fn num_states(&self) -> usize {
        self.rates.nrows()
    }

    pub fn rates(&self) -> &Array2<f64> {
        &self.rates
    }
}

/// Turns a rate generator, an elapsed time and a rate multiplier into a
/// row-stochastic matrix of transition probabilities.
pub trait TransitionProbabilities: Send + Sync {
    fn transition_probabilities(&self, q: &RateMatrix, time: f64, rate_multiplier: f64) -> Array2<f64>;
}

/// Matrix exponential by scaling and squaring of a truncated Taylor series.
#[derive(Debug, Clone)]
pub struct ScalingSquaring {
    pub taylor_terms: usize,
}

impl Default for ScalingSquaring {
    fn default() -> Self {
        Self { taylor_terms: 12 }
    }
}

impl TransitionProbabilities for ScalingSquaring {
    fn transition_probabilities(&self, q: &RateMatrix, time: f64, rate_multiplier: f64) -> Array2<f64> {
        let n = q.num_states();
        let a = q.rates() * (time * rate_multiplier);

        // infinity norm bounded by 1/2 after scaling
        let norm = a
            .rows()
            .into_iter()
            .map(|r| r.iter().map(|x| x.abs()).sum::<f64>())
            .fold(0.0, f64::max);
        let squarings = if norm > 0.5 {
            (norm / 0.5).log2().ceil() as i32
        } else {
            0
        };
        let a = a / 2f64.powi(squarings);

        let mut p = Array2::<f64>::eye(n);
        let mut term = Array2::<f64>::eye(n);
        for k in 1..=self.taylor_terms {
            term = term.dot(&a) / k as f64;
            p = p + &term;
        }
        for _ in 0..squarings {
            p = p.dot(&p);
        }

        // round-off can leave tiny negatives
        p.mapv_inplace(|x| x.max(0.0));
        for mut row in p.rows_mut() {
            let sum = row.sum();
            if sum > 0.0 {
                row /= sum;
            }
        }
        p
    }
}

/// End state of a chain started in a given state and run for a given time.
///
/// Parents: `[start (integer), time (real), rate multiplier (real)]`.
pub struct DiscreteTransition {
    q: RateMatrix,
    service: Box<dyn TransitionProbabilities>,
    cached: Option<(f64, f64, Array2<f64>)>,
}

impl DiscreteTransition {
    pub fn new(q: RateMatrix, service: impl TransitionProbabilities + 'static) -> Self {
        Self {
            q,
            service: Box::new(service),
            cached: None,
        }
    }

    fn probabilities(&self, time: f64, multiplier: f64) -> Array2<f64> {
        match &self.cached {
            Some((t, m, p)) if *t == time && *m == multiplier => p.clone(),
            _ => self.service.transition_probabilities(&self.q, time, multiplier),
        }
    }
}

impl Distribution for DiscreteTransition {
    fn name(&self) -> &'static str {
        "discrete_transition"
    }

    fn ln_probability(&mut self, value: &Value, parents: &[&Value]) -> f64 {
        let n = self.q.num_states() as i64;
        let (start, end) = (parents[0].as_integer(), value.as_integer());
        let (time, multiplier) = (parents[1].as_real(), parents[2].as_real());
        if !(0..n).contains(&start) || !(0..n).contains(&end) || time < 0.0 || multiplier < 0.0 {
            return f64::NEG_INFINITY;
        }
        let p = self.probabilities(time, multiplier);
        let ln_p = p[[start as usize, end as usize]].ln();
        self.cached = Some((time, multiplier, p));
        ln_p
    }

    fn redraw(&self, parents: &[&Value], rng: &mut ChaCha8Rng) -> Value {
        let start = parents[0].as_integer().max(0) as usize;
        let p = self.probabilities(parents[1].as_real(), parents[2].as_real());
        let u: f64 = rng.gen();
        let mut acc = 0.0;
        for (j, &pj) in p.row(start).iter().enumerate() {
            acc += pj;
            if u < acc {
                return Value::Integer(j as i64);
            }
        }
        Value::Integer(self.q.num_states() as i64 - 1)
    }

    fn check(&self, node: &str, value: &Value, parents: &[&Value]) -> Result<()> {
        expect_kind(node, value, "integer")?;
        expect_parents(node, parents, 3)?;
        expect_kind(node, parents[0], "integer")?;
        let n = self.q.num_states() as i64;
        for state in [value.as_integer(), parents[0].as_integer()] {
            if !(0..n).contains(&state) {
                return Err(ModelError::InvalidParameter {
                    node: node.to_string(),
                    reason: format!("state {} outside 0..{}", state, n),
                });
            }
        }
        Ok(())
    }
}
