use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution as _, Exp, Gamma as GammaSampler, LogNormal as LogNormalSampler};
use rand_distr::Normal as NormalSampler;
use statrs::function::gamma::ln_gamma;

use crate::error::{ModelError, Result};
use crate::events::OrderedEvents;
use crate::graph::{Graph, NodeId};
use crate::value::Value;

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

/// What caused a stochastic node to be touched.
#[derive(Debug, Clone, Copy)]
pub enum Affecter<'a> {
    /// The node's own value changed. `None` means the whole value.
    Value(Option<&'a [usize]>),
    /// The parent in position `slot` changed, possibly only some elements.
    Parent {
        slot: usize,
        elements: Option<&'a [usize]>,
    },
}

/// Probability density attached to a stochastic node.
///
/// `ln_probability` takes `&mut self` so structured implementations can keep
/// their own incremental caches. Those caches follow the node through
/// `touch`, `keep` and `restore`; scalar densities ignore the hooks.
pub trait Distribution: Send {
    fn name(&self) -> &'static str;

    /// Log-density of `value` given the parents. Impossible combinations
    /// return negative infinity.
    fn ln_probability(&mut self, value: &Value, parents: &[&Value]) -> f64;

    fn redraw(&self, parents: &[&Value], rng: &mut ChaCha8Rng) -> Value;

    fn supports_closed_form_probability(&self) -> bool {
        true
    }

    /// Validate value and parent shapes when the node is assembled.
    fn check(&self, _node: &str, _value: &Value, _parents: &[&Value]) -> Result<()> {
        Ok(())
    }

    fn touch(&mut self, _affecter: Affecter<'_>) {}

    fn keep(&mut self) {}

    fn restore(&mut self) {}
}

/// Univariate density over reals, parameterized by real-valued parents.
pub trait ScalarDensity: Send {
    fn name(&self) -> &'static str;
    fn num_parameters(&self) -> usize;
    fn ln_density(&self, x: f64, params: &[f64]) -> f64;
    fn sample(&self, params: &[f64], rng: &mut ChaCha8Rng) -> f64;
}

pub(crate) fn expect_kind(node: &str, value: &Value, expected: &'static str) -> Result<()> {
    if value.kind() == expected {
        Ok(())
    } else {
        Err(ModelError::TypeMismatch {
            node: node.to_string(),
            expected,
            found: value.kind(),
        })
    }
}

pub(crate) fn expect_parents(node: &str, parents: &[&Value], expected: usize) -> Result<()> {
    if parents.len() == expected {
        Ok(())
    } else {
        Err(ModelError::LengthMismatch {
            what: format!("parents of {}", node),
            expected,
            found: parents.len(),
        })
    }
}

fn check_scalar_parents(node: &str, parents: &[&Value], expected: usize) -> Result<()> {
    expect_parents(node, parents, expected)?;
    for p in parents {
        if !matches!(p, Value::Real(_) | Value::Integer(_)) {
            return Err(ModelError::TypeMismatch {
                node: node.to_string(),
                expected: "real parameter",
                found: p.kind(),
            });
        }
    }
    Ok(())
}

fn real_params(parents: &[&Value]) -> Vec<f64> {
    parents.iter().map(|p| p.as_real()).collect()
}

macro_rules! scalar_distribution {
    ($($ty:ident),* $(,)?) => {$(
        impl Distribution for $ty {
            fn name(&self) -> &'static str {
                ScalarDensity::name(self)
            }

            fn ln_probability(&mut self, value: &Value, parents: &[&Value]) -> f64 {
                self.ln_density(value.as_real(), &real_params(parents))
            }

            fn redraw(&self, parents: &[&Value], rng: &mut ChaCha8Rng) -> Value {
                Value::Real(self.sample(&real_params(parents), rng))
            }

            fn check(&self, node: &str, value: &Value, parents: &[&Value]) -> Result<()> {
                expect_kind(node, value, "real")?;
                check_scalar_parents(node, parents, self.num_parameters())
            }
        }
    )*};
}

// ── Normal (mu, sigma) ──────────────────────────────────────────────

pub struct Normal;

impl Normal {
    /// Stochastic node with constant hyperparameters, initialized at the mean.
    pub fn prior(graph: &mut Graph, name: &str, mu: f64, sigma: f64) -> Result<NodeId> {
        let mu_node = graph.add_constant(&format!("{}.mu", name), Value::Real(mu))?;
        let sigma_node = graph.add_constant(&format!("{}.sigma", name), Value::Real(sigma))?;
        graph.add_stochastic(name, Normal, &[mu_node, sigma_node], Value::Real(mu))
    }
}

impl ScalarDensity for Normal {
    fn name(&self) -> &'static str {
        "normal"
    }

    fn num_parameters(&self) -> usize {
        2
    }

    fn ln_density(&self, x: f64, params: &[f64]) -> f64 {
        let (mu, sigma) = (params[0], params[1]);
        if sigma <= 0.0 {
            return f64::NEG_INFINITY;
        }
        let z = (x - mu) / sigma;
        -0.5 * z * z - sigma.ln() - LN_SQRT_2PI
    }

    fn sample(&self, params: &[f64], rng: &mut ChaCha8Rng) -> f64 {
        NormalSampler::new(params[0], params[1])
            .map(|d| d.sample(rng))
            .unwrap_or(params[0])
    }
}

// ── LogNormal (x > 0) ───────────────────────────────────────────────

pub struct LogNormal;

impl LogNormal {
    pub fn prior(graph: &mut Graph, name: &str, mu: f64, sigma: f64) -> Result<NodeId> {
        let mu_node = graph.add_constant(&format!("{}.mu", name), Value::Real(mu))?;
        let sigma_node = graph.add_constant(&format!("{}.sigma", name), Value::Real(sigma))?;
        graph.add_stochastic(name, LogNormal, &[mu_node, sigma_node], Value::Real(mu.exp()))
    }
}

impl ScalarDensity for LogNormal {
    fn name(&self) -> &'static str {
        "lognormal"
    }

    fn num_parameters(&self) -> usize {
        2
    }

    fn ln_density(&self, x: f64, params: &[f64]) -> f64 {
        let (mu, sigma) = (params[0], params[1]);
        if x <= 0.0 || sigma <= 0.0 {
            return f64::NEG_INFINITY;
        }
        let z = (x.ln() - mu) / sigma;
        -0.5 * z * z - sigma.ln() - x.ln() - LN_SQRT_2PI
    }

    fn sample(&self, params: &[f64], rng: &mut ChaCha8Rng) -> f64 {
        LogNormalSampler::new(params[0], params[1])
            .map(|d| d.sample(rng))
            .unwrap_or(params[0].exp())
    }
}

// ── Exponential (rate) ──────────────────────────────────────────────

pub struct Exponential;

impl Exponential {
    pub fn prior(graph: &mut Graph, name: &str, rate: f64) -> Result<NodeId> {
        let rate_node = graph.add_constant(&format!("{}.rate", name), Value::Real(rate))?;
        graph.add_stochastic(name, Exponential, &[rate_node], Value::Real(1.0 / rate))
    }
}

impl ScalarDensity for Exponential {
    fn name(&self) -> &'static str {
        "exponential"
    }

    fn num_parameters(&self) -> usize {
        1
    }

    fn ln_density(&self, x: f64, params: &[f64]) -> f64 {
        let rate = params[0];
        if x < 0.0 || rate <= 0.0 {
            return f64::NEG_INFINITY;
        }
        rate.ln() - rate * x
    }

    fn sample(&self, params: &[f64], rng: &mut ChaCha8Rng) -> f64 {
        Exp::new(params[0]).map(|d| d.sample(rng)).unwrap_or(0.0)
    }
}

// ── Gamma (shape, rate) ─────────────────────────────────────────────

pub struct Gamma;

impl Gamma {
    pub fn prior(graph: &mut Graph, name: &str, shape: f64, rate: f64) -> Result<NodeId> {
        let shape_node = graph.add_constant(&format!("{}.shape", name), Value::Real(shape))?;
        let rate_node = graph.add_constant(&format!("{}.rate", name), Value::Real(rate))?;
        graph.add_stochastic(name, Gamma, &[shape_node, rate_node], Value::Real(shape / rate))
    }
}

impl ScalarDensity for Gamma {
    fn name(&self) -> &'static str {
        "gamma"
    }

    fn num_parameters(&self) -> usize {
        2
    }

    fn ln_density(&self, x: f64, params: &[f64]) -> f64 {
        let (shape, rate) = (params[0], params[1]);
        if x <= 0.0 || shape <= 0.0 || rate <= 0.0 {
            return f64::NEG_INFINITY;
        }
        shape * rate.ln() - ln_gamma(shape) + (shape - 1.0) * x.ln() - rate * x
    }

    fn sample(&self, params: &[f64], rng: &mut ChaCha8Rng) -> f64 {
        GammaSampler::new(params[0], 1.0 / params[1])
            .map(|d| d.sample(rng))
            .unwrap_or(params[0] / params[1])
    }
}

// ── Uniform (lower <= x <= upper) ───────────────────────────────────

pub struct Uniform;

impl Uniform {
    pub fn prior(graph: &mut Graph, name: &str, lower: f64, upper: f64) -> Result<NodeId> {
        let lower_node = graph.add_constant(&format!("{}.lower", name), Value::Real(lower))?;
        let upper_node = graph.add_constant(&format!("{}.upper", name), Value::Real(upper))?;
        let mid = 0.5 * (lower + upper);
        graph.add_stochastic(name, Uniform, &[lower_node, upper_node], Value::Real(mid))
    }
}

impl ScalarDensity for Uniform {
    fn name(&self) -> &'static str {
        "uniform"
    }

    fn num_parameters(&self) -> usize {
        2
    }

    fn ln_density(&self, x: f64, params: &[f64]) -> f64 {
        let (lower, upper) = (params[0], params[1]);
        if !(lower < upper) || x < lower || x > upper {
            return f64::NEG_INFINITY;
        }
        -(upper - lower).ln()
    }

    fn sample(&self, params: &[f64], rng: &mut ChaCha8Rng) -> f64 {
        let (lower, upper) = (params[0], params[1]);
        lower + (upper - lower) * rng.gen::<f64>()
    }
}

scalar_distribution!(Normal, LogNormal, Exponential, Gamma, Uniform);

// ── Iid vector of a scalar density ──────────────────────────────────

/// `len` independent draws sharing the same parameters.
pub struct Iid<D> {
    density: D,
    len: usize,
}

impl<D: ScalarDensity> Iid<D> {
    pub fn new(density: D, len: usize) -> Self {
        Self { density, len }
    }
}

impl<D: ScalarDensity> Distribution for Iid<D> {
    fn name(&self) -> &'static str {
        "iid"
    }

    fn ln_probability(&mut self, value: &Value, parents: &[&Value]) -> f64 {
        let params = real_params(parents);
        value
            .as_vector()
            .iter()
            .map(|&x| self.density.ln_density(x, &params))
            .sum()
    }

    fn redraw(&self, parents: &[&Value], rng: &mut ChaCha8Rng) -> Value {
        let params = real_params(parents);
        Value::Vector((0..self.len).map(|_| self.density.sample(&params, rng)).collect())
    }

    fn check(&self, node: &str, value: &Value, parents: &[&Value]) -> Result<()> {
        expect_kind(node, value, "vector")?;
        if value.as_vector().len() != self.len {
            return Err(ModelError::LengthMismatch {
                what: node.to_string(),
                expected: self.len,
                found: value.as_vector().len(),
            });
        }
        check_scalar_parents(node, parents, self.density.num_parameters())
    }
}

// ── Marked Poisson events on [0, horizon] ───────────────────────────

/// Events arrive at the parent rate; marks are exponential with `mark_rate`.
pub struct MarkedPoissonEvents {
    pub horizon: f64,
    pub mark_rate: f64,
    pub tolerance: f64,
}

impl MarkedPoissonEvents {
    pub fn new(horizon: f64, mark_rate: f64, tolerance: f64) -> Self {
        Self {
            horizon,
            mark_rate,
            tolerance,
        }
    }

    pub fn ln_mark_density(&self, mark: f64) -> f64 {
        Exponential.ln_density(mark, &[self.mark_rate])
    }
}

impl Distribution for MarkedPoissonEvents {
    fn name(&self) -> &'static str {
        "marked_poisson_events"
    }

    fn ln_probability(&mut self, value: &Value, parents: &[&Value]) -> f64 {
        let rate = parents[0].as_real();
        let events = value.as_events();
        if rate <= 0.0 {
            return if events.is_empty() { 0.0 } else { f64::NEG_INFINITY };
        }
        let k = events.len() as f64;
        let marks: f64 = events
            .events()
            .iter()
            .map(|e| self.ln_mark_density(e.mark))
            .sum();
        k * rate.ln() - rate * events.horizon() + marks
    }

    fn redraw(&self, parents: &[&Value], rng: &mut ChaCha8Rng) -> Value {
        let rate = parents[0].as_real();
        let mut events = OrderedEvents::new(self.horizon, self.tolerance);
        if let (Ok(gaps), Ok(marks)) = (Exp::new(rate), Exp::new(self.mark_rate)) {
            let mut t = 0.0;
            loop {
                t += gaps.sample(rng);
                if t > self.horizon {
                    break;
                }
                events.add_event(t, marks.sample(rng));
            }
        }
        Value::Events(events)
    }

    fn check(&self, node: &str, value: &Value, parents: &[&Value]) -> Result<()> {
        expect_kind(node, value, "events")?;
        check_scalar_parents(node, parents, 1)?;
        if (value.as_events().horizon() - self.horizon).abs() > self.tolerance {
            return Err(ModelError::InvalidParameter {
                node: node.to_string(),
                reason: format!(
                    "event horizon {} differs from distribution horizon {}",
                    value.as_events().horizon(),
                    self.horizon
                ),
            });
        }
        Ok(())
    }
}
