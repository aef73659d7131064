use crate::distributions::{expect_kind, expect_parents};
use crate::error::{ModelError, Result};
use crate::value::Value;

/// Deterministic transformation of parent values.
pub trait Function: Send {
    fn name(&self) -> &'static str;

    fn compute(&self, parents: &[&Value]) -> Value;

    /// Validate parent shapes when the node is assembled.
    fn check(&self, _node: &str, _parents: &[&Value]) -> Result<()> {
        Ok(())
    }
}

/// Scalar arithmetic on real-valued parents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arithmetic {
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Exp,
    Log,
    Square,
}

impl Arithmetic {
    pub fn arity(self) -> usize {
        match self {
            Arithmetic::Add | Arithmetic::Sub | Arithmetic::Mul | Arithmetic::Div => 2,
            Arithmetic::Neg | Arithmetic::Exp | Arithmetic::Log | Arithmetic::Square => 1,
        }
    }
}

impl Function for Arithmetic {
    fn name(&self) -> &'static str {
        match self {
            Arithmetic::Add => "add",
            Arithmetic::Sub => "sub",
            Arithmetic::Mul => "mul",
            Arithmetic::Div => "div",
            Arithmetic::Neg => "neg",
            Arithmetic::Exp => "exp",
            Arithmetic::Log => "log",
            Arithmetic::Square => "square",
        }
    }

    fn compute(&self, parents: &[&Value]) -> Value {
        let a = parents[0].as_real();
        let result = match self {
            Arithmetic::Add => a + parents[1].as_real(),
            Arithmetic::Sub => a - parents[1].as_real(),
            Arithmetic::Mul => a * parents[1].as_real(),
            Arithmetic::Div => a / parents[1].as_real(),
            Arithmetic::Neg => -a,
            Arithmetic::Exp => a.exp(),
            Arithmetic::Log => a.ln(),
            Arithmetic::Square => a * a,
        };
        Value::Real(result)
    }

    fn check(&self, node: &str, parents: &[&Value]) -> Result<()> {
        expect_parents(node, parents, self.arity())?;
        for p in parents {
            if !matches!(p, Value::Real(_) | Value::Integer(_)) {
                return Err(ModelError::TypeMismatch {
                    node: node.to_string(),
                    expected: "real",
                    found: p.kind(),
                });
            }
        }
        Ok(())
    }
}

/// Sum of a vector's elements.
pub struct VectorSum;

impl Function for VectorSum {
    fn name(&self) -> &'static str {
        "vector_sum"
    }

    fn compute(&self, parents: &[&Value]) -> Value {
        Value::Real(parents[0].as_vector().iter().sum())
    }

    fn check(&self, node: &str, parents: &[&Value]) -> Result<()> {
        expect_parents(node, parents, 1)?;
        expect_kind(node, parents[0], "vector")
    }
}

/// Piecewise-constant timeline held flat beyond a maximum age.
///
/// Parents: `[max_age, boundaries, values]` where `values[0]` applies before
/// `boundaries[0]` and `values[i]` from `boundaries[i - 1]` on. Every interval
/// starting after `max_age` repeats the previous interval's value.
pub struct SmoothenTimeline;

impl Function for SmoothenTimeline {
    fn name(&self) -> &'static str {
        "smoothen_timeline"
    }

    fn compute(&self, parents: &[&Value]) -> Value {
        let max_age = parents[0].as_real();
        let boundaries = parents[1].as_vector();
        let mut values = parents[2].as_vector().to_vec();
        for i in 1..values.len() {
            if boundaries[i - 1] > max_age {
                values[i] = values[i - 1];
            }
        }
        Value::Vector(values)
    }

    fn check(&self, node: &str, parents: &[&Value]) -> Result<()> {
        expect_parents(node, parents, 3)?;
        expect_kind(node, parents[1], "vector")?;
        expect_kind(node, parents[2], "vector")?;
        let boundaries = parents[1].as_vector();
        let values = parents[2].as_vector();
        if values.len() != boundaries.len() + 1 {
            return Err(ModelError::LengthMismatch {
                what: format!("values of {}", node),
                expected: boundaries.len() + 1,
                found: values.len(),
            });
        }
        if boundaries.windows(2).any(|w| w[0] > w[1]) {
            return Err(ModelError::UnsortedBoundaries(node.to_string()));
        }
        Ok(())
    }
}
