use crate::events::OrderedEvents;
use crate::tree::Tree;

/// Realized value of a node. Scalars, vectors and structured values share
/// one type so a graph can mix parameter arithmetic with tree- or
/// event-valued quantities.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Real(f64),
    Integer(i64),
    Vector(Vec<f64>),
    Tree(Tree),
    Events(OrderedEvents),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Real(_) => "real",
            Value::Integer(_) => "integer",
            Value::Vector(_) => "vector",
            Value::Tree(_) => "tree",
            Value::Events(_) => "events",
        }
    }

    pub fn as_real(&self) -> f64 {
        match self {
            Value::Real(v) => *v,
            Value::Integer(v) => *v as f64,
            other => panic!("expected real, got {}", other.kind()),
        }
    }

    pub fn as_integer(&self) -> i64 {
        match self {
            Value::Integer(v) => *v,
            other => panic!("expected integer, got {}", other.kind()),
        }
    }

    pub fn as_vector(&self) -> &[f64] {
        match self {
            Value::Vector(v) => v,
            other => panic!("expected vector, got {}", other.kind()),
        }
    }

    pub fn as_vector_mut(&mut self) -> &mut Vec<f64> {
        match self {
            Value::Vector(v) => v,
            other => panic!("expected vector, got {}", other.kind()),
        }
    }

    pub fn as_tree(&self) -> &Tree {
        match self {
            Value::Tree(t) => t,
            other => panic!("expected tree, got {}", other.kind()),
        }
    }

    pub fn as_tree_mut(&mut self) -> &mut Tree {
        match self {
            Value::Tree(t) => t,
            other => panic!("expected tree, got {}", other.kind()),
        }
    }

    pub fn as_events(&self) -> &OrderedEvents {
        match self {
            Value::Events(e) => e,
            other => panic!("expected events, got {}", other.kind()),
        }
    }

    pub fn as_events_mut(&mut self) -> &mut OrderedEvents {
        match self {
            Value::Events(e) => e,
            other => panic!("expected events, got {}", other.kind()),
        }
    }

    /// Flatten into monitor columns: one per scalar or vector element,
    /// tree length for trees, event count for event sets.
    pub fn columns(&self) -> Vec<f64> {
        match self {
            Value::Real(v) => vec![*v],
            Value::Integer(v) => vec![*v as f64],
            Value::Vector(v) => v.clone(),
            Value::Tree(t) => vec![t.tree_length()],
            Value::Events(e) => vec![e.len() as f64],
        }
    }

    /// Column labels matching [`Value::columns`].
    pub fn column_names(&self, name: &str) -> Vec<String> {
        match self {
            Value::Vector(v) => (0..v.len()).map(|i| format!("{}[{}]", name, i)).collect(),
            Value::Tree(_) => vec![format!("{}.length", name)],
            Value::Events(_) => vec![format!("{}.count", name)],
            _ => vec![name.to_string()],
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::Vector(v)
    }
}

impl From<Tree> for Value {
    fn from(t: Tree) -> Self {
        Value::Tree(t)
    }
}

impl From<OrderedEvents> for Value {
    fn from(e: OrderedEvents) -> Self {
        Value::Events(e)
    }
}
