//! Configuration errors raised while assembling a model.
//!
//! Evaluation infeasibility is never an error: distributions report it as a
//! log-probability of negative infinity. Protocol misuse (resolving a touch
//! twice, starting a proposal with an open episode) panics instead.

use thiserror::Error;

use crate::graph::NodeId;

#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    #[error("unknown node {0:?}")]
    UnknownNode(NodeId),

    #[error("a node named '{0}' already exists")]
    DuplicateName(String),

    #[error("node '{node}' expects {expected} but got {found}")]
    TypeMismatch {
        node: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("'{what}' has length {found}, expected {expected}")]
    LengthMismatch {
        what: String,
        expected: usize,
        found: usize,
    },

    #[error("interval boundaries of '{0}' are not sorted")]
    UnsortedBoundaries(String),

    #[error("invalid rate matrix: {0}")]
    InvalidRateMatrix(String),

    #[error("invalid tree: {0}")]
    InvalidTree(String),

    #[error("invalid parameter for '{node}': {reason}")]
    InvalidParameter { node: String, reason: String },

    #[error("{child:?} has no parent {parent:?}")]
    MissingEdge { child: NodeId, parent: NodeId },

    #[error("linking {parent:?} into {child:?} would create a cycle")]
    Cycle { child: NodeId, parent: NodeId },

    #[error("node '{0}' is not stochastic")]
    NotStochastic(String),

    #[error("node '{0}' is clamped to observed data and cannot be proposed")]
    ClampedTarget(String),

    #[error("node '{0}' is not part of the model")]
    OutsideModel(String),

    #[error("the move schedule is empty")]
    EmptySchedule,
}

pub type Result<T, E = ModelError> = std::result::Result<T, E>;
