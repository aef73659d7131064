pub mod buffer;
pub mod diagnostics;
pub mod distributions;
pub mod error;
pub mod events;
pub mod functions;
pub mod graph;
pub mod kernels;
pub mod mcmc;
pub mod model;
pub mod moves;
pub mod node;
pub mod phylo_brownian;
pub mod progress;
pub mod proposal;
pub mod rate_matrix;
pub mod sampler;
pub mod settings;
pub mod tree;
pub mod value;

pub use error::{ModelError, Result};
pub use graph::{Graph, NodeId};
pub use mcmc::{ChainResult, Mcmc, McmcConfig};
pub use model::Model;
pub use moves::{Move, MoveOutcome};
pub use proposal::{Proposal, Proposed, Tuning};
pub use sampler::{sample, SampleResult, SamplerConfig};
pub use settings::Settings;
pub use value::Value;
