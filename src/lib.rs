#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod config;
mod error;
pub mod extract;
mod graph;
mod interceptor;
mod metadata;
mod params;
mod registry;
mod tracer;
mod value;

pub use crate::config::Config;
pub use crate::error::*;
pub use crate::extract::{Extractor, LATENT_SCALE};
pub use crate::graph::{InputValue, Link, Node, NodeId, Workflow};
pub use crate::interceptor::{DispatchFn, HostRuntime, Interceptor, NodeCall, RunStart, RunStartFn};
pub use crate::metadata::{
    Category, ImageRecord, Images, LoraEntry, LoraRecord, Metadata, ModelKind, ModelRecord,
    NodeRecords, PromptRecord, SamplingRecord, SizeRecord,
};
pub use crate::params::{GenerationParams, extract_generation_params, to_dict};
pub use crate::registry::{Registry, RunId};
pub use crate::tracer::{
    Origin, Tracer, find_primary_checkpoint, find_primary_sampler, trace_model_path,
    trace_node_input,
};
pub use crate::value::{Inputs, Latent, Outputs, Payload, Value};

/// Installs a formatting subscriber filtered by `RUST_LOG`, `info` if unset.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()?;

    Ok(())
}
