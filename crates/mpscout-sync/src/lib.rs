//! Run configuration and the scout pipeline that ties the adapters and storage together.

pub mod config;
pub mod pipeline;

pub use config::{
    plan_search, DelayRange, PlanError, RunSettings, ScoutConfig, SearchPlan, ALL_TOKEN,
    DEFAULT_CONFIG_PATH,
};
pub use pipeline::{PipelineError, ScoutPipeline};

pub const CRATE_NAME: &str = "mpscout-sync";
