pub mod api;
pub mod broker;
pub mod config;
pub mod control;
pub mod error;
pub mod params;
pub mod registry;
pub mod safety;
pub mod shutdown;
pub mod supervisor;
pub mod types;
pub mod workflow;

pub use config::Config;
pub use types::*;
