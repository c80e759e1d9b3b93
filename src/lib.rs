pub mod api;
pub mod capacity;
pub mod checker;
pub mod directory;
pub mod generator;
pub mod keys;
pub mod model;
pub mod orchestrator;
pub mod resolver;
pub mod settings;
pub mod sim;
pub mod tenant_info;
pub mod trace;
pub mod types;
pub mod workload;

pub use metarestore_macros::test;
