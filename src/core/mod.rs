// Core modules: CPL binding, recipe model, isolated execution, and error modeling.
pub mod cpl;
pub mod crash;
pub mod envelope;
pub mod error;
pub mod frames;
pub mod harness;
pub mod library;
pub mod log;
pub mod params;
pub mod recipe;
pub mod version;
