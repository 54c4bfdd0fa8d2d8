//! Tasks - model descriptions, the built-in catalog and the orchestrator

pub mod catalog;
pub mod config;
pub mod orchestrator;
pub mod spec;

pub use config::{TaskConfig, TaskEntry};
pub use orchestrator::{CancelToken, ModelReport, Orchestrator, RunReport, TaskState};
pub use spec::{DeviceAffinity, ModelSpec, Normalization};
