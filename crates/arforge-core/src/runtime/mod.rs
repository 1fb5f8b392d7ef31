pub mod jobs;
pub mod orchestrator;
pub mod queue;
pub mod types;
