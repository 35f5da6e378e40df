pub mod orchestrator;
pub mod prober;
