pub mod agent_inputs;
pub mod process_runner;
