pub mod run_history;
pub mod sweep_scheduler;
