pub mod config;
pub mod coordinator;
pub mod handlers;
pub mod pipeline;
pub mod publisher;
pub mod run_state;
