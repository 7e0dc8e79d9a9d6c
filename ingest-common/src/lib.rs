pub mod broker;
pub mod config;
pub mod envelope;
pub mod health;
pub mod memory;
pub mod metrics;
pub mod pgbroker;
pub mod record;
pub mod source;
pub mod store;
pub mod task;
pub mod watermark;
