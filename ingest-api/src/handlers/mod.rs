mod app;
mod publish;
mod pull;

pub use app::{app, AppState};
