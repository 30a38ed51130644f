pub mod app;
pub mod config;
pub mod intent;
pub mod orchestration;
pub mod queue;
pub mod runtime;
pub mod shared;
