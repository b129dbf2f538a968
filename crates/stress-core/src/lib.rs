pub mod client;
pub mod config;
pub mod events;
pub mod job;
pub mod listener;
pub mod runner;
pub mod stats;
pub mod store;
pub mod workload;

pub use client::*;
pub use config::*;
pub use events::*;
pub use job::*;
pub use listener::*;
pub use runner::*;
pub use stats::*;
pub use store::*;
pub use workload::*;
