pub mod settings;

pub use settings::{AlertConfig, WorkerSettings};
