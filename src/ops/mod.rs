pub mod alerting;
pub mod classifier;
pub mod db_log;
pub mod health;
pub mod heartbeat;

pub use alerting::AdminAlerting;
pub use classifier::{is_benign_transport_error, is_session_sync_error};
pub use db_log::DbLogSink;
