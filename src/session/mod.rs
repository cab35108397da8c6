pub mod auth_state;
pub mod manager;
pub mod presence;
pub mod sweeper;

pub use auth_state::{AuthStateHandle, AuthStateStore};
pub use manager::SessionManager;
pub use presence::PresenceScheduler;
