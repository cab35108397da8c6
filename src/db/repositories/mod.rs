pub mod device_repository;
pub mod event_repository;
pub mod log_repository;
pub mod outbound_message_repository;
pub mod public_qr_link_repository;
pub mod wa_session_repository;
pub mod webhook_delivery_repository;
pub mod webhook_endpoint_repository;

pub use device_repository::{Device, DeviceRepository};
pub use event_repository::{Event, EventRepository};
pub use log_repository::LogRepository;
pub use outbound_message_repository::{OutboundMessage, OutboundMessageRepository};
pub use public_qr_link_repository::{PublicQrLink, PublicQrLinkRepository};
pub use wa_session_repository::{WaSession, WaSessionRepository};
pub use webhook_delivery_repository::{
    DeliveryWithTarget, WebhookDelivery, WebhookDeliveryRepository,
};
pub use webhook_endpoint_repository::{WebhookEndpoint, WebhookEndpointRepository};
