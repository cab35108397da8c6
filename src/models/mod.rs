use serde::{Deserialize, Serialize};

/// Device lifecycle status. A session walks OFFLINE -> (QR ->)? ONLINE ->
/// OFFLINE; ERROR is a terminal annotation cleared by the next connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceStatus {
    Offline,
    Qr,
    Online,
    Error,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Offline => "OFFLINE",
            DeviceStatus::Qr => "QR",
            DeviceStatus::Online => "ONLINE",
            DeviceStatus::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OFFLINE" => Some(DeviceStatus::Offline),
            "QR" => Some(DeviceStatus::Qr),
            "ONLINE" => Some(DeviceStatus::Online),
            "ERROR" => Some(DeviceStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
    Dlq,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "PENDING",
            DeliveryStatus::Success => "SUCCESS",
            DeliveryStatus::Failed => "FAILED",
            DeliveryStatus::Dlq => "DLQ",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboundStatus {
    Queued,
    Processing,
    Sent,
    Failed,
}

impl OutboundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboundStatus::Queued => "QUEUED",
            OutboundStatus::Processing => "PROCESSING",
            OutboundStatus::Sent => "SENT",
            OutboundStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// Which process wrote a log row. The control-plane writes `api`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceName {
    Api,
    Worker,
}

impl ServiceName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceName::Api => "api",
            ServiceName::Worker => "worker",
        }
    }
}

/// The single event type currently emitted.
pub const EVENT_TYPE_MESSAGE_INBOUND: &str = "message.inbound";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_status_round_trips() {
        for status in [
            DeviceStatus::Offline,
            DeviceStatus::Qr,
            DeviceStatus::Online,
            DeviceStatus::Error,
        ] {
            assert_eq!(DeviceStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DeviceStatus::parse("bogus"), None);
    }
}
