/// Transport/network noise that must never take the process down. Connection
/// churn on thousands of sockets makes these routine; they are logged and
/// absorbed by reconnect or job retry.
const BENIGN_TRANSPORT_PATTERNS: &[&str] = &[
    "terminated",
    "other side closed",
    "ECONNRESET",
    "socket hang up",
    "UND_ERR_SOCKET",
    "ECONNREFUSED",
    "ETIMEDOUT",
];

/// Signatures of session-state desynchronization surfaced outside the normal
/// stub path. These are logged as session-sync incidents; reconciliation
/// happens through the decryption-stub handling on the next message.
const SESSION_SYNC_PATTERNS: &[&str] = &[
    "Over 2000 messages into the future",
    "SessionError",
    "Failed to decrypt message",
    "Invalid patch mac",
    "Bad MAC",
];

pub fn is_benign_transport_error(message: &str) -> bool {
    BENIGN_TRANSPORT_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
}

pub fn is_session_sync_error(message: &str) -> bool {
    SESSION_SYNC_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_noise_is_benign() {
        assert!(is_benign_transport_error("read ECONNRESET"));
        assert!(is_benign_transport_error("request failed: socket hang up"));
        assert!(is_benign_transport_error("fetch failed: UND_ERR_SOCKET"));
        assert!(is_benign_transport_error("connect ECONNREFUSED 10.0.0.2:443"));
        assert!(is_benign_transport_error("stream terminated by peer"));
    }

    #[test]
    fn unknown_errors_are_fatal() {
        assert!(!is_benign_transport_error("assertion failed: invariant"));
        assert!(!is_benign_transport_error("out of memory"));
    }

    #[test]
    fn session_sync_signatures_are_recognized() {
        assert!(is_session_sync_error("SessionError: No record for device"));
        assert!(is_session_sync_error("Bad MAC"));
        assert!(is_session_sync_error(
            "Message counter Over 2000 messages into the future"
        ));
        assert!(!is_session_sync_error("ECONNRESET"));
    }
}
