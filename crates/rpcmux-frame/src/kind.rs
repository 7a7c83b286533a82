//! Message type tags and protocol limits.

/// `[0, id, method, params]`
pub const REQUEST: u64 = 0;

/// `[1, id, error, result]`
pub const RESPONSE: u64 = 1;

/// `[2, method, params]`
pub const NOTIFICATION: u64 = 2;

/// Request id meaning "no response wanted".
///
/// Encoding a request with this id produces a notification.
pub const NO_RESPONSE: u32 = 0;

/// Longest accepted method name, in bytes.
pub const MAX_METHOD_NAME_LEN: usize = 100;

/// Returns a human-readable name for a message type tag.
pub fn kind_name(kind: u64) -> &'static str {
    match kind {
        REQUEST => "request",
        RESPONSE => "response",
        NOTIFICATION => "notification",
        _ => "unknown",
    }
}

/// Array length a message of this type must have on the wire.
pub fn expected_len(kind: u64) -> Option<usize> {
    match kind {
        REQUEST | RESPONSE => Some(4),
        NOTIFICATION => Some(3),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_cover_all_kinds() {
        assert_eq!(kind_name(REQUEST), "request");
        assert_eq!(kind_name(RESPONSE), "response");
        assert_eq!(kind_name(NOTIFICATION), "notification");
        assert_eq!(kind_name(7), "unknown");
    }

    #[test]
    fn notification_is_the_short_message() {
        assert_eq!(expected_len(REQUEST), Some(4));
        assert_eq!(expected_len(RESPONSE), Some(4));
        assert_eq!(expected_len(NOTIFICATION), Some(3));
        assert_eq!(expected_len(3), None);
    }
}
