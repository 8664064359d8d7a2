//! ID generation utilities for agentloop
//!
//! Provides functions for generating unique identifiers for execution runs
//! and sessions, plus the shared millisecond clock.

use rand::Rng;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// Generate a unique execution run ID
///
/// Format: `exec-{timestamp_ms}-{random_hex}`
/// Example: `exec-1738300800123-a1b2`
pub fn generate_execution_id() -> String {
    let timestamp = now_ms();
    let random: u16 = rand::rng().random();
    format!("exec-{}-{:04x}", timestamp, random)
}

/// Generate a session ID for the history recorder
///
/// Format: `sess-{timestamp_ms}-{random_hex}`
pub fn generate_session_id() -> String {
    let timestamp = now_ms();
    let random: u16 = rand::rng().random();
    format!("sess-{}-{:04x}", timestamp, random)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_returns_reasonable_timestamp() {
        let ts = now_ms();
        // Should be after 2020-01-01 and before 2100-01-01
        assert!(ts > 1577836800000); // 2020-01-01
        assert!(ts < 4102444800000); // 2100-01-01
    }

    #[test]
    fn test_generate_execution_id_format() {
        let id = generate_execution_id();
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "exec");
        assert!(parts[1].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(parts[2].len(), 4);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generate_execution_id_uniqueness() {
        let id1 = generate_execution_id();
        let id2 = generate_execution_id();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_generate_session_id_format() {
        let id = generate_session_id();
        assert!(id.starts_with("sess-"));
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[1].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(parts[2].len(), 4);
    }
}
