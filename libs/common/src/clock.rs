use chrono::Utc;

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Every timestamp that crosses the wire (heartbeats, presence blobs,
/// detection times) uses this unit.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
        // Sanity: after 2025-01-01.
        assert!(a > 1_735_689_600_000);
    }
}
