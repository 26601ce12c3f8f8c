use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = pitchside_common::id::prefixed_ulid("evt");
/// assert!(id.starts_with("evt_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new().to_string())
}

/// Marker trait for types that carry a prefixed ID.
pub trait PrefixedId {
    const PREFIX: &'static str;

    fn generate() -> String {
        prefixed_ulid(Self::PREFIX)
    }
}

/// Well-known ID prefixes.
pub mod prefix {
    /// Tracked match events (client-generated, the dedup key).
    pub const EVENT: &str = "evt";
    pub const ASSIGNMENT: &str = "asg";
    /// Relay channel sessions.
    pub const SESSION: &str = "ses";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_ulid_format() {
        let id = prefixed_ulid("evt");
        assert!(id.starts_with("evt_"));
        // ULID is 26 chars, plus prefix + underscore
        assert_eq!(id.len(), 4 + 26);
    }

    #[test]
    fn test_uniqueness() {
        let a = prefixed_ulid("evt");
        let b = prefixed_ulid("evt");
        assert_ne!(a, b);
    }

    #[test]
    fn prefixed_id_trait_uses_prefix() {
        struct Assignment;
        impl PrefixedId for Assignment {
            const PREFIX: &'static str = prefix::ASSIGNMENT;
        }
        assert!(Assignment::generate().starts_with("asg_"));
    }
}
