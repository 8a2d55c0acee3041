//! Identifier types shared by the build and squash crates. Both serialize
//! as plain strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl PartialEq<String> for $name {
            fn eq(&self, other: &String) -> bool {
                self.0 == *other
            }
        }
    };
}

id_type!(
    /// Per-run suffix for every image and container name, so concurrent
    /// runs on one host never collide. Empty means undecorated.
    BuildId
);

id_type!(
    /// Hex id of a layer inside an exported image.
    LayerId
);

static GENERATED: AtomicU64 = AtomicU64::new(0);

/// 64 hex characters that are unique per call within a process and very
/// unlikely to repeat across processes.
pub fn random_hex(seed: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let counter = GENERATED.fetch_add(1, Ordering::Relaxed);
    let input = format!("{seed}:{nanos}:{counter}:{}", std::process::id());
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

impl BuildId {
    /// Image repositories are lowercase, so ids are too.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().to_lowercase())
    }

    /// Generate a fresh lowercase 12-character build id.
    pub fn generate() -> Self {
        Self(random_hex("build-id")[..12].to_owned())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl LayerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Truncated 12-character prefix used for display.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_id_is_lowercased() {
        let id = BuildId::new("CI-42");
        assert_eq!(id.to_string(), "ci-42");
        assert_eq!(id, BuildId::new("ci-42"));
    }

    #[test]
    fn layer_id_serde_roundtrip() {
        let id = LayerId::new("deadbeef");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"deadbeef\"");
        let back: LayerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn layer_id_short_truncates() {
        let id = LayerId::new("0123456789abcdef0123");
        assert_eq!(id.short(), "0123456789ab");
        assert_eq!(LayerId::new("abc").short(), "abc");
    }

    #[test]
    fn generated_build_ids_differ() {
        let a = BuildId::generate();
        let b = BuildId::generate();
        assert_eq!(a.len(), 12);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn random_hex_is_64_chars() {
        let h = random_hex("layer");
        assert_eq!(h.len(), 64);
        assert_ne!(h, random_hex("layer"));
    }
}
