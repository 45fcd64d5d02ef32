//! Hash-based bucketing for staged rollout of hybrid concept matching.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const BUCKET_COUNT: u16 = 10_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MatchVariant {
    /// Matching mode exactly as configured.
    Control,
    Hybrid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RolloutAssignment {
    pub key: String,
    pub digest: String,
    pub bucket: u16,
    pub hybrid_percent: u8,
    pub variant: MatchVariant,
}

/// Stable bucket in `0..BUCKET_COUNT` derived from the SHA-256 of `key`.
#[must_use]
pub fn rollout_bucket(key: &str) -> u16 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0_u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let bucket = u64::from_be_bytes(prefix) % u64::from(BUCKET_COUNT);
    u16::try_from(bucket).unwrap_or(0)
}

#[must_use]
pub fn select_variant(key: &str, hybrid_percent: u8) -> MatchVariant {
    let threshold = u16::from(hybrid_percent.min(100)) * (BUCKET_COUNT / 100);
    if rollout_bucket(key) < threshold {
        MatchVariant::Hybrid
    } else {
        MatchVariant::Control
    }
}

#[must_use]
pub fn assign(key: &str, hybrid_percent: u8) -> RolloutAssignment {
    RolloutAssignment {
        key: key.to_string(),
        digest: hex::encode(Sha256::digest(key.as_bytes())),
        bucket: rollout_bucket(key),
        hybrid_percent,
        variant: select_variant(key, hybrid_percent),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_is_stable_and_bounded() {
        for key in ["", "company-1", "01JTESTREQUEST", "čćžšđ"] {
            let bucket = rollout_bucket(key);
            assert!(bucket < BUCKET_COUNT);
            assert_eq!(bucket, rollout_bucket(key));
        }
    }

    #[test]
    fn extremes_pin_the_variant() {
        for index in 0..200 {
            let key = format!("company-{index}");
            assert_eq!(select_variant(&key, 0), MatchVariant::Control);
            assert_eq!(select_variant(&key, 100), MatchVariant::Hybrid);
        }
    }

    #[test]
    fn share_tracks_percentage() {
        let hybrid = (0..10_000)
            .filter(|index| select_variant(&format!("key-{index}"), 30) == MatchVariant::Hybrid)
            .count();
        assert!((2_500..3_500).contains(&hybrid), "hybrid share out of range: {hybrid}");
    }

    #[test]
    fn assignment_reports_hex_digest() {
        let assignment = assign("company-1", 50);
        assert_eq!(assignment.digest.len(), 64);
        assert_eq!(assignment.bucket, rollout_bucket("company-1"));
        assert_eq!(assignment.variant, select_variant("company-1", 50));
    }
}
