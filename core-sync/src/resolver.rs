//! Conflict Resolution for Reconciliation Runs
//!
//! Picks a winning side for pairs where both fingerprints moved away from
//! their baselines, and computes what the mapping must record after a copy
//! is written.
//!
//! ## Overview
//!
//! Resolution is a pure function of the two entities, the pair's mapping and
//! the kind policy, so identical inputs always produce the same winner. The
//! checks run in order:
//!
//! 1. **Direction policy**: a one-directional pair always resolves towards
//!    its authoritative side
//! 2. **Newer timestamp**: when both stamps are reliable and further apart
//!    than the skew tolerance, the later one wins
//! 3. **Baseline divergence**: the side whose fingerprint moved further from
//!    its own last-synced fingerprint wins
//! 4. **Policy default**: ties go to the kind's [`ConflictPreference`]
//!
//! A stamp is unreliable when it is missing, or when it is not newer than the
//! stamp recorded for that side at the last sync even though the content
//! changed.
//!
//! ## Post-write stamps
//!
//! After a copy is written, the mapping records the *source* fingerprint for
//! the target side rather than whatever the target reports back. When the
//! target accepts an explicit modification time, the source's stamp is sent
//! along with the write. Either way the next run sees the target as
//! unchanged instead of newer than the source it was copied from.
//!
//! ## Usage
//!
//! ```ignore
//! use core_sync::resolver::ConflictResolver;
//!
//! let resolver = ConflictResolver::new(Duration::from_secs(5));
//! let resolution = resolver.resolve(&local, &remote, &mapping, direction, preference);
//! ```

use crate::entity::{Fingerprint, NormalizedEntity, Side};
use crate::mapping::MappingRecord;
use bridge_traits::{AdapterCapabilities, SyncDirection, WriteReceipt};
use chrono::{DateTime, Utc};
use core_runtime::config::ConflictPreference;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Why a side won a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionReason {
    /// Reliable stamps further apart than the skew tolerance
    NewerTimestamp,
    /// Winner moved further from its last-synced fingerprint
    BaselineDivergence,
    /// Equal divergence; the kind's conflict preference decided
    PolicyDefault,
    /// The pair only propagates in one direction
    DirectionPolicy,
}

/// Outcome of resolving one conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub winner: Side,
    pub reason: ResolutionReason,
}

impl Resolution {
    fn new(winner: Side, reason: ResolutionReason) -> Self {
        Self { winner, reason }
    }
}

/// What to send with a write and what to commit once it succeeds
#[derive(Debug, Clone, PartialEq)]
pub struct WriteStamp {
    /// Fingerprint recorded for the target side
    pub fingerprint: Fingerprint,
    /// Modification time sent with the write, when the target accepts one
    pub request_modified_at: Option<DateTime<Utc>>,
}

impl WriteStamp {
    /// Target-side stamp to store in the mapping after the write
    ///
    /// The stamp we set wins over whatever the target reports; otherwise the
    /// target's own stamp is kept so later runs compare like with like.
    pub fn committed_modified_at(&self, receipt: &WriteReceipt) -> Option<DateTime<Utc>> {
        self.request_modified_at.or(receipt.modified_at)
    }
}

/// Deterministic conflict resolver
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    skew_tolerance: Duration,
}

impl ConflictResolver {
    pub fn new(skew_tolerance: Duration) -> Self {
        Self { skew_tolerance }
    }

    pub fn skew_tolerance(&self) -> Duration {
        self.skew_tolerance
    }

    /// Pick the winning side of a conflict
    pub fn resolve(
        &self,
        local: &NormalizedEntity,
        remote: &NormalizedEntity,
        mapping: &MappingRecord,
        direction: SyncDirection,
        preference: ConflictPreference,
    ) -> Resolution {
        match direction {
            SyncDirection::LocalAuthoritative => {
                return Resolution::new(Side::Local, ResolutionReason::DirectionPolicy)
            }
            SyncDirection::RemoteAuthoritative => {
                return Resolution::new(Side::Remote, ResolutionReason::DirectionPolicy)
            }
            SyncDirection::Bidirectional => {}
        }

        let local_stamp = reliable_stamp(local, mapping);
        let remote_stamp = reliable_stamp(remote, mapping);

        if let (Some(l), Some(r)) = (local_stamp, remote_stamp) {
            let gap = (l - r).abs().to_std().unwrap_or(Duration::ZERO);
            if gap > self.skew_tolerance {
                let winner = if l > r { Side::Local } else { Side::Remote };
                debug!(
                    winner = %winner,
                    gap_ms = gap.as_millis() as u64,
                    "Conflict resolved by timestamp"
                );
                return Resolution::new(winner, ResolutionReason::NewerTimestamp);
            }
        }

        let local_divergence = divergence(local, mapping.last_fingerprint(Side::Local));
        let remote_divergence = divergence(remote, mapping.last_fingerprint(Side::Remote));
        debug!(
            local_divergence,
            remote_divergence, "Conflict resolved by baseline divergence"
        );

        if local_divergence > remote_divergence {
            Resolution::new(Side::Local, ResolutionReason::BaselineDivergence)
        } else if remote_divergence > local_divergence {
            Resolution::new(Side::Remote, ResolutionReason::BaselineDivergence)
        } else {
            let winner = match preference {
                ConflictPreference::PreferLocal => Side::Local,
                ConflictPreference::PreferRemote => Side::Remote,
            };
            Resolution::new(winner, ResolutionReason::PolicyDefault)
        }
    }

    /// Stamp for copying `source` onto a target with `target_caps`
    pub fn post_write_stamp(
        &self,
        source: &NormalizedEntity,
        target_caps: AdapterCapabilities,
    ) -> WriteStamp {
        WriteStamp {
            fingerprint: source.fingerprint.clone(),
            request_modified_at: if target_caps.settable_modified_at {
                source.modified_at
            } else {
                None
            },
        }
    }
}

fn reliable_stamp(entity: &NormalizedEntity, mapping: &MappingRecord) -> Option<DateTime<Utc>> {
    let current = entity.modified_at?;
    match mapping.last_modified_at(entity.side) {
        Some(previous) if current <= previous => None,
        _ => Some(current),
    }
}

fn divergence(entity: &NormalizedEntity, baseline: Option<&Fingerprint>) -> usize {
    match baseline {
        Some(baseline) => entity.fingerprint.divergence(baseline),
        None => entity.fingerprint.fields.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::{EntityKind, NoteRecord, RawRecord};
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn fingerprint(title: &str, body: &str, folder: &str) -> Fingerprint {
        Fingerprint::from_fields(
            EntityKind::Note,
            BTreeMap::from([
                ("title", json!(title)),
                ("body", json!(body)),
                ("folder", json!(folder)),
            ]),
        )
    }

    fn entity(side: Side, fingerprint: Fingerprint, modified_at: Option<DateTime<Utc>>) -> NormalizedEntity {
        NormalizedEntity {
            id: format!("{}-1", side),
            side,
            kind: EntityKind::Note,
            fingerprint,
            modified_at,
            deleted: false,
            content_key: None,
            payload: RawRecord::Note(NoteRecord::default()),
        }
    }

    fn mapping(baseline: &Fingerprint, stamp: Option<DateTime<Utc>>) -> MappingRecord {
        let mut record = MappingRecord::pending(EntityKind::Note, Side::Local, "local-1", at(0));
        record.observe(Side::Local, "local-1", baseline.clone(), stamp);
        record.observe(Side::Remote, "remote-1", baseline.clone(), stamp);
        record
    }

    fn resolver() -> ConflictResolver {
        ConflictResolver::new(Duration::from_secs(5))
    }

    #[test]
    fn test_newer_timestamp_wins_outside_skew() {
        let base = fingerprint("t", "b", "f");
        let mapping = mapping(&base, Some(at(0)));
        let local = entity(Side::Local, fingerprint("t2", "b", "f"), Some(at(100)));
        let remote = entity(Side::Remote, fingerprint("t", "b2", "f2"), Some(at(200)));

        let resolution = resolver().resolve(
            &local,
            &remote,
            &mapping,
            SyncDirection::Bidirectional,
            ConflictPreference::PreferLocal,
        );
        assert_eq!(resolution.winner, Side::Remote);
        assert_eq!(resolution.reason, ResolutionReason::NewerTimestamp);
    }

    #[test]
    fn test_within_skew_falls_back_to_divergence() {
        let base = fingerprint("t", "b", "f");
        let mapping = mapping(&base, Some(at(0)));
        let local = entity(Side::Local, fingerprint("t2", "b2", "f"), Some(at(100)));
        let remote = entity(Side::Remote, fingerprint("t3", "b", "f"), Some(at(103)));

        let resolution = resolver().resolve(
            &local,
            &remote,
            &mapping,
            SyncDirection::Bidirectional,
            ConflictPreference::PreferRemote,
        );
        assert_eq!(resolution.winner, Side::Local);
        assert_eq!(resolution.reason, ResolutionReason::BaselineDivergence);
    }

    #[test]
    fn test_stale_stamp_is_unreliable() {
        let base = fingerprint("t", "b", "f");
        // Remote content changed but its stamp did not move past the baseline
        let mapping = mapping(&base, Some(at(500)));
        let local = entity(Side::Local, fingerprint("t2", "b", "f"), Some(at(1000)));
        let remote = entity(Side::Remote, fingerprint("t3", "b", "f"), Some(at(400)));

        let resolution = resolver().resolve(
            &local,
            &remote,
            &mapping,
            SyncDirection::Bidirectional,
            ConflictPreference::PreferRemote,
        );
        assert_eq!(resolution.reason, ResolutionReason::PolicyDefault);
        assert_eq!(resolution.winner, Side::Remote);
    }

    #[test]
    fn test_tie_is_deterministic_and_follows_preference() {
        let base = fingerprint("t", "b", "f");
        let mapping = mapping(&base, None);
        let local = entity(Side::Local, fingerprint("a", "b", "f"), None);
        let remote = entity(Side::Remote, fingerprint("z", "b", "f"), None);

        let first = resolver().resolve(
            &local,
            &remote,
            &mapping,
            SyncDirection::Bidirectional,
            ConflictPreference::PreferLocal,
        );
        for _ in 0..10 {
            let again = resolver().resolve(
                &local,
                &remote,
                &mapping,
                SyncDirection::Bidirectional,
                ConflictPreference::PreferLocal,
            );
            assert_eq!(again, first);
        }
        assert_eq!(first, Resolution::new(Side::Local, ResolutionReason::PolicyDefault));
    }

    #[test]
    fn test_direction_policy_overrides_everything() {
        let base = fingerprint("t", "b", "f");
        let mapping = mapping(&base, Some(at(0)));
        let local = entity(Side::Local, fingerprint("t2", "b", "f"), Some(at(10)));
        let remote = entity(Side::Remote, fingerprint("x", "y", "z"), Some(at(9999)));

        let resolution = resolver().resolve(
            &local,
            &remote,
            &mapping,
            SyncDirection::LocalAuthoritative,
            ConflictPreference::PreferRemote,
        );
        assert_eq!(resolution, Resolution::new(Side::Local, ResolutionReason::DirectionPolicy));
    }

    #[test]
    fn test_post_write_stamp_uses_source_values() {
        let source = entity(Side::Local, fingerprint("t", "b", "f"), Some(at(42)));
        let receipt = WriteReceipt {
            id: "remote-1".to_string(),
            modified_at: Some(at(9000)),
            revision: Some("etag-7".to_string()),
        };

        let settable = resolver().post_write_stamp(
            &source,
            AdapterCapabilities {
                settable_modified_at: true,
            },
        );
        assert_eq!(settable.fingerprint, source.fingerprint);
        assert_eq!(settable.request_modified_at, Some(at(42)));
        assert_eq!(settable.committed_modified_at(&receipt), Some(at(42)));

        let fixed = resolver().post_write_stamp(&source, AdapterCapabilities::default());
        assert_eq!(fixed.fingerprint, source.fingerprint);
        assert_eq!(fixed.request_modified_at, None);
        assert_eq!(fixed.committed_modified_at(&receipt), Some(at(9000)));
    }
}
