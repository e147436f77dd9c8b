use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

/// Deterministic slot offset for a source among `source_count` enabled
/// sources, each slot `stagger_unit` wide (spec §4.3, §4.7, testable
/// property 4: two sources' fire times differ by an exact multiple of
/// `stagger_unit`, not by continuous jitter).
///
/// Uses `DefaultHasher` directly rather than going through `RandomState`
/// (which reseeds per-process) — the same source must land in the same
/// slot across restarts, or every process restart reshuffles the whole
/// fleet's fire times and defeats the point of staggering at all.
pub fn stagger_offset(source_id: &str, source_count: usize, stagger_unit: Duration) -> Duration {
    if source_count == 0 {
        return Duration::ZERO;
    }
    let mut hasher = DefaultHasher::new();
    source_id.hash(&mut hasher);
    let h = hasher.finish();
    let slot = h % source_count as u64;
    stagger_unit.saturating_mul(slot as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_source_same_offset() {
        let a = stagger_offset("source-a", 10, Duration::from_secs(300));
        let b = stagger_offset("source-a", 10, Duration::from_secs(300));
        assert_eq!(a, b);
    }

    #[test]
    fn offset_is_an_exact_multiple_of_the_stagger_unit() {
        let unit = Duration::from_secs(300);
        for id in ["a", "bb", "ccc", "source-with-a-long-name"] {
            let offset = stagger_offset(id, 7, unit);
            assert_eq!(offset.as_secs() % unit.as_secs(), 0);
            assert!(offset < unit * 7);
        }
    }

    #[test]
    fn zero_sources_yields_zero_offset() {
        assert_eq!(stagger_offset("source-a", 0, Duration::from_secs(300)), Duration::ZERO);
    }
}
