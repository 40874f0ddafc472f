//! Leader-election ordering.
//!
//! Two distinct rules live here, used in different protocol phases, and
//! they deliberately point in different directions:
//!
//! - consensus rounds elect the *most senior* node: lowest uptime wins,
//!   ties broken by ascending identifier;
//! - the bootstrap phase lets the *greatest* identifier among concurrent
//!   probers form a single-node cluster, so exactly one of them does.

use std::cmp::Ordering;

/// Order two `(uptime, id)` leader candidates by seniority. The minimum
/// under this order is the elected leader. Every node applies this to the
/// same update-table contents, so every node elects the same leader.
pub fn seniority_cmp(a: (u64, &str), b: (u64, &str)) -> Ordering {
    a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1))
}

/// Bootstrap tie-break: true when `my_id` is lexicographically greatest
/// among itself and every concurrent prober in `joiners`.
pub fn is_highest_joiner<'a, I>(my_id: &str, joiners: I) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    joiners.into_iter().all(|j| my_id >= j)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seniority_prefers_lowest_uptime() {
        assert_eq!(seniority_cmp((1, "zzz"), (4, "aaa")), Ordering::Less);
        assert_eq!(seniority_cmp((4, "aaa"), (1, "zzz")), Ordering::Greater);
    }

    #[test]
    fn test_seniority_ties_break_on_id() {
        assert_eq!(seniority_cmp((2, "alpha"), (2, "beta")), Ordering::Less);
        assert_eq!(seniority_cmp((2, "beta"), (2, "beta")), Ordering::Equal);
    }

    #[test]
    fn test_highest_joiner_is_greatest_id() {
        assert!(is_highest_joiner("nodec", ["nodea", "nodeb"]));
        assert!(!is_highest_joiner("nodea", ["nodea", "nodeb"]));
        // alone means highest
        assert!(is_highest_joiner("anything", []));
        // equality counts as highest (the cache may contain ourselves)
        assert!(is_highest_joiner("nodea", ["nodea"]));
    }
}
