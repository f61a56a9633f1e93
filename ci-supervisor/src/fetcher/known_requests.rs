use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hosting_client::model::PullRequest;
use std::collections::HashMap;
use std::time::Duration;

struct KnownEntry {
    /// Append-only; the last value is the most recent refresh.
    timestamps: Vec<DateTime<Utc>>,
    request: PullRequest,
}

/// The fetcher's in-memory record of previously observed PRs, keyed by
/// priority, with their observation timestamps. Owned exclusively by the
/// fetcher; every other worker sees it only through the results channel.
#[derive(Default)]
pub struct KnownRequests {
    by_priority: HashMap<u8, Vec<KnownEntry>>,
}

impl KnownRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, priority: u8, request: &PullRequest) -> bool {
        self.by_priority
            .get(&priority)
            .map(|entries| entries.iter().any(|e| &e.request == request))
            .unwrap_or(false)
    }

    /// Stamps each `(priority, request)` pair with `now` and appends it.
    /// Does not dedup against existing entries; callers are expected to
    /// have already filtered to genuinely new pairs via `contains`.
    pub fn add_all(&mut self, entries: Vec<(u8, PullRequest)>, now: DateTime<Utc>) {
        for (priority, request) in entries {
            self.by_priority.entry(priority).or_default().push(KnownEntry {
                timestamps: vec![now],
                request,
            });
        }
    }

    /// All `(priority, request)` whose last observation is older than
    /// `age` as of `now`.
    pub fn older_than(&self, age: Duration, now: DateTime<Utc>) -> Vec<(u8, PullRequest)> {
        let age = ChronoDuration::from_std(age).unwrap_or_else(|_| ChronoDuration::zero());
        let cutoff = now - age;
        self.by_priority
            .iter()
            .flat_map(|(priority, entries)| {
                entries.iter().filter_map(move |e| {
                    let last = *e.timestamps.last().expect("timestamps is never empty");
                    (last < cutoff).then(|| (*priority, e.request.clone()))
                })
            })
            .collect()
    }

    /// Appends `now` to the timestamp list of each currently-known entry
    /// matching one of `requests` by `(number, sha)` equality, without
    /// removing or replacing the entry itself.
    pub fn reset(&mut self, requests: &[(u8, PullRequest)], now: DateTime<Utc>) {
        for (priority, request) in requests {
            if let Some(entries) = self.by_priority.get_mut(priority) {
                for entry in entries.iter_mut() {
                    if &entry.request == request {
                        entry.timestamps.push(now);
                    }
                }
            }
        }
    }

    /// Drops every known entry whose `(number, sha)` is not present in
    /// `still_present` (considered closed or no longer reviewed).
    pub fn retain_present(&mut self, still_present: &[PullRequest]) {
        for entries in self.by_priority.values_mut() {
            entries.retain(|e| still_present.contains(&e.request));
        }
        self.by_priority.retain(|_, entries| !entries.is_empty());
    }

    pub fn all(&self) -> Vec<(u8, PullRequest)> {
        self.by_priority
            .iter()
            .flat_map(|(priority, entries)| entries.iter().map(move |e| (*priority, e.request.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pr(number: &str, sha: &str, fetched: DateTime<Utc>) -> PullRequest {
        PullRequest {
            number: number.to_string(),
            sha: sha.to_string(),
            created: fetched,
            updated: None,
            reviewed: true,
            tested: false,
            success: false,
            fetched,
        }
    }

    #[test]
    fn contains_and_add_all_round_trip() {
        let mut known = KnownRequests::new();
        let now = Utc::now();
        let request = pr("1", "abc", now);
        assert!(!known.contains(0, &request));

        known.add_all(vec![(0, request.clone())], now);
        assert!(known.contains(0, &request));
    }

    #[test]
    fn older_than_only_returns_entries_past_the_cutoff() {
        let mut known = KnownRequests::new();
        let now = Utc::now();
        let stale = pr("1", "abc", now - ChronoDuration::seconds(120));
        let fresh = pr("2", "def", now);
        known.add_all(vec![(0, stale.clone()), (0, fresh)], now - ChronoDuration::seconds(120));
        known.add_all(vec![(0, pr("2", "def", now))], now);

        let result = known.older_than(Duration::from_secs(60), now);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].1.number, "1");
    }

    #[test]
    fn reset_appends_without_removing() {
        let mut known = KnownRequests::new();
        let now = Utc::now();
        let request = pr("1", "abc", now);
        known.add_all(vec![(0, request.clone())], now);

        let later = now + ChronoDuration::seconds(30);
        known.reset(&[(0, request.clone())], later);

        assert!(known.contains(0, &request));
        let older = known.older_than(Duration::from_secs(10), later);
        assert!(older.is_empty());
    }

    #[test]
    fn retain_present_drops_closed_entries() {
        let mut known = KnownRequests::new();
        let now = Utc::now();
        let kept = pr("1", "abc", now);
        let closed = pr("2", "def", now);
        known.add_all(vec![(0, kept.clone()), (1, closed)], now);

        known.retain_present(&[kept.clone()]);

        assert!(known.contains(0, &kept));
        assert!(!known.contains(1, &pr("2", "def", now)));
    }
}
