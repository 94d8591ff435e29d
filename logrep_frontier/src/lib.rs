//! Tracks how far each span of the replicated keyspace has been resolved.
//!
//! A [`SpanFrontier`] holds a set of disjoint spans, each annotated with the timestamp at or
//! below which every change to that span has been observed. Forwarding a span only ever raises
//! timestamps, and neighbouring entries that end up at the same timestamp are merged so the
//! number of entries stays proportional to the number of distinct timestamps, not the number of
//! checkpoint notices received. Quantizing incoming timestamps (see
//! [`SpanFrontier::forward_quantized`]) makes that merging far more effective.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::time::Duration;

use logrep_types::{Key, ResolvedSpan, ResolvedSpans, Span, Timestamp};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum FrontierError {
    #[error("invalid span {span}: start key must sort before end key")]
    InvalidSpan { span: Span },
}

pub type Result<T, E = FrontierError> = std::result::Result<T, E>;

#[derive(Debug, Clone)]
struct Entry {
    end_key: Key,
    timestamp: Timestamp,
}

/// Span-indexed watermark. Entries are keyed by start key and never overlap.
#[derive(Debug, Default)]
pub struct SpanFrontier {
    entries: BTreeMap<Key, Entry>,
}

impl SpanFrontier {
    /// Create a frontier tracking `spans`, each resolved to `timestamp`.
    pub fn new_at(timestamp: Timestamp, spans: impl IntoIterator<Item = Span>) -> Result<Self> {
        let mut frontier = Self::default();
        for span in spans {
            frontier.add_span_at(span, timestamp)?;
        }
        Ok(frontier)
    }

    /// Start tracking `span` at `timestamp`. Parts of `span` that are already tracked keep their
    /// current timestamp.
    pub fn add_span_at(&mut self, span: Span, timestamp: Timestamp) -> Result<()> {
        if !span.is_valid() {
            return Err(FrontierError::InvalidSpan { span });
        }
        let mut gaps = Vec::new();
        let mut cursor = span.key.clone();
        for (start, entry) in self.overlapping(&span) {
            if cursor < start {
                gaps.push((cursor.clone(), start.clone()));
            }
            if entry.end_key > cursor {
                cursor = entry.end_key.clone();
            }
        }
        if cursor < span.end_key {
            gaps.push((cursor, span.end_key.clone()));
        }
        for (start, end_key) in gaps {
            self.entries.insert(start, Entry { end_key, timestamp });
        }
        self.coalesce(&span);
        Ok(())
    }

    /// Raise the timestamp of every tracked part of `span` to at least `timestamp`.
    ///
    /// Returns `true` if this moved the overall frontier forward.
    pub fn forward(&mut self, span: &Span, timestamp: Timestamp) -> Result<bool> {
        if !span.is_valid() {
            return Err(FrontierError::InvalidSpan { span: span.clone() });
        }
        let before = self.frontier();

        let stale: Vec<Key> = self
            .overlapping(span)
            .into_iter()
            .filter(|(_, entry)| entry.timestamp < timestamp)
            .map(|(start, _)| start)
            .collect();
        for start in stale {
            let Some(entry) = self.entries.remove(&start) else {
                continue;
            };
            let lo = std::cmp::max(&start, &span.key).clone();
            let hi = std::cmp::min(&entry.end_key, &span.end_key).clone();
            if start < lo {
                self.entries.insert(
                    start,
                    Entry {
                        end_key: lo.clone(),
                        timestamp: entry.timestamp,
                    },
                );
            }
            if hi < entry.end_key {
                self.entries.insert(
                    hi.clone(),
                    Entry {
                        end_key: entry.end_key,
                        timestamp: entry.timestamp,
                    },
                );
            }
            self.entries.insert(
                lo,
                Entry {
                    end_key: hi,
                    timestamp,
                },
            );
        }
        self.coalesce(span);

        let after = self.frontier();
        trace!(%span, %timestamp, %after, "forwarded frontier");
        Ok(after > before)
    }

    /// Quantize `timestamp` down to `granularity` before forwarding, unless quantization is
    /// disabled (zero granularity) or the timestamp is not past `floor`.
    pub fn forward_quantized(
        &mut self,
        span: &Span,
        timestamp: Timestamp,
        granularity: Duration,
        floor: Timestamp,
    ) -> Result<bool> {
        let timestamp = if !granularity.is_zero() && timestamp > floor {
            timestamp.quantize(granularity)
        } else {
            timestamp
        };
        self.forward(span, timestamp)
    }

    /// The minimum timestamp across all tracked spans.
    pub fn frontier(&self) -> Timestamp {
        self.entries
            .values()
            .map(|e| e.timestamp)
            .min()
            .unwrap_or(Timestamp::EMPTY)
    }

    /// The timestamp recorded for the entry containing `key`, if `key` is tracked.
    pub fn timestamp_at(&self, key: &Key) -> Option<Timestamp> {
        let (_, entry) = self.entries.range(..=key.clone()).next_back()?;
        (key < &entry.end_key).then_some(entry.timestamp)
    }

    /// Entries in key order.
    pub fn entries(&self) -> impl Iterator<Item = (Span, Timestamp)> + '_ {
        self.entries.iter().map(|(start, entry)| {
            (
                Span {
                    key: start.clone(),
                    end_key: entry.end_key.clone(),
                },
                entry.timestamp,
            )
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot every entry that has a non-empty timestamp.
    pub fn checkpoint(&self) -> ResolvedSpans {
        ResolvedSpans::new(
            self.entries()
                .filter(|(_, ts)| !ts.is_empty())
                .map(|(span, ts)| ResolvedSpan::new(span, ts))
                .collect(),
        )
    }

    /// Tracked entries that intersect `span`, in key order.
    fn overlapping(&self, span: &Span) -> Vec<(Key, Entry)> {
        let mut found: Vec<(Key, Entry)> = self
            .entries
            .range(..span.end_key.clone())
            .rev()
            .take_while(|(_, entry)| entry.end_key > span.key)
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect();
        found.reverse();
        found
    }

    /// Merge contiguous entries with equal timestamps in the neighbourhood of `span`.
    fn coalesce(&mut self, span: &Span) {
        let from = self
            .entries
            .range(..span.key.clone())
            .next_back()
            .map(|(k, _)| k.clone())
            .unwrap_or_else(|| span.key.clone());
        let keys: Vec<Key> = self
            .entries
            .range((Bound::Included(from), Bound::Included(span.end_key.clone())))
            .map(|(k, _)| k.clone())
            .collect();

        let mut keys = keys.into_iter();
        let Some(mut current) = keys.next() else {
            return;
        };
        for next in keys {
            let Some(cur) = self.entries.get(&current) else {
                current = next;
                continue;
            };
            let mergeable = self
                .entries
                .get(&next)
                .filter(|n| cur.end_key == next && cur.timestamp == n.timestamp)
                .map(|n| n.end_key.clone());
            match mergeable {
                Some(end_key) => {
                    self.entries.remove(&next);
                    if let Some(cur) = self.entries.get_mut(&current) {
                        cur.end_key = end_key;
                    }
                }
                None => current = next,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ts(wall: i64) -> Timestamp {
        Timestamp::from_wall(wall)
    }

    fn entries(f: &SpanFrontier) -> Vec<(String, String, i64)> {
        f.entries()
            .map(|(s, t)| (s.key.to_string(), s.end_key.to_string(), t.wall_time))
            .collect()
    }

    #[test]
    fn forward_splits_and_merges() {
        let mut f = SpanFrontier::new_at(Timestamp::EMPTY, [Span::new("a", "z")]).unwrap();
        assert_eq!(f.len(), 1);
        assert_eq!(f.frontier(), Timestamp::EMPTY);

        assert!(!f.forward(&Span::new("c", "f"), ts(10)).unwrap());
        assert_eq!(
            entries(&f),
            vec![
                ("a".into(), "c".into(), 0),
                ("c".into(), "f".into(), 10),
                ("f".into(), "z".into(), 0),
            ]
        );

        assert!(!f.forward(&Span::new("a", "c"), ts(10)).unwrap());
        assert_eq!(
            entries(&f),
            vec![("a".into(), "f".into(), 10), ("f".into(), "z".into(), 0)]
        );

        assert!(f.forward(&Span::new("f", "z"), ts(10)).unwrap());
        assert_eq!(entries(&f), vec![("a".into(), "z".into(), 10)]);
        assert_eq!(f.frontier(), ts(10));
    }

    #[test]
    fn forward_never_regresses() {
        let mut f = SpanFrontier::new_at(ts(5), [Span::new("a", "m")]).unwrap();
        f.forward(&Span::new("a", "m"), ts(20)).unwrap();
        assert!(!f.forward(&Span::new("b", "c"), ts(7)).unwrap());
        assert_eq!(entries(&f), vec![("a".into(), "m".into(), 20)]);
    }

    #[test]
    fn untracked_ranges_are_ignored() {
        let mut f = SpanFrontier::new_at(ts(1), [Span::new("c", "e")]).unwrap();
        f.forward(&Span::new("a", "z"), ts(9)).unwrap();
        assert_eq!(entries(&f), vec![("c".into(), "e".into(), 9)]);
        assert_eq!(f.timestamp_at(&Key::from("a")), None);
        assert_eq!(f.timestamp_at(&Key::from("d")), Some(ts(9)));
    }

    #[test]
    fn invalid_span_is_an_error() {
        let mut f = SpanFrontier::new_at(ts(1), [Span::new("a", "z")]).unwrap();
        assert!(matches!(
            f.forward(&Span::new("q", "b"), ts(2)),
            Err(FrontierError::InvalidSpan { .. })
        ));
        assert!(SpanFrontier::new_at(ts(1), [Span::new("b", "b")]).is_err());
    }

    #[test]
    fn overlapping_starting_spans_keep_existing_timestamps() {
        let mut f = SpanFrontier::new_at(ts(1), [Span::new("a", "c")]).unwrap();
        f.forward(&Span::new("a", "c"), ts(4)).unwrap();
        f.add_span_at(Span::new("b", "e"), ts(1)).unwrap();
        assert_eq!(
            entries(&f),
            vec![("a".into(), "c".into(), 4), ("c".into(), "e".into(), 1)]
        );
    }

    #[test]
    fn checkpoint_skips_empty_entries() {
        let mut f = SpanFrontier::new_at(Timestamp::EMPTY, [Span::new("a", "z")]).unwrap();
        assert!(f.checkpoint().is_empty());
        f.forward(&Span::new("a", "b"), ts(3)).unwrap();
        let cp = f.checkpoint();
        assert_eq!(cp.len(), 1);
        assert_eq!(cp.resolved_spans[0].span, Span::new("a", "b"));
        assert_eq!(cp.resolved_spans[0].timestamp, ts(3));
    }

    #[test]
    fn quantized_forward() {
        let second = 1_000_000_000;
        let mut f = SpanFrontier::new_at(Timestamp::EMPTY, [Span::new("a", "z")]).unwrap();
        f.forward_quantized(
            &Span::new("a", "z"),
            Timestamp::new(12 * second + 7, 3),
            Duration::from_secs(5),
            Timestamp::EMPTY,
        )
        .unwrap();
        assert_eq!(f.frontier(), ts(10 * second));

        // timestamps at or below the floor are taken verbatim
        let floor = ts(100 * second);
        let mut f = SpanFrontier::new_at(Timestamp::EMPTY, [Span::new("a", "z")]).unwrap();
        f.forward_quantized(&Span::new("a", "z"), ts(97 * second), Duration::from_secs(5), floor)
            .unwrap();
        assert_eq!(f.frontier(), ts(97 * second));
    }

    const KEYS: &[&str] = &["a", "b", "c", "d", "e", "f", "g", "h"];

    fn arb_span() -> impl Strategy<Value = Span> {
        (0..KEYS.len() - 1, 1..KEYS.len()).prop_filter_map("non-empty span", |(s, e)| {
            (s < e).then(|| Span::new(KEYS[s], KEYS[e]))
        })
    }

    proptest! {
        #[test]
        fn forwarding_is_monotonic_and_disjoint(
            ops in proptest::collection::vec((arb_span(), 0i64..50), 1..40),
            quantize in any::<bool>(),
        ) {
            let granularity = if quantize { Duration::from_nanos(5) } else { Duration::ZERO };
            let mut f = SpanFrontier::new_at(Timestamp::EMPTY, [Span::new("a", "h")]).unwrap();
            let mut observed: Vec<i64> = vec![0; KEYS.len() - 1];
            for (span, wall) in ops {
                let before: Vec<_> = KEYS[..KEYS.len() - 1]
                    .iter()
                    .map(|k| f.timestamp_at(&Key::from(*k)).unwrap())
                    .collect();
                f.forward_quantized(&span, ts(wall), granularity, Timestamp::EMPTY).unwrap();
                for (i, k) in KEYS[..KEYS.len() - 1].iter().enumerate() {
                    let key = Key::from(*k);
                    let after = f.timestamp_at(&key).unwrap();
                    prop_assert!(after >= before[i]);
                    if span.contains_key(&key) {
                        observed[i] = observed[i].max(wall);
                    }
                    prop_assert!(after.wall_time <= observed[i]);
                }
                let spans: Vec<_> = f.entries().map(|(s, _)| s).collect();
                for pair in spans.windows(2) {
                    prop_assert!(pair[0].end_key <= pair[1].key);
                }
            }
        }
    }
}
