//! Subscription partitioner: maps instrument names to sessions and plans
//! minimum-movement rebalances when load drifts.
//!
//! Assignment is a stable hash of the name modulo the session count, with
//! overflow spilling to the next session round-robin. Stability matters:
//! a small change in the universe must not reshuffle existing assignments.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::models::CHANNELS_PER_INSTRUMENT;

/// A session is overloaded when it exceeds the mean by this fraction...
const REBALANCE_TOLERANCE: f64 = 0.10;
/// ...and by more than this many instruments (ignore drift on small books).
const REBALANCE_SLACK: usize = 20;
/// At most one executed rebalance per window.
const REBALANCE_MIN_INTERVAL: Duration = Duration::from_secs(600);

/// FNV-1a: stable across processes and restarts, unlike the std hasher.
pub fn fnv1a(name: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in name.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// One planned migration; the executor always unsubscribes on `from`
/// before subscribing on `to` so no interim state exceeds a session cap.
#[derive(Debug, Clone, PartialEq)]
pub struct Move {
    pub from: usize,
    pub to: usize,
    pub instruments: Vec<String>,
}

pub struct Partitioner {
    session_count: usize,
    /// Instrument capacity per session, derived from the channel cap.
    session_cap_instruments: usize,
    last_rebalance: Mutex<Option<Instant>>,
}

impl Partitioner {
    pub fn new(session_count: usize, session_cap_channels: usize) -> Self {
        Self {
            session_count: session_count.max(1),
            session_cap_instruments: (session_cap_channels / CHANNELS_PER_INSTRUMENT).max(1),
            last_rebalance: Mutex::new(None),
        }
    }

    /// The hash-preferred session for a name.
    pub fn home(&self, name: &str) -> usize {
        (fnv1a(name) % self.session_count as u64) as usize
    }

    /// Target session for a new instrument given current per-session counts:
    /// home first, spilling round-robin past full sessions. `None` when every
    /// session is at capacity.
    pub fn assign(&self, name: &str, counts: &[usize]) -> Option<usize> {
        let home = self.home(name);
        for offset in 0..self.session_count {
            let candidate = (home + offset) % self.session_count;
            if counts
                .get(candidate)
                .is_some_and(|&c| c < self.session_cap_instruments)
            {
                return Some(candidate);
            }
        }
        None
    }

    fn mean(counts: &[usize]) -> f64 {
        if counts.is_empty() {
            return 0.0;
        }
        counts.iter().sum::<usize>() as f64 / counts.len() as f64
    }

    /// Largest per-session count that does NOT trigger a rebalance.
    fn overload_threshold(mean: f64) -> usize {
        (mean * (1.0 + REBALANCE_TOLERANCE)).max(mean + REBALANCE_SLACK as f64) as usize
    }

    fn session_overloaded(count: usize, mean: f64) -> bool {
        count as f64 > mean * (1.0 + REBALANCE_TOLERANCE)
            && count as f64 - mean > REBALANCE_SLACK as f64
    }

    /// Whether any session has drifted past both tolerance and slack.
    pub fn needs_rebalance(&self, counts: &[usize]) -> bool {
        let mean = Self::mean(counts);
        counts.iter().any(|&c| Self::session_overloaded(c, mean))
    }

    /// Rebalances are rate-limited; returns false while the window is open.
    pub fn try_begin_rebalance(&self) -> bool {
        let mut last = self.last_rebalance.lock();
        let due = match *last {
            Some(at) => at.elapsed() >= REBALANCE_MIN_INTERVAL,
            None => true,
        };
        if due {
            *last = Some(Instant::now());
        }
        due
    }

    /// Minimum-movement diff from the current assignment to one inside
    /// tolerance. Overloaded sessions shed instruments (spilled instruments
    /// first, they were misplaced to begin with) down to the overload
    /// threshold; the least-loaded sessions absorb them up to the mean.
    pub fn plan_rebalance(&self, assignment: &[Vec<String>]) -> Vec<Move> {
        let counts: Vec<usize> = assignment.iter().map(|a| a.len()).collect();
        let mean = Self::mean(&counts);
        let shed_to = Self::overload_threshold(mean);
        let absorb_to = (mean.ceil() as usize).min(self.session_cap_instruments);

        let mut planned: Vec<usize> = counts.clone();
        let mut moves = Vec::new();

        for donor in 0..assignment.len() {
            if !Self::session_overloaded(counts[donor], mean) {
                continue;
            }
            let mut excess = planned[donor].saturating_sub(shed_to);
            if excess == 0 {
                continue;
            }

            // Shed spilled instruments before natives.
            let mut candidates: Vec<&String> = assignment[donor].iter().collect();
            candidates.sort_by_key(|name| (self.home(name) == donor, fnv1a(name)));
            let mut candidates = candidates.into_iter();

            let mut recipients: Vec<usize> = (0..assignment.len())
                .filter(|&i| i != donor)
                .collect();
            recipients.sort_by_key(|&i| planned[i]);

            for recipient in recipients {
                if excess == 0 {
                    break;
                }
                let room = absorb_to.saturating_sub(planned[recipient]);
                let take = room.min(excess);
                if take == 0 {
                    continue;
                }
                let instruments: Vec<String> =
                    candidates.by_ref().take(take).cloned().collect();
                if instruments.is_empty() {
                    break;
                }
                let moved = instruments.len();
                planned[donor] -= moved;
                planned[recipient] += moved;
                excess -= moved;
                moves.push(Move {
                    from: donor,
                    to: recipient,
                    instruments,
                });
            }

            if excess > 0 {
                debug!(
                    donor,
                    stranded = excess,
                    "rebalance_recipients_full"
                );
            }
        }

        moves
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(n: usize, prefix: &str) -> Vec<String> {
        (0..n).map(|i| format!("{}-{}", prefix, i)).collect()
    }

    #[test]
    fn home_is_deterministic_and_in_range() {
        let partitioner = Partitioner::new(3, 500);
        let a = partitioner.home("BTC-27JUN25-100000-C");
        let b = partitioner.home("BTC-27JUN25-100000-C");
        assert_eq!(a, b);
        assert!(a < 3);

        // fnv1a itself must be stable across builds.
        assert_eq!(fnv1a(""), 0xcbf2_9ce4_8422_2325);
    }

    #[test]
    fn hash_spreads_a_real_universe() {
        let partitioner = Partitioner::new(3, 2000);
        let mut counts = [0usize; 3];
        for i in 0..900 {
            counts[partitioner.home(&format!("BTC-26SEP25-{}00-C", i))] += 1;
        }
        // Rough spread: no session should be empty or hold everything.
        for c in counts {
            assert!(c > 150, "lopsided distribution: {:?}", counts);
        }
    }

    #[test]
    fn assign_spills_past_full_sessions() {
        let partitioner = Partitioner::new(3, 10); // 5 instruments/session
        let name = "BTC-27JUN25-100000-C";
        let home = partitioner.home(name);

        let mut counts = vec![0usize; 3];
        assert_eq!(partitioner.assign(name, &counts), Some(home));

        counts[home] = 5;
        let spilled = partitioner.assign(name, &counts).unwrap();
        assert_eq!(spilled, (home + 1) % 3);

        // Everything full -> no assignment.
        assert_eq!(partitioner.assign(name, &[5, 5, 5]), None);
    }

    #[test]
    fn rebalance_requires_both_tolerance_and_slack() {
        let partitioner = Partitioner::new(3, 2000);

        // 10% over but within the 20-instrument slack: no rebalance.
        assert!(!partitioner.needs_rebalance(&[25, 5, 0]));

        // Exactly at tolerance is not over it.
        assert!(!partitioner.needs_rebalance(&[220, 190, 190]));

        // Past both conditions.
        assert!(partitioner.needs_rebalance(&[400, 100, 100]));
    }

    #[test]
    fn plan_moves_drift_back_within_tolerance() {
        let partitioner = Partitioner::new(3, 2000);
        let assignment = vec![named(400, "A"), named(100, "B"), named(100, "C")];
        let moves = partitioner.plan_rebalance(&assignment);

        assert!(!moves.is_empty());
        let moved: usize = moves.iter().map(|m| m.instruments.len()).sum();
        // mean 200, threshold 220: shed exactly down to the threshold.
        assert_eq!(moved, 180);
        assert!(moves.iter().all(|m| m.from == 0));

        // Apply and re-check: drift resolved, nothing newly overloaded.
        let mut counts = vec![400usize, 100, 100];
        for m in &moves {
            counts[m.from] -= m.instruments.len();
            counts[m.to] += m.instruments.len();
        }
        assert_eq!(counts[0], 220);
        assert!(!partitioner.needs_rebalance(&counts));
        assert!(counts.iter().all(|&c| c <= 1000));
    }

    #[test]
    fn plan_is_empty_when_balanced() {
        let partitioner = Partitioner::new(3, 2000);
        let assignment = vec![named(200, "A"), named(200, "B"), named(200, "C")];
        assert!(partitioner.plan_rebalance(&assignment).is_empty());
    }

    #[test]
    fn plan_only_moves_donor_instruments() {
        let partitioner = Partitioner::new(2, 2000);
        let donor_set = named(300, "A");
        let assignment = vec![donor_set.clone(), named(100, "B")];
        let moves = partitioner.plan_rebalance(&assignment);

        for m in &moves {
            for name in &m.instruments {
                assert!(donor_set.contains(name));
            }
        }
    }

    #[test]
    fn rebalance_rate_limited_to_one_per_window() {
        let partitioner = Partitioner::new(3, 2000);
        assert!(partitioner.try_begin_rebalance());
        assert!(!partitioner.try_begin_rebalance());
    }

    #[test]
    fn recipients_never_pushed_past_capacity() {
        // Tiny caps: recipients can only absorb up to capacity.
        let partitioner = Partitioner::new(2, 100); // 50 instruments/session
        let assignment = vec![named(50, "A"), named(4, "B")];
        let moves = partitioner.plan_rebalance(&assignment);

        let mut counts = vec![50usize, 4];
        for m in &moves {
            counts[m.from] -= m.instruments.len();
            counts[m.to] += m.instruments.len();
        }
        assert!(counts.iter().all(|&c| c <= 50));
    }
}
