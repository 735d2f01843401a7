use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Hybrid logical clock value: (physical-time ms, logical counter).
/// Totally ordered by `(pt, lt)`; ties across sites are broken at the
/// applier layer by comparing site ids lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hlc {
    pub pt: i64,
    pub lt: u32,
}

impl Hlc {
    pub fn new() -> Self {
        Self { pt: wall_now_ms(), lt: 0 }
    }

    /// Advance the clock for a locally originated event. Guarantees strict
    /// monotonicity within a site: the returned value is always `> c`.
    pub fn send(c: Hlc) -> Self {
        let now = wall_now_ms();
        if now > c.pt {
            Self { pt: now, lt: 0 }
        } else {
            Self { pt: c.pt, lt: c.lt + 1 }
        }
    }

    /// Merge a locally observed clock with one carried by an incoming
    /// change, per §4.1.
    pub fn receive(local: Hlc, remote: Hlc) -> Self {
        let now = wall_now_ms();
        let p = now.max(local.pt).max(remote.pt);
        let lt = if p == local.pt && p == remote.pt {
            local.lt.max(remote.lt) + 1
        } else if p == local.pt {
            local.lt + 1
        } else if p == remote.pt {
            remote.lt + 1
        } else {
            0
        };
        Self { pt: p, lt }
    }

    /// Fixed-width "pt-lt" string whose lexicographic order matches the
    /// clock's numeric order. `pt` is zero-padded to 20 digits (covers the
    /// full range of a non-negative i64 millisecond timestamp), `lt` to 10.
    pub fn encode(&self) -> String {
        format!("{:020}-{:010}", self.pt, self.lt)
    }

    pub fn decode(s: &str) -> Option<Self> {
        let (pt_s, lt_s) = s.split_once('-')?;
        let pt = pt_s.parse::<i64>().ok()?;
        let lt = lt_s.parse::<u32>().ok()?;
        Some(Self { pt, lt })
    }
}

impl Default for Hlc {
    fn default() -> Self {
        Self::new()
    }
}

fn wall_now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_is_strictly_monotonic() {
        let a = Hlc::new();
        let b = Hlc::send(a);
        assert!(b > a);
        let c = Hlc::send(b);
        assert!(c > b);
    }

    #[test]
    fn encode_preserves_numeric_order() {
        let a = Hlc { pt: 5, lt: 2 };
        let b = Hlc { pt: 5, lt: 10 };
        assert!(a < b);
        assert!(a.encode() < b.encode());
    }

    #[test]
    fn decode_roundtrips() {
        let a = Hlc { pt: 1_725_000_123_456, lt: 42 };
        let s = a.encode();
        assert_eq!(Hlc::decode(&s), Some(a));
    }

    #[test]
    fn receive_picks_max_and_bumps_tied_counter() {
        let now = wall_now_ms();
        let local = Hlc { pt: now, lt: 3 };
        let remote = Hlc { pt: now, lt: 5 };
        let merged = Hlc::receive(local, remote);
        assert_eq!(merged.pt, now);
        assert_eq!(merged.lt, 6);
    }

    #[test]
    fn receive_prefers_future_remote_pt() {
        let now = wall_now_ms();
        let local = Hlc { pt: now, lt: 3 };
        let remote = Hlc { pt: now + 10_000, lt: 1 };
        let merged = Hlc::receive(local, remote);
        assert_eq!(merged.pt, remote.pt);
        assert_eq!(merged.lt, remote.lt + 1);
    }
}
