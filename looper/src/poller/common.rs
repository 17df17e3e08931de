use bitflags::bitflags;
use std::time::Instant;

bitflags! {
    /// Readiness conditions of a watched descriptor.
    ///
    /// `INPUT` and `OUTPUT` are the interests a caller can ask for.
    /// `ERROR` and `HANGUP` are always reported by the kernel, whether
    /// requested or not.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Events: u32 {
        const INPUT = 1 << 0;
        const OUTPUT = 1 << 1;
        const ERROR = 1 << 2;
        const HANGUP = 1 << 3;
    }
}

/// A readiness record reported by the poller.
///
/// `seq` is the tag the descriptor was registered with, not the descriptor
/// itself, so records that belong to a replaced registration can be told
/// apart from the current one.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Event {
    pub(crate) seq: u64,
    pub(crate) events: Events,
}

/// Milliseconds from `now` until `deadline`, rounded up.
///
/// Rounding up means a wait never ends before the deadline it was computed
/// for. Deadlines in the past give `0`; anything past `i32::MAX`
/// milliseconds is clamped.
pub(crate) fn millis_until(now: Instant, deadline: Instant) -> i32 {
    let nanos = deadline.saturating_duration_since(now).as_nanos();
    let millis = nanos.div_ceil(1_000_000);

    millis.min(i32::MAX as u128) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn millis_until_rounds_up() {
        let now = Instant::now();

        assert_eq!(millis_until(now, now), 0);
        assert_eq!(millis_until(now, now + Duration::from_nanos(1)), 1);
        assert_eq!(millis_until(now, now + Duration::from_micros(1500)), 2);
        assert_eq!(millis_until(now, now + Duration::from_millis(50)), 50);
    }

    #[test]
    fn millis_until_past_deadline_is_zero() {
        let now = Instant::now();
        let earlier = now.checked_sub(Duration::from_millis(5)).unwrap_or(now);

        assert_eq!(millis_until(now, earlier), 0);
    }

    #[test]
    fn millis_until_clamps() {
        let now = Instant::now();
        let far = now + Duration::from_secs(60 * 60 * 24 * 365);

        assert_eq!(millis_until(now, far), i32::MAX);
    }
}
