//! The wheel itself: bin placement, the advance/expire algorithm, and
//! introspection.

use core::pin::Pin;
use core::ptr::NonNull;

use crate::bits::{elapsed, highest_set_bit};
use crate::list::List;
use crate::timer::Timer;

/// Number of bins: one per bit position of a `u64`.
const BINS: usize = 64;

/// A hierarchical timeout manager.
///
/// Bins, bin placement, and the advance algorithm are exactly as described
/// in the module-level docs: for every linked (non-expired) timer `t`,
/// `t` lives in `bins[idx]` where `idx` is the position of the highest bit
/// at which `t.when` and `last` differ. Advancing `last` clears that
/// differing bit for some prefix of bins unconditionally (`expire_first`,
/// `expire_bulk`) and re-evaluates the rest individually
/// (`process_setup` + `process_all`), because a changed high bit does not
/// by itself guarantee every member of that bin has expired.
///
/// `Wheel` is single-threaded: every method takes `&mut self`. A host that
/// shares a wheel across threads must wrap it in its own mutex (see the
/// `timer-sync` crate for the house style of doing that) — the core
/// performs no internal locking.
pub struct Wheel<T> {
    last: u64,
    expired: List<T>,
    processing: List<T>,
    bins: [List<T>; BINS],
}

impl<T> Default for Wheel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Wheel<T> {
    /// Creates an empty wheel with `last == 0`. Equivalent to
    /// `hitime_init` on a zeroed struct.
    pub const fn new() -> Self {
        Self {
            last: 0,
            expired: List::new(),
            processing: List::new(),
            bins: [const { List::new() }; BINS],
        }
    }

    /// The most recent `now` observed by this wheel.
    pub fn last(&self) -> u64 {
        self.last
    }

    /// The sentinel value [`Wheel::get_wait`] returns when no timer is
    /// pending: there is nothing to wait for.
    pub const fn max_wait() -> u64 {
        u64::MAX
    }

    fn is_expired(&self, when: u64) -> bool {
        when <= self.last
    }

    /// Computes the bin index for a timer known not to be expired
    /// (`when > last`) and appends it to that bin (`ht_nq`/`bin_nq`).
    ///
    /// # Safety
    ///
    /// `timer` must not currently be linked anywhere, and `timer.when()`
    /// must be `> self.last`.
    unsafe fn bin_nq(&mut self, timer: NonNull<Timer<T>>) {
        let when = unsafe { timer.as_ref().when };
        debug_assert!(when > self.last);
        let idx = highest_set_bit(when ^ self.last) as usize;
        unsafe { self.bins[idx].push_back(timer) };
    }

    /// Links `timer` into the wheel, following the `start` rules from the
    /// module docs: an already-linked timer is silently ignored (the
    /// documented idempotence of double-start); an already-expired timer
    /// goes straight to `expired`; otherwise it is placed in its bin.
    pub fn start(&mut self, timer: Pin<&mut Timer<T>>) {
        // Safety: we never move the pointee; `NonNull` is only used to
        // thread it through the intrusive lists.
        let ptr = unsafe { NonNull::from(Pin::into_inner_unchecked(timer)) };
        if unsafe { ptr.as_ref() }.is_linked() {
            return;
        }
        let when = unsafe { ptr.as_ref() }.when;
        if self.is_expired(when) {
            unsafe { self.expired.push_back(ptr) };
        } else {
            unsafe { self.bin_nq(ptr) };
        }
    }

    /// Starts `timer` with an expiry chosen to minimize reinsertion work
    /// for a caller that only cares about firing somewhere in
    /// `[min, max]`.
    ///
    /// Picks the bin whose granularity matches the slack between `min`
    /// and `max`: `idx` is the highest bit at which they differ (`0` if
    /// they are equal), and `t.when` is set to `max` with every bit below
    /// `idx` cleared. The timer is then started normally. This is the
    /// `b = max ^ min` construction from the reference implementation,
    /// not `max - min` — it selects granularity, not distance.
    pub fn start_range(&mut self, mut timer: Pin<&mut Timer<T>>, min: u64, max: u64) {
        debug_assert!(min <= max);
        let b = max ^ min;
        let idx = if b == 0 { 0 } else { highest_set_bit(b) };
        let mask = !((1u64 << idx).wrapping_sub(1));
        let when = max & mask;
        unsafe {
            timer.as_mut().get_unchecked_mut().when = when;
        }
        self.start(timer);
    }

    /// Unlinks `timer` if it is linked; a no-op otherwise. Never fails.
    pub fn stop(&mut self, timer: Pin<&mut Timer<T>>) {
        let ptr = unsafe { NonNull::from(Pin::into_inner_unchecked(timer)) };
        if !unsafe { ptr.as_ref() }.is_linked() {
            return;
        }
        self.unlink_from_owning_list(ptr);
    }

    /// Retargets `timer`'s expiry, unlinking and re-inserting it under the
    /// `start` rules if it was linked.
    pub fn touch(&mut self, timer: Pin<&mut Timer<T>>, when: u64) {
        let mut ptr = unsafe { NonNull::from(Pin::into_inner_unchecked(timer)) };
        if unsafe { ptr.as_ref() }.is_linked() {
            self.unlink_from_owning_list(ptr);
        }
        unsafe { ptr.as_mut().when = when };
        let timer = unsafe { Pin::new_unchecked(&mut *ptr.as_ptr()) };
        self.start(timer);
    }

    /// `timer` must currently be linked (in a bin or `expired`); this
    /// figures out which in O(1) and unlinks it from there.
    ///
    /// `processing` is never a candidate: it is purely internal scratch
    /// state that only exists for the duration of a single `timeout`/
    /// `timeout_partial` call (invariant 3), and the core never calls back
    /// into the host while it runs, so no `stop`/`touch` can observe a
    /// timer sitting in `processing`.
    fn unlink_from_owning_list(&mut self, timer: NonNull<Timer<T>>) {
        let when = unsafe { timer.as_ref() }.when;
        if self.is_expired(when) {
            unsafe { self.expired.unlink(timer) };
            return;
        }
        let idx = highest_set_bit(when ^ self.last) as usize;
        unsafe { self.bins[idx].unlink(timer) };
    }

    /// Dequeues and returns the next already-expired timer, or `None`.
    pub fn get_next(&mut self) -> Option<Pin<&mut Timer<T>>> {
        let ptr = self.expired.pop_front()?;
        // Safety: the timer was just unlinked, so nothing else references
        // it through the wheel; pinning is preserved because we never move
        // the pointee, only hand back a pinned reference to it.
        Some(unsafe { Pin::new_unchecked(&mut *ptr.as_ptr()) })
    }

    /// The smallest positive `w` such that advancing `last` by `w` would
    /// clear the lowest nonempty bin's triggering bit: the distance from
    /// `last` to the next multiple of `2^i`, where `i` is that bin's
    /// index. `u64::MAX` if no bins are nonempty.
    pub fn get_wait(&self) -> u64 {
        let Some(idx) = self.lowest_nonempty_bin() else {
            return u64::MAX;
        };
        let msb = 1u64 << idx;
        msb - (self.last & (msb - 1))
    }

    /// [`Wheel::get_wait`] adjusted for time already elapsed since `last`
    /// without calling `timeout`.
    pub fn get_wait_with(&self, now: u64) -> u64 {
        let diff = elapsed(now, self.last);
        let w = self.get_wait();
        w.saturating_sub(diff)
    }

    fn lowest_nonempty_bin(&self) -> Option<usize> {
        self.bins.iter().position(|b| !b.is_empty())
    }

    /// Advances the wheel to `now` and reports whether `expired` is
    /// non-empty afterward. A `now <= last` call is a no-op (the
    /// monotonicity invariant: `last` never decreases) but still reports
    /// truthfully whether anything is sitting in `expired` from a prior
    /// call.
    ///
    /// See the module docs for the four phases this performs, in order:
    /// `expire_first`, `expire_bulk`, `process_setup` (with `update_last`
    /// folded into it), and `process_all`.
    pub fn timeout(&mut self, now: u64) -> bool {
        if now > self.last {
            self.expire_first();
            let idx_max = self.expire_bulk(now);
            self.process_setup(now, idx_max);
            self.process_all();
        }
        !self.expired.is_empty()
    }

    /// Delta form of [`Wheel::timeout`]: advances by `delta`, saturating
    /// `last + delta` at `u64::MAX` on overflow.
    pub fn timeout_delta(&mut self, delta: u64) -> bool {
        let now = self.last.saturating_add(delta);
        self.timeout(now)
    }

    /// Bin 0 holds exactly the timers whose `when` differs from `last`
    /// only in bit 0 — given monotonic advance, that means
    /// `when == last + 1`. Any forward step expires all of them
    /// unconditionally.
    fn expire_first(&mut self) {
        let (expired, bin0) = (&mut self.expired, &mut self.bins[0]);
        expired.splice_append(bin0);
    }

    /// For `i` in `1..idx_max` (`idx_max` excluded), every bin covers
    /// timers whose distance from `last` was strictly less than
    /// `2^i <= delta/2`; since `now` and `last` differ at a bit position
    /// `>= idx_max`, all of those timers are guaranteed to have fired.
    /// Returns `idx_max` for [`Wheel::process_setup`] to continue from.
    fn expire_bulk(&mut self, now: u64) -> usize {
        let delta = elapsed(now, self.last);
        let idx_max = if delta == 0 {
            0
        } else {
            highest_set_bit(delta) as usize
        };
        for i in 1..idx_max {
            let (expired, bin) = (&mut self.expired, &mut self.bins[i]);
            expired.splice_append(bin);
        }
        idx_max
    }

    /// The boundary bins `start..=top` (`top` = highest bit at which `now`
    /// and `last` differ) have some members expired and some not; move
    /// them to `processing` for individual re-evaluation, then advance
    /// `last` to `now` (`update_last`) before that re-evaluation happens,
    /// so `is_expired` is computed against the new `last`.
    ///
    /// `start` is `idx_max` clamped up to `1`: bin 0 was already drained
    /// unconditionally by `expire_first` and must not be revisited, even
    /// on a one-tick advance (`idx_max == 0`) where `now ^ last` still has
    /// higher bits set than `now - last` alone would suggest, due to a
    /// carry chain in the subtraction.
    fn process_setup(&mut self, now: u64, idx_max: usize) {
        let bits = now ^ self.last;
        let top = if bits == 0 { 0 } else { highest_set_bit(bits) as usize };
        let start = idx_max.max(1);
        if start <= top {
            for i in start..=top {
                let (processing, bin) = (&mut self.processing, &mut self.bins[i]);
                processing.splice_append(bin);
            }
        }
        self.last = now;
    }

    /// Drains `processing` one entry at a time: timers that have now
    /// expired (against the updated `last`) move to `expired`; the rest
    /// are reinserted via `bin_nq`, which — because the highest bit at
    /// which they differed from the old `last` has now been cleared —
    /// always lands them in a strictly lower bin than the one they came
    /// from.
    fn process_all(&mut self) {
        while let Some(ptr) = self.processing.pop_front() {
            let when = unsafe { ptr.as_ref() }.when;
            if self.is_expired(when) {
                unsafe { self.expired.push_back(ptr) };
            } else {
                unsafe { self.bin_nq(ptr) };
            }
        }
    }

    /// Bounded-latency variant of [`Wheel::timeout`].
    ///
    /// On the first call with a given `now > last`, performs the same
    /// unconditional phases 1-3 as [`Wheel::timeout`] (cheap: at most 64
    /// bins touched), then processes at most `max_ops` entries out of
    /// `processing`. Returns `true` iff `processing` is still non-empty,
    /// in which case the caller should call again with the same or a
    /// later `now` until it returns `false`. A `now <= last` call performs
    /// no phase-1-3 work (same no-op rule as `timeout`) and just drains up
    /// to `max_ops` more of any `processing` left over from a prior call.
    pub fn timeout_partial(&mut self, now: u64, max_ops: usize) -> bool {
        if now > self.last {
            self.expire_first();
            let idx_max = self.expire_bulk(now);
            self.process_setup(now, idx_max);
        }
        for _ in 0..max_ops {
            let Some(ptr) = self.processing.pop_front() else {
                break;
            };
            let when = unsafe { ptr.as_ref() }.when;
            if self.is_expired(when) {
                unsafe { self.expired.push_back(ptr) };
            } else {
                unsafe { self.bin_nq(ptr) };
            }
        }
        !self.processing.is_empty()
    }

    /// Moves every linked timer — every bin plus `processing` — straight
    /// into `expired`, in ascending bin order followed by `processing`.
    /// After this call every timer is either in `expired` or not linked
    /// at all.
    pub fn expire_all(&mut self) {
        for i in 0..BINS {
            let (expired, bin) = (&mut self.expired, &mut self.bins[i]);
            expired.splice_append(bin);
        }
        let (expired, processing) = (&mut self.expired, &mut self.processing);
        expired.splice_append(processing);
    }

    /// Linear count of timers in `bins[i]`; introspection/testing only.
    pub fn count_bin(&self, i: usize) -> usize {
        self.bins[i].count()
    }

    /// Linear count of every linked timer: all bins, `expired`, and
    /// `processing`.
    pub fn count_all(&self) -> usize {
        self.bins.iter().map(List::count).sum::<usize>()
            + self.expired.count()
            + self.processing.count()
    }

    /// Linear count of timers currently sitting in `expired`.
    pub fn count_expired(&self) -> usize {
        self.expired.count()
    }

    /// Writes a human-readable summary of `last` and the population of
    /// `expired`, `processing`, and every nonempty bin via the `log`
    /// facade. Diagnostic only — not a stable interface, matching the
    /// reference implementation's `hitime_dump_stats`.
    pub fn dump_stats(&self) {
        log::info!(
            "wheel: last={} expired={} processing={}",
            self.last,
            self.expired.count(),
            self.processing.count()
        );
        for (i, bin) in self.bins.iter().enumerate() {
            let n = bin.count();
            if n > 0 {
                log::info!("  bin[{i}]: {n}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate alloc;
    use alloc::boxed::Box;
    use core::pin::{pin, Pin};

    use super::*;

    /// Invariant 1: every linked timer sits in the bin its own bit-index
    /// rule predicts, and strictly above `last`.
    #[test]
    fn bin_placement_matches_the_bit_index_rule() {
        let mut w: Wheel<()> = Wheel::new();
        let whens = [1u64, 2, 3, 5, 9, 17, 0x7FFF, 0x8000, u64::MAX];
        let mut storage: alloc::vec::Vec<_> =
            whens.iter().map(|&n| Box::pin(Timer::new(n, ()))).collect();
        for t in storage.iter_mut() {
            w.start(t.as_mut());
        }
        for (i, bin) in w.bins.iter().enumerate() {
            for t in bin.iter() {
                assert_eq!(highest_set_bit(t.when() ^ w.last) as usize, i);
                assert!(t.when() > w.last);
            }
        }
    }

    /// Invariant 2: `expired` only ever holds timers at or below `last`.
    #[test]
    fn expired_only_holds_timers_at_or_below_last() {
        let mut w: Wheel<()> = Wheel::new();
        let mut a = pin!(Timer::new(1, ()));
        let mut b = pin!(Timer::new(100, ()));
        w.start(a.as_mut());
        w.start(b.as_mut());
        w.timeout(50);
        for t in w.expired.iter() {
            assert!(t.when() <= w.last);
        }
        w.stop(b.as_mut());
    }

    /// Invariant 3 (indirect): `processing` is always empty from the
    /// outside — no public method can observe it non-empty, since it is
    /// only ever populated and drained within a single `timeout` call.
    #[test]
    fn processing_is_always_empty_between_calls() {
        let mut w: Wheel<()> = Wheel::new();
        let mut t = pin!(Timer::new(0x10, ()));
        w.start(t.as_mut());
        w.timeout(0x10);
        assert!(w.processing.is_empty());
    }

    /// Invariant 4: `last` never decreases, even across no-op calls.
    #[test]
    fn last_is_non_decreasing() {
        let mut w: Wheel<()> = Wheel::new();
        w.timeout(100);
        assert_eq!(w.last(), 100);
        w.timeout(50);
        assert_eq!(w.last(), 100);
        w.timeout(100);
        assert_eq!(w.last(), 100);
        w.timeout(150);
        assert_eq!(w.last(), 150);
    }

    /// Law 5: `start; stop` is a no-op on observable state.
    #[test]
    fn start_then_stop_restores_prior_state() {
        let mut w: Wheel<()> = Wheel::new();
        let before = w.count_all();
        let mut t = pin!(Timer::new(42, ()));
        w.start(t.as_mut());
        w.stop(t.as_mut());
        assert_eq!(w.count_all(), before);
        assert!(!t.is_linked());
    }

    /// Law 6: two disjoint timers inserted in either order expire via
    /// `expire_all` in the same relative order (their bin's FIFO, then
    /// ascending bin order for anything lower).
    #[test]
    fn insertion_order_of_disjoint_timers_is_irrelevant_to_final_drain() {
        fn drain_order(first: u64, second: u64) -> alloc::vec::Vec<u64> {
            let mut w: Wheel<u64> = Wheel::new();
            let mut a = pin!(Timer::new(first, first));
            let mut b = pin!(Timer::new(second, second));
            w.start(a.as_mut());
            w.start(b.as_mut());
            w.expire_all();
            let mut out = alloc::vec::Vec::new();
            while let Some(t) = w.get_next() {
                out.push(*t.data());
            }
            out
        }
        assert_eq!(drain_order(10, 20), drain_order(20, 10));
    }

    /// Law 7: a timer with `when > last` appears in `expired` exactly once,
    /// only once `last >= when`, across a sequence of `timeout` calls.
    #[test]
    fn timer_expires_exactly_once_no_earlier_than_its_when() {
        let mut w: Wheel<()> = Wheel::new();
        let mut t = pin!(Timer::new(100, ()));
        w.start(t.as_mut());
        for now in [10, 50, 99] {
            w.timeout(now);
            assert_eq!(w.count_expired(), 0);
        }
        w.timeout(100);
        assert_eq!(w.count_expired(), 1);
        assert!(w.get_next().is_some());
        assert!(w.get_next().is_none());
    }

    /// Law 8: advancing by strictly less than `get_wait()` expires nothing.
    #[test]
    fn advancing_less_than_get_wait_expires_nothing() {
        let mut w: Wheel<()> = Wheel::new();
        let mut t = pin!(Timer::new(0x100, ()));
        w.start(t.as_mut());
        let wait = w.get_wait();
        assert!(wait > 1);
        w.timeout(w.last() + wait - 1);
        assert_eq!(w.count_expired(), 0);
    }

    /// Boundary 9: a `when == u64::MAX` timer expires within 64 `timeout`
    /// advances driven by `get_wait`.
    #[test]
    fn max_when_expires_within_64_advances() {
        let mut w: Wheel<()> = Wheel::new();
        let mut t = pin!(Timer::new(u64::MAX, ()));
        w.start(t.as_mut());
        for _ in 0..64 {
            if w.count_expired() > 0 {
                break;
            }
            let wait = w.get_wait();
            assert_ne!(wait, Wheel::<()>::max_wait());
            w.timeout(w.last().saturating_add(wait));
        }
        assert_eq!(w.count_expired(), 1);
    }

    /// Boundary 10: starting a timer already at or below `last` lands it
    /// directly in `expired`.
    #[test]
    fn start_of_already_expired_timer_lands_in_expired() {
        let mut w: Wheel<()> = Wheel::new();
        w.timeout(100);
        let mut t = pin!(Timer::new(50, ()));
        w.start(t.as_mut());
        assert_eq!(w.count_expired(), 1);
    }

    /// Boundary 11: `expire_all` followed by draining `get_next` returns
    /// every previously linked timer exactly once.
    #[test]
    fn expire_all_then_drain_returns_every_timer_once() {
        let mut w: Wheel<()> = Wheel::new();
        let mut storage: alloc::vec::Vec<Pin<Box<Timer<()>>>> =
            (1..=300u64).map(|n| Box::pin(Timer::new(n, ()))).collect();
        for t in storage.iter_mut() {
            w.start(t.as_mut());
        }
        w.expire_all();
        let mut n = 0;
        while w.get_next().is_some() {
            n += 1;
        }
        assert_eq!(n, storage.len());
        assert_eq!(w.count_all(), 0);
    }

    /// Double-start is a documented silent no-op.
    #[test]
    fn double_start_is_a_no_op() {
        let mut w: Wheel<()> = Wheel::new();
        let mut t = pin!(Timer::new(10, ()));
        w.start(t.as_mut());
        w.start(t.as_mut());
        assert_eq!(w.count_all(), 1);
    }

    /// Stop of a not-linked timer is a documented silent no-op.
    #[test]
    fn stop_of_unlinked_timer_is_a_no_op() {
        let mut w: Wheel<()> = Wheel::new();
        let mut t = pin!(Timer::new(10, ()));
        w.stop(t.as_mut());
        assert_eq!(w.count_all(), 0);
    }

    /// `get_next` on an empty `expired` returns `None`.
    #[test]
    fn get_next_on_empty_expired_is_none() {
        let mut w: Wheel<()> = Wheel::new();
        assert!(w.get_next().is_none());
    }

    /// `touch` retargets a linked timer's expiry and re-files it.
    #[test]
    fn touch_retargets_a_linked_timer() {
        let mut w: Wheel<()> = Wheel::new();
        let mut t = pin!(Timer::new(10, ()));
        w.start(t.as_mut());
        w.touch(t.as_mut(), 1000);
        assert_eq!(t.when(), 1000);
        assert!(!w.timeout(999));
        assert!(w.timeout(1000));
        assert!(w.get_next().is_some());
    }

    /// `timeout_partial` bounds work per call and eventually drains fully.
    #[test]
    fn timeout_partial_drains_across_several_calls() {
        let mut w: Wheel<u64> = Wheel::new();
        let mut storage: alloc::vec::Vec<_> =
            (1..=50u64).map(|n| Box::pin(Timer::new(n, n))).collect();
        for t in storage.iter_mut() {
            w.start(t.as_mut());
        }
        let mut calls = 0;
        while w.timeout_partial(100, 4) {
            calls += 1;
            assert!(calls < 1000);
        }
        let mut drained = alloc::vec::Vec::new();
        while let Some(t) = w.get_next() {
            drained.push(*t.data());
        }
        drained.sort_unstable();
        assert_eq!(drained, (1..=50u64).collect::<alloc::vec::Vec<_>>());
    }

    /// `dump_stats` never panics, linked or empty.
    #[test]
    fn dump_stats_does_not_panic() {
        let mut w: Wheel<()> = Wheel::new();
        let mut t = pin!(Timer::new(5, ()));
        w.start(t.as_mut());
        w.dump_stats();
        w.stop(t.as_mut());
        w.dump_stats();
    }
}
