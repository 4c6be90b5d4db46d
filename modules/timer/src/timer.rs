//! The timer record: the leaf value embedded in caller-owned storage.

use core::marker::PhantomPinned;
use core::ptr::NonNull;

/// Intrusive list hooks plus the "am I currently linked" bit.
///
/// A circular sentinel list (as the reference C implementation uses)
/// would make `Timer` self-referential once linked; we use a head/tail
/// `Option<NonNull<_>>` list instead (see [`crate::list::List`]), which
/// means a singleton node has `next == prev == None` just like an
/// unlinked one. `linked` disambiguates the two, preserving the
/// "both hooks null iff not in any list" invariant from the outside.
pub(crate) struct Link<T> {
    pub(crate) next: Option<NonNull<Timer<T>>>,
    pub(crate) prev: Option<NonNull<Timer<T>>>,
    pub(crate) linked: bool,
}

impl<T> Link<T> {
    const fn new() -> Self {
        Self {
            next: None,
            prev: None,
            linked: false,
        }
    }
}

/// A single pending timeout.
///
/// `Timer` carries its absolute expiry (`when`), an opaque caller payload
/// (`data`), and the list hooks the wheel uses to track it. The wheel never
/// inspects `data`; it is free for the caller to use as a waker, a
/// connection handle, a callback closure, or anything else.
///
/// `Timer` is `!Unpin`: once handed to [`Wheel::start`][crate::Wheel::start]
/// its address must not change until it is stopped or drained, exactly as
/// the reference implementation requires for its intrusive list pointers
/// to stay valid. Callers therefore pin it (on the stack with
/// [`core::pin::pin!`], or behind a `Box`/`Arc`) before starting it.
pub struct Timer<T> {
    pub(crate) when: u64,
    data: T,
    pub(crate) link: Link<T>,
    _pin: PhantomPinned,
}

impl<T> Timer<T> {
    /// Creates a new, unlinked timer with the given absolute expiry and
    /// payload. Equivalent to the reference implementation's
    /// `hitimeout_init` + `hitimeout_set` in one step.
    pub const fn new(when: u64, data: T) -> Self {
        Self {
            when,
            data,
            link: Link::new(),
            _pin: PhantomPinned,
        }
    }

    /// The timer's absolute expiry instant.
    pub fn when(&self) -> u64 {
        self.when
    }

    /// The caller's opaque payload.
    pub fn data(&self) -> &T {
        &self.data
    }

    /// Mutable access to the caller's opaque payload. The wheel never reads
    /// or writes this field, so mutating it while the timer is linked is
    /// always sound.
    pub fn data_mut(&mut self) -> &mut T {
        &mut self.data
    }

    /// Re-targets an unlinked timer to a new expiry/payload, equivalent to
    /// `hitimeout_set`.
    ///
    /// # Panics
    ///
    /// Debug builds assert the timer is not currently linked in a wheel;
    /// use [`Wheel::touch`][crate::Wheel::touch] to change the expiry of a
    /// live timer.
    pub fn set(&mut self, when: u64, data: T) {
        debug_assert!(!self.is_linked(), "timer_set called on a linked timer");
        self.when = when;
        self.data = data;
    }

    /// True if this timer is currently linked into some list owned by a
    /// [`Wheel`][crate::Wheel] (a bin, `expired`, or `processing`).
    pub fn is_linked(&self) -> bool {
        self.link.linked
    }
}

impl<T: Default> Timer<T> {
    /// Resets a timer back to its zero-valued, unlinked state, equivalent
    /// to `hitimeout_reset`.
    ///
    /// # Panics
    ///
    /// Debug builds assert the timer is not currently linked.
    pub fn reset(&mut self) {
        debug_assert!(!self.is_linked(), "timer_reset called on a linked timer");
        self.when = 0;
        self.data = T::default();
    }
}

impl<T> Drop for Timer<T> {
    fn drop(&mut self) {
        debug_assert!(
            !self.link.linked,
            "dropped a Timer while it was still linked into a Wheel; \
             stop() it first or drain the wheel via expire_all()+get_next()"
        );
    }
}
