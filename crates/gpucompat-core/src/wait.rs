//! Poll-based waiting.
//!
//! There is no wait/notify primitive shared between a recording process and
//! the processes observing it, only mapped memory. Waits are therefore poll
//! loops: a [`WaitableFlag`] is checked and a [`PollPolicy`] decides how long
//! to back off between checks.

use std::time::Duration;

/// A flag that one side raises and another side waits to see cleared.
///
/// Implementors only provide the three state accessors; waiting goes through
/// [`WaitableFlag::wait_cleared`] so that a different wake-up mechanism
/// (a named semaphore, an eventfd) can be swapped in without touching callers.
pub trait WaitableFlag {
    /// Mark the flag as pending.
    fn raise(&self);

    /// Mark the flag as consumed.
    fn clear(&self);

    /// Whether the flag is currently pending.
    fn is_raised(&self) -> bool;

    /// Block until the flag is cleared.
    fn wait_cleared(&self, policy: PollPolicy) {
        poll_until(policy, || !self.is_raised());
    }
}

/// Backoff between two polls of a shared condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPolicy {
    /// Yield the thread, never sleep.
    Spin,
    /// Sleep a fixed interval.
    Constant(Duration),
    /// Double the sleep on every attempt, starting at `initial`, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy::Constant(Duration::from_millis(1))
    }
}

impl PollPolicy {
    /// How long attempt number `attempt` (0-based) sleeps.
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            PollPolicy::Spin => Duration::ZERO,
            PollPolicy::Constant(interval) => interval,
            PollPolicy::Exponential { initial, max } => {
                let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
                initial.saturating_mul(factor).min(max)
            }
        }
    }

    /// Back off once.
    pub fn pause(&self, attempt: u32) {
        let delay = self.delay(attempt);
        if delay.is_zero() {
            std::thread::yield_now();
        } else {
            std::thread::sleep(delay);
        }
    }
}

/// Poll `ready` until it returns true. No timeout.
pub fn poll_until(policy: PollPolicy, mut ready: impl FnMut() -> bool) {
    let mut attempt = 0u32;
    while !ready() {
        policy.pause(attempt);
        attempt = attempt.saturating_add(1);
    }
}

/// Poll `ready` at most `max_attempts` times. Returns whether it became true.
pub fn poll_until_bounded(
    policy: PollPolicy,
    max_attempts: u32,
    mut ready: impl FnMut() -> bool,
) -> bool {
    for attempt in 0..max_attempts {
        if ready() {
            return true;
        }
        policy.pause(attempt);
    }
    ready()
}
