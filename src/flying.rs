//! The flying-transfer registry: every submitted transfer ordered by its
//! absolute deadline, finite deadlines first, and the one timer armed for the
//! earliest deadline nobody has handled yet.
use crate::error::Result;
use crate::transfer::Transfer;
use bitflags::bitflags;
use nix::sys::time::{TimeSpec, TimeValLike};
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

bitflags! {
    /// Timeout bookkeeping, guarded by the registry lock.
    pub struct TimeoutFlags: u8 {
        /// Expiration processing already cancelled this transfer.
        const HANDLED = 0x01;
        /// The backend enforces the timeout itself.
        const OS_HANDLES_TIMEOUT = 0x02;
        /// The timeout cancellation was accepted.
        const TIMED_OUT = 0x04;
    }
}

/// A one-shot timer the event loop can poll.
pub trait DeadlineTimer: Send {
    fn arm(&mut self, deadline: Instant, now: Instant) -> Result<()>;
    fn disarm(&mut self) -> Result<()>;
    fn armed_for(&self) -> Option<Instant>;
    /// Descriptor that turns readable when the timer expires.
    fn fd(&self) -> Option<RawFd>;
    /// Acknowledge an expiry reported through `fd`.
    fn consume(&mut self);
}

pub struct TimerFdTimer {
    fd: TimerFd,
    armed: Option<Instant>,
}

impl TimerFdTimer {
    pub fn new() -> Result<Self> {
        let fd = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )?;
        Ok(TimerFdTimer { fd, armed: None })
    }
}

impl DeadlineTimer for TimerFdTimer {
    fn arm(&mut self, deadline: Instant, now: Instant) -> Result<()> {
        // A zero expiration would disarm the timer.
        let relative = deadline
            .saturating_duration_since(now)
            .max(Duration::from_nanos(1));
        self.fd.set(
            Expiration::OneShot(TimeSpec::nanoseconds(
                relative.as_nanos().min(i64::MAX as u128) as i64,
            )),
            TimerSetTimeFlags::empty(),
        )?;
        self.armed = Some(deadline);
        Ok(())
    }

    fn disarm(&mut self) -> Result<()> {
        self.armed = None;
        self.fd.unset()?;
        Ok(())
    }

    fn armed_for(&self) -> Option<Instant> {
        self.armed
    }

    fn fd(&self) -> Option<RawFd> {
        Some(self.fd.as_raw_fd())
    }

    fn consume(&mut self) {
        let mut expirations = [0u8; 8];
        match nix::unistd::read(self.fd.as_raw_fd(), &mut expirations) {
            Ok(_) | Err(nix::errno::Errno::EAGAIN) => {}
            Err(e) => log::warn!("timerfd read failed: {}", e),
        }
        self.armed = None;
    }
}

pub(crate) struct FlyingEntry {
    pub(crate) transfer: Transfer,
    pub(crate) deadline: Option<Instant>,
    pub(crate) flags: TimeoutFlags,
}

pub(crate) struct Registry {
    entries: Vec<FlyingEntry>,
    timer: Box<dyn DeadlineTimer>,
}

impl Registry {
    pub(crate) fn new(timer: Box<dyn DeadlineTimer>) -> Self {
        Registry {
            entries: Vec::new(),
            timer,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn transfers(&self) -> impl Iterator<Item = &Transfer> {
        self.entries.iter().map(|e| &e.transfer)
    }

    pub(crate) fn timer_fd(&self) -> Option<RawFd> {
        self.timer.fd()
    }

    pub(crate) fn timer_armed_for(&self) -> Option<Instant> {
        self.timer.armed_for()
    }

    pub(crate) fn consume_timer(&mut self) {
        self.timer.consume();
    }

    pub(crate) fn timeout_flags(&self, transfer: &Transfer) -> Option<TimeoutFlags> {
        self.entries
            .iter()
            .find(|e| &e.transfer == transfer)
            .map(|e| e.flags)
    }

    /// Ordered insertion. Ties keep submission order. A new earliest finite
    /// deadline arms the timer; if that fails the entry is taken out again.
    pub(crate) fn insert(
        &mut self,
        transfer: Transfer,
        deadline: Option<Instant>,
        os_handles_timeout: bool,
        now: Instant,
    ) -> Result<()> {
        let mut flags = TimeoutFlags::empty();
        if os_handles_timeout {
            flags |= TimeoutFlags::OS_HANDLES_TIMEOUT;
        }
        let position = match deadline {
            None => self.entries.len(),
            Some(d) => self
                .entries
                .iter()
                .position(|e| match e.deadline {
                    None => true,
                    Some(cur) => cur > d,
                })
                .unwrap_or(self.entries.len()),
        };
        self.entries.insert(
            position,
            FlyingEntry {
                transfer,
                deadline,
                flags,
            },
        );

        // handled and OS-timed entries ahead of us do not own the timer
        if let Some(d) = deadline {
            if self.timer_owner() == Some(position) {
                if let Err(e) = self.timer.arm(d, now) {
                    log::warn!("failed to arm timer: {}", e);
                    self.entries.remove(position);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Unlinks `transfer`. Returns whether it was registered. Removing the
    /// entry the timer is armed for rearms it for the next one; a rearm
    /// failure is returned but the entry is gone either way.
    pub(crate) fn remove(&mut self, transfer: &Transfer, now: Instant) -> Result<bool> {
        let position = match self.entries.iter().position(|e| &e.transfer == transfer) {
            Some(p) => p,
            None => return Ok(false),
        };
        let before = self.next_deadline();
        self.entries.remove(position);
        if self.next_deadline() != before {
            self.rearm_for_next(now)?;
        }
        Ok(true)
    }

    pub(crate) fn rearm_for_next(&mut self, now: Instant) -> Result<()> {
        let next = self.next_deadline();
        match next {
            Some(deadline) => self.timer.arm(deadline, now),
            None => self.timer.disarm(),
        }
    }

    /// The earliest finite deadline expiration processing still owns.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.timer_owner().and_then(|i| self.entries[i].deadline)
    }

    fn timer_owner(&self) -> Option<usize> {
        self.entries
            .iter()
            .take_while(|e| e.deadline.is_some())
            .position(|e| {
                !e.flags
                    .intersects(TimeoutFlags::HANDLED | TimeoutFlags::OS_HANDLES_TIMEOUT)
            })
    }

    /// Cancels every entry whose deadline passed, front to back.
    ///
    /// `cancel` is called with the registry still locked, it may take the
    /// transfer lock but must not touch the registry.
    pub(crate) fn expire<F>(&mut self, now: Instant, mut cancel: F)
    where
        F: FnMut(&Transfer) -> Result<()>,
    {
        for entry in self.entries.iter_mut() {
            let deadline = match entry.deadline {
                Some(d) => d,
                None => break,
            };
            if entry
                .flags
                .intersects(TimeoutFlags::HANDLED | TimeoutFlags::OS_HANDLES_TIMEOUT)
            {
                continue;
            }
            if deadline > now {
                break;
            }
            entry.flags |= TimeoutFlags::HANDLED;
            match cancel(&entry.transfer) {
                Ok(()) => entry.flags |= TimeoutFlags::TIMED_OUT,
                Err(e) => log::warn!("async cancel of timed out {:?} failed: {}", entry.transfer, e),
            }
        }
    }

    /// Entries of one handle, for close time reconciliation.
    pub(crate) fn remove_where<F>(&mut self, mut pred: F, now: Instant) -> (Vec<Transfer>, Result<()>)
    where
        F: FnMut(&Transfer) -> bool,
    {
        let before = self.next_deadline();
        let mut removed = Vec::new();
        self.entries.retain(|e| {
            let hit = pred(&e.transfer);
            if hit {
                removed.push(e.transfer.clone());
            }
            !hit
        });
        let res = if self.next_deadline() != before {
            self.rearm_for_next(now)
        } else {
            Ok(())
        };
        (removed, res)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::Error;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    pub(crate) struct FakeTimerState {
        pub armed: Option<Instant>,
        pub arms: usize,
        pub fail_next_arm: bool,
    }

    pub(crate) struct FakeTimer(pub Arc<Mutex<FakeTimerState>>);

    impl DeadlineTimer for FakeTimer {
        fn arm(&mut self, deadline: Instant, _now: Instant) -> Result<()> {
            let mut s = self.0.lock();
            if s.fail_next_arm {
                s.fail_next_arm = false;
                return Err(Error::Io);
            }
            s.armed = Some(deadline);
            s.arms += 1;
            Ok(())
        }

        fn disarm(&mut self) -> Result<()> {
            self.0.lock().armed = None;
            Ok(())
        }

        fn armed_for(&self) -> Option<Instant> {
            self.0.lock().armed
        }

        fn fd(&self) -> Option<RawFd> {
            None
        }

        fn consume(&mut self) {}
    }

    fn registry() -> (Registry, Arc<Mutex<FakeTimerState>>) {
        let state = Arc::new(Mutex::new(FakeTimerState::default()));
        (Registry::new(Box::new(FakeTimer(state.clone()))), state)
    }

    fn order(reg: &Registry) -> Vec<Option<Instant>> {
        reg.entries.iter().map(|e| e.deadline).collect()
    }

    #[test]
    fn finite_deadlines_sort_before_infinite() {
        let (mut reg, timer) = registry();
        let now = Instant::now();
        let (a, b, c) = (Transfer::new(0), Transfer::new(0), Transfer::new(0));
        reg.insert(a.clone(), Some(now + Duration::from_millis(1000)), false, now)
            .unwrap();
        reg.insert(b.clone(), None, false, now).unwrap();
        reg.insert(c.clone(), Some(now + Duration::from_millis(500)), false, now)
            .unwrap();

        assert_eq!(
            order(&reg),
            vec![
                Some(now + Duration::from_millis(500)),
                Some(now + Duration::from_millis(1000)),
                None
            ]
        );
        assert_eq!(reg.transfers().cloned().collect::<Vec<_>>(), vec![c, a, b]);
        assert_eq!(timer.lock().armed, Some(now + Duration::from_millis(500)));
        assert_eq!(timer.lock().arms, 2);
    }

    #[test]
    fn ties_keep_submission_order() {
        let (mut reg, timer) = registry();
        let now = Instant::now();
        let d = Some(now + Duration::from_millis(100));
        let (a, b) = (Transfer::new(0), Transfer::new(0));
        reg.insert(a.clone(), d, false, now).unwrap();
        reg.insert(b.clone(), d, false, now).unwrap();
        assert_eq!(reg.transfers().cloned().collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(timer.lock().arms, 1);
    }

    #[test]
    fn removing_the_front_rearms_or_disarms() {
        let (mut reg, timer) = registry();
        let now = Instant::now();
        let (a, b, c) = (Transfer::new(0), Transfer::new(0), Transfer::new(0));
        reg.insert(a.clone(), Some(now + Duration::from_millis(10)), false, now)
            .unwrap();
        reg.insert(b.clone(), Some(now + Duration::from_millis(20)), false, now)
            .unwrap();
        reg.insert(c.clone(), None, false, now).unwrap();

        assert_eq!(reg.remove(&a, now), Ok(true));
        assert_eq!(timer.lock().armed, Some(now + Duration::from_millis(20)));
        assert_eq!(reg.remove(&b, now), Ok(true));
        assert_eq!(timer.lock().armed, None);
        assert_eq!(reg.remove(&b, now), Ok(false));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn arm_failure_aborts_insert() {
        let (mut reg, timer) = registry();
        let now = Instant::now();
        timer.lock().fail_next_arm = true;
        let t = Transfer::new(0);
        assert_eq!(
            reg.insert(t.clone(), Some(now + Duration::from_millis(5)), false, now),
            Err(Error::Io)
        );
        assert_eq!(reg.len(), 0);
        assert!(reg.timeout_flags(&t).is_none());
    }

    #[test]
    fn rearm_failure_on_remove_still_removes() {
        let (mut reg, timer) = registry();
        let now = Instant::now();
        let (a, b) = (Transfer::new(0), Transfer::new(0));
        reg.insert(a.clone(), Some(now + Duration::from_millis(5)), false, now)
            .unwrap();
        reg.insert(b, Some(now + Duration::from_millis(6)), false, now)
            .unwrap();
        timer.lock().fail_next_arm = true;
        assert_eq!(reg.remove(&a, now), Err(Error::Io));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn os_handled_timeouts_never_arm() {
        let (mut reg, timer) = registry();
        let now = Instant::now();
        reg.insert(Transfer::new(0), Some(now + Duration::from_millis(5)), true, now)
            .unwrap();
        assert_eq!(timer.lock().armed, None);
        assert_eq!(reg.next_deadline(), None);
    }

    #[test]
    fn expiry_marks_handled_and_timed_out() {
        let (mut reg, _timer) = registry();
        let now = Instant::now();
        let (a, b, c, d) = (
            Transfer::new(0),
            Transfer::new(0),
            Transfer::new(0),
            Transfer::new(0),
        );
        reg.insert(a.clone(), Some(now + Duration::from_millis(1)), false, now)
            .unwrap();
        reg.insert(b.clone(), Some(now + Duration::from_millis(2)), false, now)
            .unwrap();
        reg.insert(c.clone(), Some(now + Duration::from_secs(10)), false, now)
            .unwrap();
        reg.insert(d.clone(), None, false, now).unwrap();

        let later = now + Duration::from_millis(5);
        let mut cancelled = vec![];
        reg.expire(later, |t| {
            cancelled.push(t.clone());
            if t == &b {
                Err(Error::NotFound)
            } else {
                Ok(())
            }
        });
        assert_eq!(cancelled, vec![a.clone(), b.clone()]);
        assert_eq!(
            reg.timeout_flags(&a),
            Some(TimeoutFlags::HANDLED | TimeoutFlags::TIMED_OUT)
        );
        assert_eq!(reg.timeout_flags(&b), Some(TimeoutFlags::HANDLED));
        assert_eq!(reg.timeout_flags(&c), Some(TimeoutFlags::empty()));
        assert_eq!(reg.next_deadline(), Some(now + Duration::from_secs(10)));

        // handled entries are not cancelled twice
        let mut again = 0;
        reg.expire(later, |_| {
            again += 1;
            Ok(())
        });
        assert_eq!(again, 0);
    }

    #[test]
    fn remove_where_rearms_when_front_goes() {
        let (mut reg, timer) = registry();
        let now = Instant::now();
        let (a, b) = (Transfer::new(0), Transfer::new(0));
        reg.insert(a.clone(), Some(now + Duration::from_millis(1)), false, now)
            .unwrap();
        reg.insert(b.clone(), Some(now + Duration::from_millis(2)), false, now)
            .unwrap();
        let (removed, res) = reg.remove_where(|t| t == &a, now);
        assert_eq!(removed, vec![a]);
        assert!(res.is_ok());
        assert_eq!(timer.lock().armed, Some(now + Duration::from_millis(2)));
    }

    #[test]
    fn insert_behind_a_handled_entry_arms() {
        let (mut reg, timer) = registry();
        let now = Instant::now();
        let (a, b) = (Transfer::new(0), Transfer::new(0));
        reg.insert(a.clone(), Some(now + Duration::from_millis(20)), false, now)
            .unwrap();
        let later = now + Duration::from_millis(25);
        reg.expire(later, |_| Ok(()));
        reg.rearm_for_next(later).unwrap();
        assert_eq!(timer.lock().armed, None);

        // the cancel of `a` is still pending, `b` must own the timer
        let deadline = later + Duration::from_millis(50);
        reg.insert(b, Some(deadline), false, later).unwrap();
        assert_eq!(timer.lock().armed, Some(deadline));
        assert_eq!(reg.next_deadline(), Some(deadline));

        // completing `a` leaves the timer alone
        let arms = timer.lock().arms;
        assert_eq!(reg.remove(&a, later), Ok(true));
        assert_eq!(timer.lock().arms, arms);
        assert_eq!(timer.lock().armed, Some(deadline));
    }

    #[test]
    fn insert_behind_an_os_timed_entry_arms() {
        let (mut reg, timer) = registry();
        let now = Instant::now();
        reg.insert(Transfer::new(0), Some(now + Duration::from_millis(5)), true, now)
            .unwrap();
        let deadline = now + Duration::from_millis(10);
        reg.insert(Transfer::new(0), Some(deadline), false, now).unwrap();
        assert_eq!(timer.lock().armed, Some(deadline));
    }

    #[test]
    fn removing_the_armed_entry_behind_a_handled_one_rearms() {
        let (mut reg, timer) = registry();
        let now = Instant::now();
        let (a, b, c) = (Transfer::new(0), Transfer::new(0), Transfer::new(0));
        reg.insert(a, Some(now + Duration::from_millis(1)), false, now)
            .unwrap();
        reg.expire(now + Duration::from_millis(2), |_| Ok(()));
        reg.insert(b.clone(), Some(now + Duration::from_millis(10)), false, now)
            .unwrap();
        reg.insert(c, Some(now + Duration::from_millis(20)), false, now)
            .unwrap();
        assert_eq!(timer.lock().armed, Some(now + Duration::from_millis(10)));
        assert_eq!(reg.remove(&b, now), Ok(true));
        assert_eq!(timer.lock().armed, Some(now + Duration::from_millis(20)));
    }
}
