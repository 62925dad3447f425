//! Event handling: one thread at a time polls the wake pipe, the timer and
//! the backend descriptors; every other thread waits until it is done.
use crate::backend::{PollSource, ReadyFd};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::hotplug::HotplugMessage;
use crate::transfer::Transfer;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags};
use nix::unistd::{close, pipe2, read, write};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;

/// Work queued for the handling thread, guarded by the innermost lock.
#[derive(Default)]
pub(crate) struct EventData {
    pub(crate) user_interrupt: bool,
    /// Threads currently closing a handle.
    pub(crate) device_close: usize,
    pub(crate) completed: VecDeque<Transfer>,
    pub(crate) hotplug_msgs: VecDeque<HotplugMessage>,
}

impl EventData {
    pub(crate) fn pending(&self) -> bool {
        self.user_interrupt
            || self.device_close > 0
            || !self.completed.is_empty()
            || !self.hotplug_msgs.is_empty()
    }
}

/// Self pipe that is readable while `EventData` has pending work.
pub(crate) struct EventPipe {
    read: RawFd,
    write: RawFd,
}

impl EventPipe {
    pub(crate) fn new() -> Result<Self> {
        let (read, write) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        Ok(EventPipe { read, write })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.read
    }

    pub(crate) fn signal(&self) {
        match write(self.write, &[1u8]) {
            Ok(_) | Err(Errno::EAGAIN) => {}
            Err(e) => log::warn!("event pipe write failed: {}", e),
        }
    }

    pub(crate) fn clear(&self) {
        let mut buf = [0u8; 16];
        loop {
            match read(self.read, &mut buf) {
                Ok(0) | Err(Errno::EAGAIN) => break,
                Ok(_) => continue,
                Err(e) => {
                    log::warn!("event pipe read failed: {}", e);
                    break;
                }
            }
        }
    }
}

impl Drop for EventPipe {
    fn drop(&mut self) {
        let _ = close(self.read);
        let _ = close(self.write);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandlerMode {
    Idle,
    Handling(ThreadId),
}

#[derive(Debug)]
pub(crate) struct HandlerState {
    mode: HandlerMode,
    waiters: usize,
}

impl Default for HandlerState {
    fn default() -> Self {
        HandlerState {
            mode: HandlerMode::Idle,
            waiters: 0,
        }
    }
}

/// The events lock and the waiters condition variable.
#[derive(Default)]
pub(crate) struct EventLock {
    state: Mutex<HandlerState>,
    cond: Condvar,
}

impl EventLock {
    fn try_acquire(&self) -> bool {
        let mut s = self.state.lock();
        if s.mode == HandlerMode::Idle {
            s.mode = HandlerMode::Handling(thread::current().id());
            true
        } else {
            false
        }
    }

    fn acquire(&self) {
        let mut s = self.state.lock();
        while s.mode != HandlerMode::Idle {
            s.waiters += 1;
            self.cond.wait(&mut s);
            s.waiters -= 1;
        }
        s.mode = HandlerMode::Handling(thread::current().id());
    }

    fn release(&self) {
        self.state.lock().mode = HandlerMode::Idle;
        self.notify_waiters();
    }

    pub(crate) fn notify_waiters(&self) {
        let _s = self.state.lock();
        self.cond.notify_all();
    }

    fn handler_active(&self) -> bool {
        self.state.lock().mode != HandlerMode::Idle
    }

    fn is_handler(&self) -> bool {
        self.state.lock().mode == HandlerMode::Handling(thread::current().id())
    }
}

/// Held by the thread that handles events. Dropping it unlocks and wakes
/// every waiter.
#[must_use]
pub struct EventsLock<'a> {
    ctx: &'a Context,
}

impl<'a> EventsLock<'a> {
    /// One poll pass bounded by `timeout`.
    pub fn handle_events_locked(&self, timeout: Duration) -> Result<()> {
        self.ctx.handle_events_pass(timeout)
    }

    pub fn unlock(self) {}
}

impl<'a> Drop for EventsLock<'a> {
    fn drop(&mut self) {
        self.ctx.inner.events.release();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Notified,
    TimedOut,
}

/// The waiters lock. Re-check the condition you wait for while holding it,
/// then call [`EventWaiters::wait_for_event`].
pub struct EventWaiters<'a> {
    ctx: &'a Context,
    guard: MutexGuard<'a, HandlerState>,
}

impl<'a> EventWaiters<'a> {
    pub fn event_handler_active(&self) -> bool {
        self.guard.mode != HandlerMode::Idle || self.ctx.inner.event_data.lock().device_close > 0
    }

    /// Sleeps until the handler finished a completion or released the lock,
    /// or `timeout` passed. `None` waits without bound.
    pub fn wait_for_event(&mut self, timeout: Option<Duration>) -> WaitOutcome {
        let cond = &self.ctx.inner.events.cond;
        self.guard.waiters += 1;
        let outcome = match timeout {
            None => {
                cond.wait(&mut self.guard);
                WaitOutcome::Notified
            }
            Some(t) => {
                if cond.wait_for(&mut self.guard, t).timed_out() {
                    WaitOutcome::TimedOut
                } else {
                    WaitOutcome::Notified
                }
            }
        };
        self.guard.waiters -= 1;
        outcome
    }
}

fn poll_timeout_ms(timeout: Duration) -> i32 {
    let mut ms = timeout.as_millis();
    if Duration::from_millis(ms as u64) < timeout {
        ms += 1;
    }
    ms.min(i32::MAX as u128) as i32
}

impl Context {
    /// Takes the events lock unless another thread holds it or a handle is
    /// being closed.
    pub fn try_lock_events(&self) -> Option<EventsLock<'_>> {
        if self.inner.event_data.lock().device_close > 0 {
            log::debug!("device close pending, not taking the events lock");
            return None;
        }
        if self.inner.events.try_acquire() {
            Some(EventsLock { ctx: self })
        } else {
            None
        }
    }

    pub fn lock_events(&self) -> EventsLock<'_> {
        self.inner.events.acquire();
        EventsLock { ctx: self }
    }

    pub fn unlock_events(&self, lock: EventsLock<'_>) {
        drop(lock);
    }

    pub fn lock_event_waiters(&self) -> EventWaiters<'_> {
        EventWaiters {
            ctx: self,
            guard: self.inner.events.state.lock(),
        }
    }

    /// Whether the calling thread holds the events lock.
    pub fn is_handling_thread(&self) -> bool {
        self.inner.events.is_handler()
    }

    /// False while a handle close waits for the events lock; the handler
    /// should give it up.
    pub fn event_handling_ok(&self) -> bool {
        self.inner.event_data.lock().device_close == 0
    }

    pub fn event_handler_active(&self) -> bool {
        if self.inner.event_data.lock().device_close > 0 {
            return true;
        }
        self.inner.events.handler_active()
    }

    /// Makes the current poll pass return early.
    pub fn interrupt_event_handler(&self) {
        let mut ev = self.inner.event_data.lock();
        let pending = ev.pending();
        ev.user_interrupt = true;
        if !pending {
            self.inner.event_pipe.signal();
        }
    }

    /// Time until the earliest pending transfer deadline, zero if it
    /// already passed. `None` without finite deadlines.
    pub fn next_timeout(&self) -> Option<Duration> {
        let now = self.inner.backend.clock_now();
        let deadline = self.inner.flying.lock().next_deadline()?;
        Some(deadline.saturating_duration_since(now))
    }

    /// Every descriptor an external loop has to watch.
    pub fn pollfds(&self) -> Vec<PollSource> {
        let mut fds = vec![PollSource {
            fd: self.inner.event_pipe.fd(),
            events: PollFlags::POLLIN,
        }];
        if let Some(fd) = self.inner.flying.lock().timer_fd() {
            fds.push(PollSource {
                fd,
                events: PollFlags::POLLIN,
            });
        }
        fds.extend(self.inner.backend.poll_sources());
        fds
    }

    /// Timeouts are driven by a timer descriptor included in `pollfds`.
    pub fn pollfds_handle_timeouts(&self) -> bool {
        true
    }

    /// Cancels every transfer whose deadline passed and rearms the timer.
    pub fn handle_timeouts(&self) -> Result<()> {
        let now = self.inner.backend.clock_now();
        let mut registry = self.inner.flying.lock();
        registry.expire(now, |t| t.cancel());
        if let Err(e) = registry.rearm_for_next(now) {
            log::warn!("failed to rearm timer: {}", e);
        }
        Ok(())
    }

    pub fn handle_events(&self) -> Result<()> {
        self.handle_events_timeout_completed(self.inner.options.handle_events_timeout, None)
    }

    pub fn handle_events_timeout(&self, timeout: Duration) -> Result<()> {
        self.handle_events_timeout_completed(timeout, None)
    }

    pub fn handle_events_completed(&self, completed: Option<&AtomicBool>) -> Result<()> {
        self.handle_events_timeout_completed(self.inner.options.handle_events_timeout, completed)
    }

    /// Handles events if no other thread does, otherwise waits for the
    /// handler to make progress. Returns without polling once `completed`
    /// is set.
    pub fn handle_events_timeout_completed(
        &self,
        timeout: Duration,
        completed: Option<&AtomicBool>,
    ) -> Result<()> {
        let is_done = || completed.map_or(false, |c| c.load(Ordering::SeqCst));
        loop {
            if let Some(lock) = self.try_lock_events() {
                if is_done() {
                    return Ok(());
                }
                return lock.handle_events_locked(timeout);
            }

            let mut waiters = self.lock_event_waiters();
            if is_done() {
                return Ok(());
            }
            if !waiters.event_handler_active() {
                // the handler went away, try to become it
                continue;
            }
            let outcome = waiters.wait_for_event(Some(timeout));
            drop(waiters);
            return match outcome {
                WaitOutcome::TimedOut => self.handle_timeouts(),
                WaitOutcome::Notified => Ok(()),
            };
        }
    }

    pub(crate) fn handle_events_pass(&self, timeout: Duration) -> Result<()> {
        let mut timeout = timeout;
        loop {
            let sources = self.inner.backend.poll_sources();
            let timer_fd = self.inner.flying.lock().timer_fd();

            let mut fds = Vec::with_capacity(sources.len() + 2);
            fds.push(PollFd::new(self.inner.event_pipe.fd(), PollFlags::POLLIN));
            if let Some(fd) = timer_fd {
                fds.push(PollFd::new(fd, PollFlags::POLLIN));
            }
            let backend_start = fds.len();
            for s in &sources {
                fds.push(PollFd::new(s.fd, s.events));
            }

            log::trace!("poll {} fds, timeout {:?}", fds.len(), timeout);
            let n = match poll(&mut fds, poll_timeout_ms(timeout)) {
                Ok(n) => n,
                Err(Errno::EINTR) => return Err(Error::Interrupted),
                Err(e) => {
                    log::error!("poll failed: {}", e);
                    return Err(Error::Io);
                }
            };
            if n == 0 {
                return self.handle_timeouts();
            }

            let ready = |fd: &PollFd| fd.revents().map_or(false, |r| !r.is_empty());
            let mut special = false;

            if ready(&fds[0]) {
                let (message, completed) = {
                    let mut ev = self.inner.event_data.lock();
                    if ev.user_interrupt {
                        log::debug!("event handler interrupted");
                        ev.user_interrupt = false;
                    }
                    let message = ev.hotplug_msgs.pop_front();
                    let completed: Vec<Transfer> = ev.completed.drain(..).collect();
                    if !ev.pending() {
                        self.inner.event_pipe.clear();
                    }
                    (message, completed)
                };
                for transfer in completed {
                    self.finalize_completed(&transfer);
                }
                if let Some(message) = message {
                    self.dispatch_hotplug(message);
                    special = true;
                }
            }

            if timer_fd.is_some() && ready(&fds[1]) {
                self.inner.flying.lock().consume_timer();
                self.handle_timeouts()?;
                special = true;
            }

            let backend_ready: Vec<ReadyFd> = fds[backend_start..]
                .iter()
                .zip(sources.iter())
                .filter_map(|(pfd, s)| match pfd.revents() {
                    Some(r) if !r.is_empty() => Some(ReadyFd {
                        fd: s.fd,
                        revents: r,
                    }),
                    _ => None,
                })
                .collect();
            if !backend_ready.is_empty() {
                if let Err(e) = self.inner.backend.handle_events(self, &backend_ready) {
                    log::error!("backend handle_events failed: {}", e);
                    return Err(e);
                }
            }

            if !special {
                return Ok(());
            }
            timeout = Duration::ZERO;
        }
    }
}
