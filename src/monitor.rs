//! `channel_monitor`: the manager loop's `mio`-based readiness poller.
//!
//! An explicit mutex-guarded manager loop doesn't fit a callback-style
//! `Machine` trait reactor; polling `mio` directly -- the library such a
//! reactor would itself wrap -- is the more direct fit here.

use std::io;
use std::time::Duration;

use mio::{Events, Interest, Poll, Token};

/// Wakes the manager task from the application thread without touching
/// any socket; `disconnect`/`post_window`/`close` all go through this
/// after releasing the management lock.
pub const WAKE_TOKEN: Token = Token(usize::MAX);

pub struct ChannelMonitor {
    poll: Poll,
    events: Events,
    waker: mio::Waker,
}

impl ChannelMonitor {
    pub fn new(capacity: usize) -> io::Result<ChannelMonitor> {
        let poll = Poll::new()?;
        let waker = mio::Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok(ChannelMonitor { poll, events: Events::with_capacity(capacity), waker })
    }

    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    /// Used by the application-thread API calls to pull the manager out
    /// of `run_once` without waiting for a socket event.
    pub fn waker(&self) -> &mio::Waker {
        &self.waker
    }

    /// Blocks until a socket is ready, a wakeup arrives, or `max_wait`
    /// elapses, then returns the ready tokens. `max_select` bounds how
    /// many readiness events are drained in one call.
    pub fn run_once(&mut self, max_select: usize, max_wait: Option<Duration>) -> io::Result<Vec<(Token, bool, bool)>> {
        self.poll.poll(&mut self.events, max_wait)?;
        let mut ready = Vec::with_capacity(max_select.min(self.events.iter().count()));
        for ev in self.events.iter().take(max_select) {
            if ev.token() == WAKE_TOKEN {
                continue;
            }
            ready.push((ev.token(), ev.is_readable(), ev.is_writable()));
        }
        Ok(ready)
    }

    pub fn register(&self, source: &mut impl mio::event::Source, token: Token, interest: Interest) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    pub fn reregister(&self, source: &mut impl mio::event::Source, token: Token, interest: Interest) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    pub fn deregister(&self, source: &mut impl mio::event::Source) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn run_once_times_out_with_no_sources() {
        let mut mon = ChannelMonitor::new(16).unwrap();
        let ready = mon.run_once(16, Some(Duration::from_millis(10))).unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn waker_interrupts_run_once() {
        let mon = ChannelMonitor::new(16).unwrap();
        let waker_handle = mon.waker();
        // mio::Waker is Send+Sync and safe to notify from another thread;
        // here we just check the call succeeds synchronously.
        waker_handle.wake().unwrap();
    }
}
