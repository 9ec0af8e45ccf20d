use std::cell::RefCell;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::trace;
use mio::{event::Event, Events, Waker};

use crate::error::{Error, Result};
use crate::event::Readiness;
use crate::poll::{PollHandle, WAKER_TOKEN};

pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;

pub struct Reactor {
    pub(crate) poll_handle: PollHandle,
    events: RefCell<Events>,
    poll_timeout: Duration,
    running: Arc<AtomicBool>,
}

impl Reactor {
    pub fn new(events_capacity: usize, poll_timeout_ms: u64) -> Result<Self> {
        Ok(Self {
            poll_handle: PollHandle::new()?,
            events: RefCell::new(Events::with_capacity(events_capacity)),
            poll_timeout: Duration::from_millis(poll_timeout_ms),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn run(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);

        while self.running.load(Ordering::SeqCst) {
            self.turn(Some(self.poll_timeout))?;
        }
        Ok(())
    }

    /// One poll-and-dispatch cycle. Returns the number of backend events
    /// observed in this cycle.
    pub fn turn(&self, timeout: Option<Duration>) -> Result<usize> {
        let mut events = self.events.borrow_mut();
        let count = match self.poll_handle.poll(&mut events, timeout) {
            Ok(count) => count,
            Err(Error::Backend(ref e)) if e.kind() == io::ErrorKind::Interrupted => 0,
            Err(e) => return Err(e),
        };

        for event in events.iter() {
            self.dispatch(event);
        }
        Ok(count)
    }

    /// Invokes the callbacks of the notifier an event fired for, in the
    /// order the backend reported readiness.
    ///
    /// Callbacks are cloned out of the slot table before they run, and the
    /// slot is looked up again between the read and write halves: a
    /// callback is free to remove any notifier, including the one being
    /// dispatched.
    fn dispatch(&self, event: &Event) {
        let readiness = Readiness::from(event);
        let token = readiness.token();
        if token == WAKER_TOKEN {
            return;
        }

        if readiness.is_readable() {
            match self.poll_handle.read_callback(token) {
                Some(callback) => callback(),
                None => trace!("readable event for inactive token {:?}", token),
            }
        }

        if readiness.is_writable() {
            match self.poll_handle.write_callback(token) {
                Some(callback) => callback(),
                None => trace!("writable event for inactive token {:?}", token),
            }
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            running: self.running.clone(),
            waker: self.poll_handle.waker(),
        }
    }
}

/// Thread-safe stop signal for a running reactor.
///
/// `shutdown` makes `run` return after the cycle currently in flight;
/// it may be called from a dispatched callback or from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.waker.wake();
    }
}
