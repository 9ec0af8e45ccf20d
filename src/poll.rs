use std::cell::RefCell;
use std::sync::Arc;
use std::time::Duration;

use mio::{event::Source, Events, Interest, Poll, Token, Waker};
use slab::Slab;

use crate::error::{Error, Result};
use crate::notifier::{Callback, EventNotifier};

/// Token reserved for the loop's own waker; never handed out as a slot key.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

struct Slot {
    notifier: EventNotifier,
    /// Interest currently registered with the backend; `None` between
    /// `add` and the first `register_read`/`register_write`.
    interest: Option<Interest>,
}

pub struct PollHandle {
    poller: RefCell<Poll>,
    slots: RefCell<Slab<Slot>>,
    waker: Arc<Waker>,
}

impl PollHandle {
    pub fn new() -> Result<Self> {
        let poller = Poll::new().map_err(Error::Backend)?;
        let waker = Waker::new(poller.registry(), WAKER_TOKEN).map_err(Error::Backend)?;
        Ok(PollHandle {
            poller: RefCell::new(poller),
            slots: RefCell::new(Slab::new()),
            waker: Arc::new(waker),
        })
    }

    /// Allocates a slot for `notifier`. No interest is active yet; the
    /// backend sees nothing until `register_read`/`register_write`.
    pub fn add(&self, notifier: EventNotifier) -> Token {
        let key = self.slots.borrow_mut().insert(Slot {
            notifier,
            interest: None,
        });
        Token(key)
    }

    pub fn register_read<S>(&self, source: &mut S, token: Token) -> Result<()>
    where
        S: Source + ?Sized,
    {
        self.register(source, token, Interest::READABLE)
    }

    pub fn register_write<S>(&self, source: &mut S, token: Token) -> Result<()>
    where
        S: Source + ?Sized,
    {
        self.register(source, token, Interest::WRITABLE)
    }

    fn register<S>(&self, source: &mut S, token: Token, direction: Interest) -> Result<()>
    where
        S: Source + ?Sized,
    {
        let mut slots = self.slots.borrow_mut();
        let slot = slots.get_mut(token.0).ok_or(Error::InvalidArgument)?;
        let wanted = match slot.interest {
            Some(current) => current | direction,
            None => direction,
        };
        match slot.interest {
            Some(current) if current == wanted => Ok(()),
            Some(_) => {
                self.poller
                    .borrow()
                    .registry()
                    .reregister(source, token, wanted)
                    .map_err(Error::Backend)?;
                slot.interest = Some(wanted);
                Ok(())
            }
            None => {
                self.poller
                    .borrow()
                    .registry()
                    .register(source, token, wanted)
                    .map_err(Error::Backend)?;
                slot.interest = Some(wanted);
                Ok(())
            }
        }
    }

    /// Frees the slot and deregisters `source` if any interest was active.
    ///
    /// Safe to call from inside a callback the loop is dispatching and on
    /// a token whose registration failed or never happened.
    pub fn remove<S>(&self, source: &mut S, token: Token)
    where
        S: Source + ?Sized,
    {
        if token == WAKER_TOKEN {
            return;
        }
        let slot = self.slots.borrow_mut().try_remove(token.0);
        if let Some(slot) = slot {
            if slot.interest.is_some() {
                let _ = self.poller.borrow().registry().deregister(source);
            }
        }
    }

    /// Frees a slot that never gained interest, without touching the backend.
    pub fn discard(&self, token: Token) {
        if token == WAKER_TOKEN {
            return;
        }
        self.slots.borrow_mut().try_remove(token.0);
    }

    /// Read callback for `token`, provided read interest is currently
    /// registered. Clones the callback out so no slot borrow is held
    /// while it runs.
    pub(crate) fn read_callback(&self, token: Token) -> Option<Callback> {
        let slots = self.slots.borrow();
        let slot = slots.get(token.0)?;
        if slot.interest?.is_readable() {
            slot.notifier.read_callback.clone()
        } else {
            None
        }
    }

    pub(crate) fn write_callback(&self, token: Token) -> Option<Callback> {
        let slots = self.slots.borrow();
        let slot = slots.get(token.0)?;
        if slot.interest?.is_writable() {
            slot.notifier.write_callback.clone()
        } else {
            None
        }
    }

    pub fn poll(&self, events: &mut Events, timeout: Option<Duration>) -> Result<usize> {
        self.poller
            .borrow_mut()
            .poll(events, timeout)
            .map_err(Error::Backend)?;
        Ok(events.iter().count())
    }

    pub fn wake(&self) -> Result<()> {
        self.waker.wake().map_err(Error::Backend)
    }

    pub(crate) fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Interest, Registry, Token};
    use std::time::Duration;

    struct TestSource;

    impl Source for TestSource {
        fn register(
            &mut self,
            _registry: &Registry,
            _token: Token,
            _interests: Interest,
        ) -> std::io::Result<()> {
            Ok(())
        }

        fn reregister(
            &mut self,
            _registry: &Registry,
            _token: Token,
            _interests: Interest,
        ) -> std::io::Result<()> {
            Ok(())
        }

        fn deregister(&mut self, _registry: &Registry) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_poll() {
        let handle = PollHandle::new().unwrap();
        let mut events = Events::with_capacity(1024);
        let count = handle
            .poll(&mut events, Some(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_add_allocates_inactive_slot() {
        let handle = PollHandle::new().unwrap();
        let token = handle.add(EventNotifier::new());
        assert!(handle.read_callback(token).is_none());
        assert!(handle.write_callback(token).is_none());
    }

    #[test]
    fn test_register_unknown_token() {
        let handle = PollHandle::new().unwrap();
        let mut source = TestSource;
        let err = handle.register_read(&mut source, Token(7)).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument));
    }

    #[test]
    fn test_callback_gated_on_interest() {
        let handle = PollHandle::new().unwrap();
        let mut notifier = EventNotifier::new();
        notifier.set_read_callback(|| {});
        notifier.set_write_callback(|| {});
        let token = handle.add(notifier);

        // no interest yet, neither direction may fire
        assert!(handle.read_callback(token).is_none());
        assert!(handle.write_callback(token).is_none());

        let mut source = TestSource;
        handle.register_read(&mut source, token).unwrap();
        assert!(handle.read_callback(token).is_some());
        assert!(handle.write_callback(token).is_none());

        handle.register_write(&mut source, token).unwrap();
        assert!(handle.read_callback(token).is_some());
        assert!(handle.write_callback(token).is_some());
    }

    #[test]
    fn test_register_is_idempotent() {
        let handle = PollHandle::new().unwrap();
        let token = handle.add(EventNotifier::new());
        let mut source = TestSource;
        handle.register_read(&mut source, token).unwrap();
        handle.register_read(&mut source, token).unwrap();
        assert!(handle.write_callback(token).is_none());
    }

    #[test]
    fn test_remove_unknown_token_is_noop() {
        let handle = PollHandle::new().unwrap();
        let mut source = TestSource;
        handle.remove(&mut source, Token(3));
        handle.discard(Token(3));
    }

    #[test]
    fn test_remove_frees_slot() {
        let handle = PollHandle::new().unwrap();
        let mut notifier = EventNotifier::new();
        notifier.set_read_callback(|| {});
        let token = handle.add(notifier);
        let mut source = TestSource;
        handle.register_read(&mut source, token).unwrap();

        handle.remove(&mut source, token);
        assert!(handle.read_callback(token).is_none());
        // removing twice must not disturb anything
        handle.remove(&mut source, token);
    }
}
