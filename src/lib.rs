//! # Millrace
//! A minimal event-driven I/O core for building network servers without
//! relying on heavyweight async runtimes like Tokio.
//! Millrace is a reactor built on top of [`mio`], multiplexing handle
//! readiness onto registered callbacks, plus a connected-socket and a
//! listening-socket abstraction layered on that reactor.
//! ## Core Philosophy
//! Millrace was designed for applications that require:
//! - **Predictable performance** with minimal runtime overhead
//! - **Runtime-agnostic architecture** that doesn't force async/await patterns
//! - **Direct control** over readiness handling and socket teardown
//! - **Minimal dependencies** for reduced attack surface and faster builds
//! ## Features
//! - **Single-threaded by design**: one dispatch thread, no locks, no
//!   data races; reentrancy is a control-flow concern, not a
//!   synchronization concern
//! - **Cross-platform**: leverages mio's polling abstraction (epoll, kqueue)
//! - **Would-block absorption**: transient retry signals never reach
//!   library callers
//! - **Edge-trigger-correct accept draining**: one readiness event drains
//!   the whole backlog
//! - **Reentrant teardown**: a socket may be closed from inside any
//!   handler this library dispatches, including its own
//! ## Architecture Overview
//! ```text
//! ┌─────────────┐    ┌──────────────┐    ┌─────────────┐
//! │ EventLoop   │───▶│   Reactor    │───▶│ PollHandle  │
//! └─────────────┘    └──────────────┘    └─────────────┘
//!        ▲                                      │
//!        │ register / remove                    ▼
//! ┌──────┴───────────────┐             ┌──────────────┐
//! │ Socket, ServerSocket │◀────────────│  Callbacks   │
//! └──────────────────────┘   dispatch  └──────────────┘
//! ```
//! ## Quick Start
//!
//! ```rust,no_run
//! use millrace::net::ServerSocket;
//! use millrace::EventLoop;
//!
//! fn main() -> millrace::error::Result<()> {
//!     let event_loop = EventLoop::default();
//!
//!     let server = ServerSocket::new(&event_loop, None);
//!     server.init(5)?;
//!     server.set_reuse_address(true)?;
//!     server.bind(None, 8080)?;
//!     server.accept(|_server, result| match result {
//!         Ok(socket) => {
//!             socket.read_some(vec![0; 8192], |socket, result, buf| {
//!                 match result {
//!                     Ok(0) => socket.close(),
//!                     Ok(n) => println!("read {} bytes: {:?}", n, &buf[..n]),
//!                     Err(e) => eprintln!("read failed: {}", e),
//!                 }
//!             });
//!         }
//!         Err(e) => eprintln!("accept failed: {}", e),
//!     })?;
//!
//!     println!("listening on 0.0.0.0:8080");
//!     event_loop.run()
//! }
//! ```
//!
//! - [`EventLoop`]: entry point for registering notifiers and running the loop
//! - [`EventNotifier`]: registration record binding a handle to its callbacks
//! - [`net::Socket`] / [`net::ServerSocket`]: the stream and listener built on top
//! - [`reactor`]: core reactor implementation managing the loop lifecycle
//! - [`poll`]: polling abstraction and notifier slot table
//! - [`error`]: error types and result handling

use std::rc::Rc;
use std::time::Duration;

use mio::event::Source;
pub use mio::Token;

pub mod error;
pub mod event;
pub mod net;
pub mod notifier;
pub mod poll;
pub mod reactor;

pub use notifier::EventNotifier;
pub use reactor::ShutdownHandle;

use crate::{
    error::Result,
    reactor::{Reactor, DEFAULT_EVENTS_CAPACITY, DEFAULT_POLL_TIMEOUT_MS},
};

/// A convenient prelude module that re-exports commonly used types.
///
/// ```rust
/// use millrace::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::net::{ServerSocket, Socket};
    pub use crate::notifier::EventNotifier;
    pub use crate::reactor::ShutdownHandle;
    pub use crate::{EventLoop, Token};
}

/// The reactor's public face: registers notifiers and dispatches readiness.
///
/// An `EventLoop` is a cheap clonable handle; every socket and listener
/// holds one. The loop never owns the objects it notifies; it tracks
/// them as slot entries that their owners add and remove.
///
/// Dispatch is strictly single-threaded: handlers run inline on the
/// thread calling [`run`](Self::run), in the order the backend reports
/// readiness. The only thread-safe surface is the
/// [`ShutdownHandle`](Self::shutdown_handle).
#[derive(Clone)]
pub struct EventLoop {
    reactor: Rc<Reactor>,
}

impl Default for EventLoop {
    /// Creates a new `EventLoop` with default configuration
    /// ([`DEFAULT_EVENTS_CAPACITY`] events per poll,
    /// [`DEFAULT_POLL_TIMEOUT_MS`] poll timeout).
    ///
    /// # Panics
    ///
    /// Panics if the polling backend cannot be initialized.
    fn default() -> Self {
        Self::new(DEFAULT_EVENTS_CAPACITY, DEFAULT_POLL_TIMEOUT_MS).unwrap()
    }
}

impl EventLoop {
    /// Creates a new `EventLoop` with custom configuration.
    ///
    /// ## Arguments
    /// * `events_capacity` - Maximum number of events to poll per iteration
    /// * `poll_timeout_ms` - Poll timeout in milliseconds, bounding how long
    ///   `run` stays blocked between shutdown checks
    pub fn new(events_capacity: usize, poll_timeout_ms: u64) -> Result<Self> {
        let reactor = Reactor::new(events_capacity, poll_timeout_ms)?;
        Ok(Self {
            reactor: Rc::new(reactor),
        })
    }

    /// Allocates a slot for `notifier` and returns its token.
    ///
    /// The notifier has no active interest yet; nothing is dispatched
    /// until [`register_read`](Self::register_read) or
    /// [`register_write`](Self::register_write) is called for it.
    pub fn add(&self, notifier: EventNotifier) -> Token {
        self.reactor.poll_handle.add(notifier)
    }

    /// Expresses read interest for `token`'s notifier. Idempotent if read
    /// interest is already registered; write interest, if any, is kept.
    pub fn register_read<S>(&self, source: &mut S, token: Token) -> Result<()>
    where
        S: Source + ?Sized,
    {
        self.reactor.poll_handle.register_read(source, token)
    }

    /// Expresses write interest for `token`'s notifier. Idempotent if write
    /// interest is already registered; read interest, if any, is kept.
    pub fn register_write<S>(&self, source: &mut S, token: Token) -> Result<()>
    where
        S: Source + ?Sized,
    {
        self.reactor.poll_handle.register_write(source, token)
    }

    /// Deregisters `source` and frees the notifier's slot.
    ///
    /// Must be called exactly once before the owning handle is closed.
    /// Safe to call from inside a dispatched callback and on a token
    /// whose registration failed.
    pub fn remove<S>(&self, source: &mut S, token: Token)
    where
        S: Source + ?Sized,
    {
        self.reactor.poll_handle.remove(source, token)
    }

    /// Frees the slot of a notifier that never gained interest.
    pub fn discard(&self, token: Token) {
        self.reactor.poll_handle.discard(token)
    }

    /// Runs the event loop, blocking the current thread and dispatching
    /// callbacks until [`stop`](Self::stop) or a
    /// [`ShutdownHandle`](Self::shutdown_handle) ends it.
    pub fn run(&self) -> Result<()> {
        self.reactor.run()
    }

    /// Performs a single poll-and-dispatch cycle, waiting at most
    /// `timeout` (forever if `None`). Returns the number of backend
    /// events observed.
    pub fn turn(&self, timeout: Option<Duration>) -> Result<usize> {
        self.reactor.turn(timeout)
    }

    /// Returns a clonable, thread-safe handle that stops the loop.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.reactor.shutdown_handle()
    }

    /// Signals the event loop to stop gracefully after the cycle in flight.
    pub fn stop(&self) {
        self.shutdown_handle().shutdown();
    }
}
