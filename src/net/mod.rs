//! Socket abstractions built on the Millrace event loop.
//!
//! Two types live here: [`Socket`], a connected non-blocking stream, and
//! [`ServerSocket`], a listener that drains its backlog on every
//! readiness event. Both borrow the loop (a clonable handle), never the
//! other way around; the loop tracks them only as notifier slots.
//!
//! # Operation flow
//!
//! ```text
//! 1. Stream operations:
//!    read_some ──▶ register read interest ──▶ attempt non-blocking read
//!        - data ──▶ handler(Ok(n), buf) inline, before read_some returns
//!        - would-block ──▶ park; handler fires later from dispatch
//!        - hard error ──▶ handler(Err(e), buf) inline
//!
//!    write_some ──▶ attempt non-blocking send
//!        - any progress ──▶ handler(Ok(n), buf) inline (partial writes
//!          are not retried; the caller resubmits the tail)
//!        - would-block ──▶ register write interest; later the handler
//!          fires with Ok(0): "writable again, resubmit"
//!
//! 2. Listener events:
//!    readiness ──▶ loop { accept }
//!        - connection ──▶ new Socket on the same loop ──▶ handler(Ok(socket))
//!        - would-block ──▶ stop until the next readiness event
//!        - hard error ──▶ handler(Err(e)) once; accepting stops until
//!          accept() is called again
//! ```
//!
//! # Teardown
//!
//! `close` unregisters the notifier, closes the handle and then invokes
//! the close hook. It never fails observably and is safe to call from
//! inside any handler this library dispatches: the drain and dispatch
//! loops look state up by token and no-op once the slot is gone.

pub mod server;
pub mod socket;

pub use server::ServerSocket;
pub use socket::Socket;
