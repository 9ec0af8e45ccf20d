use std::cell::{Cell, RefCell};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;

use log::warn;
use mio::net::TcpListener;
use mio::Token;
use socket2::{Domain, Protocol, Socket as RawSocket, Type};

use crate::error::{Error, Result};
use crate::net::socket::{CloseHook, Socket};
use crate::notifier::EventNotifier;
use crate::EventLoop;

type AcceptHandler = Box<dyn FnMut(&ServerSocket, Result<Socket>)>;

enum Lifecycle {
    Created,
    /// Handle exists; listening starts on the first `accept` call.
    Open(RawSocket),
    Listening(TcpListener),
    Closed,
}

/// A listening socket.
///
/// Lifecycle: `new` → [`init`](Self::init) → [`bind`](Self::bind) →
/// [`accept`](Self::accept) → [`close`](Self::close). The first
/// `accept` call issues `listen` with the backlog given to `init` and
/// arms read interest; from then on every readiness event drains the
/// whole pending backlog, invoking the accept handler once per
/// connection. Accepted connections are handed to the handler as owned
/// [`Socket`] values on the same loop.
///
/// A hard accept failure is reported to the handler exactly once, after
/// which the listener stops accepting until `accept` is called again.
pub struct ServerSocket {
    inner: Rc<Inner>,
}

impl Clone for ServerSocket {
    fn clone(&self) -> Self {
        ServerSocket {
            inner: self.inner.clone(),
        }
    }
}

struct Inner {
    event_loop: EventLoop,
    lifecycle: RefCell<Lifecycle>,
    token: Cell<Token>,
    backlog: Cell<u32>,
    bound: Cell<bool>,
    handler: RefCell<Option<AcceptHandler>>,
    close_hook: RefCell<Option<CloseHook>>,
    closed: Cell<bool>,
}

impl ServerSocket {
    pub fn new(event_loop: &EventLoop, close_hook: Option<CloseHook>) -> ServerSocket {
        ServerSocket {
            inner: Rc::new(Inner {
                event_loop: event_loop.clone(),
                lifecycle: RefCell::new(Lifecycle::Created),
                token: Cell::new(Token(usize::MAX)),
                backlog: Cell::new(0),
                bound: Cell::new(false),
                handler: RefCell::new(None),
                close_hook: RefCell::new(close_hook),
                closed: Cell::new(false),
            }),
        }
    }

    /// Creates the non-blocking listening handle and adds it to the loop
    /// with no interest active yet.
    ///
    /// On failure the object stays in its created state; `close` still
    /// works and fires the close hook.
    pub fn init(&self, backlog: u32) -> Result<()> {
        if self.inner.closed.get() {
            return Err(Error::InvalidArgument);
        }
        if !matches!(&*self.inner.lifecycle.borrow(), Lifecycle::Created) {
            return Err(Error::InvalidArgument);
        }

        let sock =
            RawSocket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(Error::Init)?;
        sock.set_nonblocking(true).map_err(Error::Init)?;

        let mut notifier = EventNotifier::new();
        let weak = Rc::downgrade(&self.inner);
        notifier.set_read_callback(move || {
            if let Some(inner) = weak.upgrade() {
                Inner::on_acceptable(&inner);
            }
        });
        self.inner.token.set(self.inner.event_loop.add(notifier));
        self.inner.backlog.set(backlog);
        self.inner.lifecycle.replace(Lifecycle::Open(sock));
        Ok(())
    }

    /// Binds to `address:port`, or to all interfaces when no address is
    /// given.
    pub fn bind(&self, address: Option<IpAddr>, port: u16) -> Result<()> {
        let lifecycle = self.inner.lifecycle.borrow();
        let Lifecycle::Open(sock) = &*lifecycle else {
            return Err(Error::InvalidArgument);
        };
        let ip = address.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let addr = SocketAddr::new(ip, port);
        sock.bind(&addr.into()).map_err(Error::Bind)?;
        self.inner.bound.set(true);
        Ok(())
    }

    pub fn set_reuse_address(&self, on: bool) -> Result<()> {
        let lifecycle = self.inner.lifecycle.borrow();
        let Lifecycle::Open(sock) = &*lifecycle else {
            return Err(Error::InvalidArgument);
        };
        sock.set_reuse_address(on).map_err(Error::Option)
    }

    /// Starts accepting: the first call issues `listen`, arms read
    /// interest and stores `handler`; the call returns immediately and
    /// the handler fires from dispatch, once per accepted connection.
    ///
    /// Calling before `init`/`bind`, or while a handler is already
    /// armed, is an API sequencing error.
    pub fn accept<F>(&self, handler: F) -> Result<()>
    where
        F: FnMut(&ServerSocket, Result<Socket>) + 'static,
    {
        let inner = &self.inner;
        if inner.closed.get() || inner.handler.borrow().is_some() {
            return Err(Error::InvalidArgument);
        }

        {
            let mut lifecycle = inner.lifecycle.borrow_mut();
            if matches!(&*lifecycle, Lifecycle::Open(_)) {
                if !inner.bound.get() {
                    return Err(Error::InvalidArgument);
                }
                let Lifecycle::Open(sock) =
                    std::mem::replace(&mut *lifecycle, Lifecycle::Created)
                else {
                    unreachable!()
                };
                if let Err(e) = sock.listen(inner.backlog.get() as i32) {
                    *lifecycle = Lifecycle::Open(sock);
                    return Err(Error::Listen(e));
                }
                *lifecycle = Lifecycle::Listening(TcpListener::from_std(sock.into()));
            }

            let Lifecycle::Listening(listener) = &mut *lifecycle else {
                return Err(Error::InvalidArgument);
            };
            inner
                .event_loop
                .register_read(listener, inner.token.get())?;
        }

        inner.handler.replace(Some(Box::new(handler)));
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &*self.inner.lifecycle.borrow() {
            Lifecycle::Open(sock) => {
                let addr = sock.local_addr().map_err(Error::Io)?;
                addr.as_socket().ok_or(Error::InvalidArgument)
            }
            Lifecycle::Listening(listener) => listener.local_addr().map_err(Error::Io),
            _ => Err(Error::InvalidArgument),
        }
    }

    /// Closes the listener: unregisters the notifier, drops the armed
    /// handler, closes the handle and invokes the close hook.
    ///
    /// Never fails observably; a second call is a no-op. Safe to call
    /// from inside the accept handler; the drain loop stops without
    /// touching the socket again.
    pub fn close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }

        self.inner.handler.take();

        let lifecycle = self.inner.lifecycle.replace(Lifecycle::Closed);
        match lifecycle {
            Lifecycle::Listening(mut listener) => {
                self.inner
                    .event_loop
                    .remove(&mut listener, self.inner.token.get());
            }
            other => {
                self.inner.event_loop.discard(self.inner.token.get());
                drop(other);
            }
        }

        if let Some(hook) = self.inner.close_hook.take() {
            hook();
        }
    }
}

impl Drop for Inner {
    /// Last-handle cleanup for listeners discarded without `close`:
    /// unregisters and closes, but never fires the close hook.
    fn drop(&mut self) {
        if self.closed.get() {
            return;
        }
        let lifecycle = self.lifecycle.replace(Lifecycle::Closed);
        if let Lifecycle::Listening(mut listener) = lifecycle {
            self.event_loop.remove(&mut listener, self.token.get());
        } else {
            self.event_loop.discard(self.token.get());
        }
    }
}

impl Inner {
    /// Drains the backlog for one readiness event: accept until the
    /// backend reports would-block, constructing a `Socket` per
    /// connection. Stops immediately when the handler closes this
    /// listener or when a hard error has been reported.
    fn on_acceptable(inner: &Rc<Inner>) {
        let server = ServerSocket {
            inner: inner.clone(),
        };
        loop {
            if inner.closed.get() {
                return;
            }
            let accepted = {
                let lifecycle = inner.lifecycle.borrow();
                let Lifecycle::Listening(listener) = &*lifecycle else {
                    return;
                };
                listener.accept()
            };
            match accepted {
                Ok((stream, _peer)) => {
                    let socket = Socket::attach(&inner.event_loop, stream, None);
                    let handler = inner.handler.borrow_mut().take();
                    let Some(mut handler) = handler else {
                        return;
                    };
                    handler(&server, Ok(socket));
                    if inner.closed.get() {
                        return;
                    }
                    // the handler may have re-armed; the newer handler wins
                    let mut slot = inner.handler.borrow_mut();
                    if slot.is_none() {
                        *slot = Some(handler);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    // one terminal report; accepting stays off until the
                    // caller re-arms with accept()
                    let handler = inner.handler.borrow_mut().take();
                    if let Some(mut handler) = handler {
                        handler(&server, Err(Error::Accept(e)));
                    }
                    return;
                }
            }
        }
    }
}
