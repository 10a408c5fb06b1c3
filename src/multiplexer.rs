//! The readiness multiplexer: one OS readiness queue plus the registry of every client it
//! watches.
//!
//! The registry owns each connection. One registry-wide lock serializes structural changes (adding
//! and removing clients, and the lookups `wait` does), while every client entry carries its own
//! lock that only serializes request processing on that one connection.

use libc;

use mio::{Events, Poll, PollOpt, Ready, Token};
use mio::unix::{EventedFd, UnixReady};

use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use error::{Error, Result};
use socket::{Endpoint, SocketHandle, NO_SOCKET};

/// Longest a single `wait` blocks before returning an empty batch.
pub const WAIT_TIMEOUT: Duration = Duration::from_millis(1000);

/// A registered connection. The connection itself lives behind the entry's own lock.
#[derive(Debug)]
pub struct ClientEntry<C> {
    fd: RawFd,
    conn: Mutex<C>,
    /// Set when readiness arrived while another worker held the lock.
    pending: AtomicBool,
    /// The peer has hung up; once its last input is processed the entry is torn down.
    hung_up: AtomicBool,
}

impl<C: Endpoint> ClientEntry<C> {
    /// Wrap a connection, ready to be registered under its current descriptor.
    pub fn new(conn: C) -> Self {
        ClientEntry {
            fd: conn.fd(),
            conn: Mutex::new(conn),
            pending: AtomicBool::new(false),
            hung_up: AtomicBool::new(false),
        }
    }
}

impl<C> ClientEntry<C> {
    /// Descriptor this entry is registered under.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Take the connection lock if nobody else holds it.
    pub fn try_lock(&self) -> Option<MutexGuard<C>> {
        match self.conn.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Wait for the connection lock.
    pub fn lock(&self) -> MutexGuard<C> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn mark_pending(&self) {
        self.pending.store(true, Ordering::SeqCst);
    }

    /// Clear the pending flag, returning whether it was set.
    pub fn take_pending(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }

    pub fn is_hung_up(&self) -> bool {
        self.hung_up.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Close,
    CanRead,
    NeedAccept,
    Err,
}

/// One ready descriptor, as reported by a single `wait`.
#[derive(Debug)]
pub struct Event<C> {
    kind: EventKind,
    client: Option<Arc<ClientEntry<C>>>,
    hangup: bool,
}

impl<C> Event<C> {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// The client the event is about. `None` for events on the listening socket.
    pub fn client(&self) -> Option<&Arc<ClientEntry<C>>> {
        self.client.as_ref()
    }

    pub fn into_client(self) -> Option<Arc<ClientEntry<C>>> {
        self.client
    }

    /// The peer hung up after sending the input this event reports.
    pub fn is_hangup(&self) -> bool {
        self.hangup
    }
}

struct Registry<C> {
    listener: Option<SocketHandle>,
    clients: HashMap<RawFd, Arc<ClientEntry<C>>>,
}

/// Internal state of the readiness multiplexer.
pub struct Multiplexer<C> {
    poll: Poll,
    events: Mutex<Events>,
    registry: Mutex<Registry<C>>,
}

impl<C: Endpoint> Multiplexer<C> {
    /// Create a new multiplexer, able to report up to `capacity` ready descriptors per wait.
    pub fn new(capacity: usize) -> Result<Self> {
        let poll = Poll::new()?;
        Ok(Multiplexer {
            poll,
            events: Mutex::new(Events::with_capacity(capacity.max(1))),
            registry: Mutex::new(Registry {
                listener: None,
                clients: HashMap::new(),
            }),
        })
    }

    fn registry(&self) -> MutexGuard<Registry<C>> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Watch a listening socket. Level-triggered, so a backlog left over from one wait is
    /// reported again by the next. Replaces any listener registered before.
    pub fn add_server_socket(&self, server: SocketHandle) -> Result<()> {
        let fd = server.fd();
        if fd == NO_SOCKET {
            return Err(io::Error::from(ErrorKind::NotConnected).into());
        }

        let mut registry = self.registry();
        if let Some(mut old) = registry.listener.take() {
            self.deregister(old.fd());
            old.disconnect();
        }

        throw!(self.poll.register(&server, token(fd), Ready::readable(), PollOpt::level()));
        debug!("Listening socket registered on descriptor {}", fd);
        registry.listener = Some(server);
        Ok(())
    }

    /// Register an accepted connection, edge-triggered, and take ownership of it.
    pub fn add_client(&self, conn: C) -> Result<Arc<ClientEntry<C>>> {
        let entry = Arc::new(ClientEntry::new(conn));
        self.insert(entry.clone())?;
        Ok(entry)
    }

    /// Register an entry built by the caller, who may already hold its lock.
    pub fn insert(&self, entry: Arc<ClientEntry<C>>) -> Result<()> {
        let fd = entry.fd;
        if fd == NO_SOCKET {
            return Err(io::Error::from(ErrorKind::NotConnected).into());
        }

        let mut registry = self.registry();
        // A live descriptor can't be handed out twice, and entries keep theirs open.
        debug_assert!(!registry.clients.contains_key(&fd));

        let interest = Ready::readable() | Ready::from(UnixReady::hup());
        throw!(self.poll.register(&EventedFd(&fd), token(fd), interest, PollOpt::edge()));

        registry.clients.insert(fd, entry);
        trace!("Client registered on descriptor {}", fd);
        Ok(())
    }

    /// Block for up to `WAIT_TIMEOUT` and classify everything that became ready.
    pub fn wait(&self) -> Result<Vec<Event<C>>> {
        let mut events = self.events.lock()?;

        if self.registry().listener.is_none() {
            return Ok(Vec::new());
        }

        match self.poll.poll(&mut events, Some(WAIT_TIMEOUT)) {
            Ok(_) => (),
            Err(ref e) if e.kind() == ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }

        let registry = self.registry();
        let listener = registry.listener.as_ref().map(|l| l.fd()).unwrap_or(NO_SOCKET);
        let mut output = Vec::with_capacity(events.len());

        for event in events.iter() {
            let fd = event.token().0 as RawFd;
            let readiness = event.readiness();
            let hangup = UnixReady::from(readiness).is_hup();

            if fd == listener {
                let kind = if readiness.is_readable() {
                    EventKind::NeedAccept
                } else {
                    EventKind::Err
                };
                output.push(Event {
                    kind,
                    client: None,
                    hangup: false,
                });
                continue;
            }

            let entry = match registry.clients.get(&fd) {
                Some(entry) => entry.clone(),
                None => {
                    self.drop_stale(fd)?;
                    continue;
                }
            };

            if hangup {
                entry.hung_up.store(true, Ordering::SeqCst);
            }
            let kind = if readiness.is_readable() {
                EventKind::CanRead
            } else if hangup {
                EventKind::Close
            } else {
                EventKind::Err
            };
            output.push(Event {
                kind,
                client: Some(entry),
                hangup,
            });
        }

        Ok(output)
    }

    /// Readiness for a descriptor the registry doesn't know. Either it was removed while the
    /// batch was in flight, which is harmless, or the queue and registry disagree.
    fn drop_stale(&self, fd: RawFd) -> Result<()> {
        match self.poll.deregister(&EventedFd(&fd)) {
            Ok(()) => {
                warn!("Deregistered unknown descriptor {}", fd);
                Ok(())
            }
            Err(ref e) if is_unregistered(e) => {
                trace!("Dropping stale readiness for descriptor {}", fd);
                Ok(())
            }
            Err(e) => {
                error!("Could not deregister unknown descriptor {}: {}", fd, e);
                Err(Error::Desync(fd))
            }
        }
    }

    /// Remove a client from the registry and the readiness queue in one step. Returns false if
    /// the entry had already been removed.
    pub fn delete_client(&self, entry: &Arc<ClientEntry<C>>) -> bool {
        let mut registry = self.registry();
        let registered = registry
            .clients
            .get(&entry.fd)
            .map(|current| Arc::ptr_eq(current, entry))
            .unwrap_or(false);
        if !registered {
            return false;
        }

        registry.clients.remove(&entry.fd);
        self.deregister(entry.fd);
        true
    }

    /// Remove whichever client is registered under `fd`.
    pub fn remove(&self, fd: RawFd) -> Option<Arc<ClientEntry<C>>> {
        let mut registry = self.registry();
        let entry = registry.clients.remove(&fd);
        if entry.is_some() {
            self.deregister(fd);
        }
        entry
    }

    /// Accept one pending connection from the registered listener.
    pub fn accept(&self) -> SocketHandle {
        let registry = self.registry();
        let mut socket = SocketHandle::new();
        if let Some(ref listener) = registry.listener {
            socket.accept(listener);
        }
        socket
    }

    /// Every registered client, at this instant.
    pub fn clients(&self) -> Vec<Arc<ClientEntry<C>>> {
        self.registry().clients.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.registry().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn listener_port(&self) -> Option<u16> {
        self.registry().listener.as_ref().map(|l| l.port())
    }

    /// Release the listening socket and every client. The clients are handed back, already
    /// deregistered, so the caller can finish tearing them down.
    pub fn stop(&self) -> Vec<Arc<ClientEntry<C>>> {
        let mut registry = self.registry();
        if let Some(mut listener) = registry.listener.take() {
            self.deregister(listener.fd());
            listener.disconnect();
        }
        self.drain(&mut registry)
    }

    /// Deregister and hand back every client, keeping the listener.
    pub fn delete_all(&self) -> Vec<Arc<ClientEntry<C>>> {
        let mut registry = self.registry();
        self.drain(&mut registry)
    }

    fn drain(&self, registry: &mut Registry<C>) -> Vec<Arc<ClientEntry<C>>> {
        let clients: Vec<_> = registry.clients.drain().map(|(_, entry)| entry).collect();
        for entry in &clients {
            self.deregister(entry.fd);
        }
        clients
    }

    fn deregister(&self, fd: RawFd) {
        if let Err(e) = self.poll.deregister(&EventedFd(&fd)) {
            debug!("Deregistering descriptor {} failed: {}", fd, e);
        }
    }
}

fn token(fd: RawFd) -> Token {
    Token(fd as usize)
}

fn is_unregistered(err: &io::Error) -> bool {
    match err.raw_os_error() {
        Some(code) => code == libc::ENOENT || code == libc::EBADF,
        None => false,
    }
}
