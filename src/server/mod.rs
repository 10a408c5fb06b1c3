//! The server: a listening socket, the readiness multiplexer watching it and its clients, and the
//! worker pool every readiness event is handed to.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use config::{Config, KeepAliveConfig};
use connection::Connection;
use error::{Error, Result};
use multiplexer::{ClientEntry, Event, EventKind, Multiplexer};
use pool::WorkerPool;
use socket::{Endpoint, Mode, SocketHandle, SocketStatus};

mod acceptor;

/// Called with a client when it connects or disconnects.
pub type Callback<C> = Arc<dyn Fn(&C) + Send + Sync>;

/// Health of the server. An error status sticks until the next `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Up,
    ErrSocketInit,
    ErrSocketBind,
    ErrSocketKeepAlive,
    ErrSocketListening,
    Close,
}

/// Lets another thread end the dispatch loop.
#[derive(Debug, Clone)]
pub struct Stopper {
    running: Arc<AtomicBool>,
}

impl Stopper {
    /// Ask the dispatch loop to exit. It notices within one wait timeout.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Everything the dispatch loop and its tasks share.
struct Shared<C: Connection> {
    multiplexer: Multiplexer<C>,
    pool: WorkerPool,
    running: Arc<AtomicBool>,
    keep_alive: KeepAliveConfig,
    on_connect: Callback<C>,
    on_disconnect: Callback<C>,
}

/// Internal state of the entire server.
pub struct TcpServer<C: Connection> {
    host: Ipv4Addr,
    port: u16,
    events_capacity: usize,
    keep_alive: KeepAliveConfig,
    on_connect: Callback<C>,
    on_disconnect: Callback<C>,
    shared: Arc<Shared<C>>,
    status: ServerStatus,
    dispatch: Option<JoinHandle<Result<()>>>,
}

impl<C: Connection> TcpServer<C> {
    /// Create a new server. Nothing is bound until `start`.
    pub fn new(port: u16, keep_alive: KeepAliveConfig, threads: usize) -> Result<Self> {
        let config = Config {
            port,
            keep_alive,
            threads,
            ..Config::default()
        };
        TcpServer::from_config(&config)
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let on_connect: Callback<C> = Arc::new(|_: &C| ());
        let on_disconnect: Callback<C> = Arc::new(|_: &C| ());
        let shared = Shared::new(
            config.events_capacity,
            config.threads,
            config.keep_alive,
            on_connect.clone(),
            on_disconnect.clone(),
        )?;

        Ok(TcpServer {
            host: config.host,
            port: config.port,
            events_capacity: config.events_capacity,
            keep_alive: config.keep_alive,
            on_connect,
            on_disconnect,
            shared: Arc::new(shared),
            status: ServerStatus::Close,
            dispatch: None,
        })
    }

    /// Fire `callback` once for every accepted connection, after it is registered.
    pub fn on_connect<F>(mut self, callback: F) -> Self
    where
        F: Fn(&C) + Send + Sync + 'static,
    {
        self.on_connect = Arc::new(callback);
        self
    }

    /// Fire `callback` once for every connection torn down.
    pub fn on_disconnect<F>(mut self, callback: F) -> Self
    where
        F: Fn(&C) + Send + Sync + 'static,
    {
        self.on_disconnect = Arc::new(callback);
        self
    }

    /// Bind, listen and start dispatching. On failure the server stays down, reporting why.
    pub fn start(&mut self) -> ServerStatus {
        if self.status == ServerStatus::Up {
            return self.status;
        }

        // The previous run's pool can't be restarted, and its tasks captured the old callbacks.
        match Shared::new(
            self.events_capacity,
            self.shared.pool.max_threads(),
            self.keep_alive,
            self.on_connect.clone(),
            self.on_disconnect.clone(),
        ) {
            Ok(shared) => self.shared = Arc::new(shared),
            Err(e) => {
                warn!("Could not create the readiness queue: {}", e);
                self.status = ServerStatus::ErrSocketInit;
                return self.status;
            }
        }

        let mut server = SocketHandle::new();
        self.status = match server.init(self.host, self.port, Mode::SERVER | Mode::NONBLOCKING) {
            SocketStatus::Connected => ServerStatus::Up,
            SocketStatus::ErrSocketBind => ServerStatus::ErrSocketBind,
            SocketStatus::ErrSocketListening => ServerStatus::ErrSocketListening,
            _ => ServerStatus::ErrSocketInit,
        };
        if self.status != ServerStatus::Up {
            warn!("Could not listen on {}:{}: {:?}", self.host, self.port, self.status);
            return self.status;
        }

        // Accepted sockets inherit these; each one is still configured on accept.
        if let Err(e) = server.set_keep_alive(&self.keep_alive) {
            warn!("Could not enable keep-alive on the listening socket: {}", e);
            self.status = ServerStatus::ErrSocketKeepAlive;
            return self.status;
        }

        self.port = server.port();
        if let Err(e) = self.shared.multiplexer.add_server_socket(server) {
            warn!("Could not watch the listening socket: {}", e);
            self.status = ServerStatus::ErrSocketInit;
            return self.status;
        }

        self.shared.running.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name("dispatch".into())
            .spawn(move || dispatch_loop(&shared));
        match spawned {
            Ok(handle) => self.dispatch = Some(handle),
            Err(e) => {
                warn!("Could not spawn the dispatch thread: {}", e);
                self.shared.running.store(false, Ordering::SeqCst);
                self.shared.multiplexer.stop();
                self.status = ServerStatus::ErrSocketInit;
                return self.status;
            }
        }

        info!("Listening on {}:{}", self.host, self.port);
        self.status
    }

    /// Stop dispatching, let in-flight requests finish, then disconnect every client.
    pub fn stop(&mut self) {
        if self.status != ServerStatus::Up {
            return;
        }

        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(dispatch) = self.dispatch.take() {
            match dispatch.join() {
                Ok(Ok(())) => (),
                Ok(Err(e)) => warn!("Dispatch loop ended with {}", e),
                Err(_) => error!("Dispatch loop panicked"),
            }
        }
        self.shared.pool.stop();

        let clients = self.shared.multiplexer.stop();
        self.shared.release(clients);
        self.status = ServerStatus::Close;
        info!("Server on port {} stopped", self.port);
    }

    /// Block until the dispatch loop ends, then shut the server down. Returns the reason the loop
    /// ended, if it was not asked to.
    pub fn join_loop(&mut self) -> Result<()> {
        let result = match self.dispatch.take() {
            Some(dispatch) => dispatch.join().unwrap_or(Err(Error::Poisoned)),
            None => Ok(()),
        };
        self.stop();
        result
    }

    pub fn stopper(&self) -> Stopper {
        Stopper {
            running: self.shared.running.clone(),
        }
    }

    /// Open an outbound connection and hand it to `callback`. While the server is up, the
    /// connection is then watched like any accepted one.
    pub fn connect_to<F>(&self, host: Ipv4Addr, port: u16, callback: F) -> bool
    where
        F: FnOnce(&mut C),
    {
        let mut socket = SocketHandle::new();
        let status = socket.init(host, port, Mode::CLIENT | Mode::NONBLOCKING);
        if status != SocketStatus::Connected {
            debug!("Connecting to {}:{} failed: {:?}", host, port, status);
            return false;
        }

        let mut conn = C::new(socket);
        callback(&mut conn);

        if self.status == ServerStatus::Up && conn.status() == SocketStatus::Connected {
            if let Err(e) = self.shared.multiplexer.add_client(conn) {
                warn!("Could not watch outbound connection: {}", e);
            }
        }
        true
    }

    /// Disconnect every client, leaving the server listening.
    pub fn disconnect_all(&self) {
        let clients = self.shared.multiplexer.delete_all();
        self.shared.release(clients);
    }

    pub fn status(&self) -> ServerStatus {
        self.status
    }

    /// The configured port, or after `start` the port actually bound.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Takes effect on the next `start`.
    pub fn set_port(&mut self, port: u16) -> u16 {
        self.port = port;
        self.port
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.shared.pool
    }

    pub fn set_max_threads(&self, max_threads: usize) {
        self.shared.pool.set_max_threads(max_threads);
    }

    /// Number of registered clients.
    pub fn connections(&self) -> usize {
        self.shared.multiplexer.len()
    }
}

impl<C: Connection> Drop for TcpServer<C> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<C: Connection> Shared<C> {
    fn new(
        events_capacity: usize,
        threads: usize,
        keep_alive: KeepAliveConfig,
        on_connect: Callback<C>,
        on_disconnect: Callback<C>,
    ) -> Result<Self> {
        Ok(Shared {
            multiplexer: Multiplexer::new(events_capacity)?,
            pool: WorkerPool::new(threads),
            running: Arc::new(AtomicBool::new(false)),
            keep_alive,
            on_connect,
            on_disconnect,
        })
    }

    /// Disconnect clients that have already left the registry.
    fn release(&self, clients: Vec<Arc<ClientEntry<C>>>) {
        for entry in clients {
            let mut conn = entry.lock();
            (self.on_disconnect)(&*conn);
            conn.disconnect();
        }
    }

    /// Hand one event to the pool.
    fn dispatch(this: &Arc<Shared<C>>, event: Event<C>) {
        let kind = event.kind();
        let entry = match event.into_client() {
            Some(entry) => entry,
            None => {
                match kind {
                    EventKind::NeedAccept => {
                        let shared = this.clone();
                        this.pool.add(move || acceptor::accept(&shared));
                    }
                    _ => warn!("Listening socket reported {:?}", kind),
                }
                return;
            }
        };

        let shared = this.clone();
        match kind {
            EventKind::CanRead => this.pool.add(move || shared.serve(&entry)),
            EventKind::Close | EventKind::Err => this.pool.add(move || shared.close(&entry)),
            EventKind::NeedAccept => unreachable!("accept readiness on a client"),
        }
    }

    /// Run the connection's request processing, unless another worker already is. In that case
    /// the entry is marked and that worker goes around again once it is done.
    fn serve(&self, entry: &Arc<ClientEntry<C>>) {
        loop {
            let mut conn = match entry.try_lock() {
                Some(conn) => conn,
                None => {
                    entry.mark_pending();
                    // The holder only checks the mark after unlocking, so it may already be gone.
                    match entry.try_lock() {
                        Some(conn) => conn,
                        None => return,
                    }
                }
            };
            entry.take_pending();

            conn.handle_request();

            if entry.is_hung_up() || conn.status() != SocketStatus::Connected {
                self.teardown(entry, &mut *conn);
                return;
            }

            drop(conn);
            if !entry.take_pending() {
                return;
            }
        }
    }

    fn close(&self, entry: &Arc<ClientEntry<C>>) {
        let mut conn = entry.lock();
        self.teardown(entry, &mut *conn);
    }

    /// Only the caller that actually removes the entry fires the disconnect callback.
    fn teardown(&self, entry: &Arc<ClientEntry<C>>, conn: &mut C) {
        if self.multiplexer.delete_client(entry) {
            trace!("Tearing down descriptor {}", entry.fd());
            (self.on_disconnect)(&*conn);
        }
        conn.disconnect();
    }
}

fn dispatch_loop<C: Connection>(shared: &Arc<Shared<C>>) -> Result<()> {
    debug!("Dispatch loop running");
    while shared.running.load(Ordering::SeqCst) {
        let events = match shared.multiplexer.wait() {
            Ok(events) => events,
            Err(e) => {
                error!("Dispatch loop aborting: {}", e);
                shared.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        for event in events {
            Shared::dispatch(shared, event);
        }
    }
    debug!("Dispatch loop finished");
    Ok(())
}
