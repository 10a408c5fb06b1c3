use socket::{Endpoint, SocketHandle};

/// A connection to a client, as the server sees it.
///
/// The server builds one from every accepted socket, keeps it registered for readiness, and calls
/// `handle_request` whenever the socket has input. Calls on one connection never overlap.
///
/// Registration is edge-triggered: a handler should consume all input that is available when it
/// is called, since the server will not be told again about bytes that were already there.
pub trait Connection: Endpoint + Send + 'static {
    /// Wrap a freshly accepted, connected socket. No data has been read from it yet.
    fn new(socket: SocketHandle) -> Self;

    /// Process one request.
    fn handle_request(&mut self);
}
