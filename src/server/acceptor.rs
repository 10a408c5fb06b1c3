use std::sync::Arc;

use connection::Connection;
use multiplexer::ClientEntry;
use socket::SocketStatus;

use super::Shared;

/// Accept one pending connection and start watching it. The listener is level-triggered, so
/// anything left in the backlog shows up in the next wait.
pub(super) fn accept<C: Connection>(shared: &Arc<Shared<C>>) {
    let socket = shared.multiplexer.accept();
    if socket.status() != SocketStatus::Connected {
        // Another worker took it first.
        return;
    }

    if let Err(e) = socket.set_keep_alive(&shared.keep_alive) {
        warn!("Dropping {}, keep-alive could not be set: {}", socket.address(), e);
        return;
    }

    let entry = Arc::new(ClientEntry::new(C::new(socket)));
    // Held until the client is announced, so no request runs ahead of the callback.
    let conn = entry.lock();
    if let Err(e) = shared.multiplexer.insert(entry.clone()) {
        warn!("Could not register accepted connection: {}", e);
        return;
    }
    (shared.on_connect)(&*conn);
    drop(conn);

    // Input that arrived while the callback ran.
    if entry.take_pending() {
        shared.serve(&entry);
    }
}
