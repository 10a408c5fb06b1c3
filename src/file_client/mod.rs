//! A minimal static file server, built as a `Connection` handler.

use std::env;
use std::path::PathBuf;
use std::sync::Mutex;

use connection::Connection;
use socket::{Endpoint, SocketHandle};

mod filesystem;
pub use self::filesystem::{content_type, Filesystem, Lookup};

mod http;
use self::http::Status;

/// Bytes read from the socket per receive.
const CHUNK_SIZE: usize = 1024;

/// Directory new clients serve from. Unset means the working directory.
static ROOT_DIR: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Serve every `FileClient` built from now on out of `root`.
pub fn set_root_dir<P: Into<PathBuf>>(root: P) {
    let mut current = ROOT_DIR.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    *current = Some(root.into());
}

fn root_dir() -> PathBuf {
    let current = ROOT_DIR.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    match *current {
        Some(ref root) => root.clone(),
        None => env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}

/// A client asking for files, answered with one HTTP response per request.
pub struct FileClient {
    socket: SocketHandle,
    files: Filesystem,
}

impl FileClient {
    /// Wrap `socket`, serving out of `root` rather than the shared root directory.
    pub fn with_root<P: Into<PathBuf>>(socket: SocketHandle, root: P) -> Self {
        FileClient {
            socket,
            files: Filesystem::new(root),
        }
    }

    /// Everything that can be read right now.
    fn read_available(&mut self) -> Vec<u8> {
        let mut data = Vec::new();
        let mut chunk = [0u8; CHUNK_SIZE];
        while let Some(n) = self.socket.recv_from(&mut chunk) {
            data.extend_from_slice(&chunk[..n]);
        }
        data
    }

    /// Build the response to one raw request.
    pub fn respond(&self, request: &str) -> Vec<u8> {
        let line = request.split("\r\n").next().unwrap_or("");
        let mut parts = line.split_whitespace();
        let method = parts.next().unwrap_or("");
        let target = parts.next().unwrap_or("");
        let path = decode_url(target.split('?').next().unwrap_or(""));

        if method != "GET" && method != "HEAD" {
            return http::empty(Status::MethodNotAllowed);
        }

        let path = match self.files.get_file(&path) {
            Lookup::Found(path) => path,
            Lookup::NotFound => return http::empty(Status::NotFound),
            Lookup::Forbidden => return http::empty(Status::Forbidden),
        };

        let body = self.files.read(&path);
        if body.is_empty() {
            return http::empty(Status::NotFound);
        }

        match content_type(&path) {
            Some(mime) => http::ok(mime, &body, method == "GET"),
            None => http::empty(Status::Forbidden),
        }
    }
}

impl Endpoint for FileClient {
    fn socket(&self) -> &SocketHandle {
        &self.socket
    }

    fn socket_mut(&mut self) -> &mut SocketHandle {
        &mut self.socket
    }
}

impl Connection for FileClient {
    fn new(socket: SocketHandle) -> Self {
        FileClient::with_root(socket, root_dir())
    }

    fn handle_request(&mut self) {
        let data = self.read_available();
        if data.is_empty() {
            return;
        }

        let request = String::from_utf8_lossy(&data);
        trace!(
            "Request from {}:{}: {}",
            self.socket.host(),
            self.socket.port(),
            request.lines().next().unwrap_or("")
        );

        let response = self.respond(&request);
        if !self.socket.send_all(&response) {
            debug!("Could not send response to {}:{}", self.socket.host(), self.socket.port());
        }
    }
}

/// Decode `%XX` escapes. A malformed escape is kept as it is.
pub fn decode_url(url: &str) -> String {
    let bytes = url.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(high), Some(low)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                decoded.push(high << 4 | low);
                i += 3;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&decoded).into_owned()
}

fn hex_value(digit: u8) -> Option<u8> {
    (digit as char).to_digit(16).map(|value| value as u8)
}
