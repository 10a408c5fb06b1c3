use std::fs;
use std::path::{Component, Path, PathBuf};

/// Where a request path led.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(PathBuf),
    NotFound,
    Forbidden,
}

/// Resolves request paths beneath a root directory.
#[derive(Debug, Clone)]
pub struct Filesystem {
    root: PathBuf,
}

impl Filesystem {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Filesystem { root: root.into() }
    }

    /// Find the file a request path names. A directory resolves to its `index.html`, and is
    /// forbidden without one. Paths that climb out through `..` are forbidden.
    pub fn get_file(&self, path: &str) -> Lookup {
        let mut resolved = self.root.clone();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::RootDir | Component::CurDir => (),
                Component::ParentDir | Component::Prefix(_) => return Lookup::Forbidden,
            }
        }
        let path = resolved;

        if !path.exists() {
            return Lookup::NotFound;
        }

        if path.is_dir() {
            let index = path.join("index.html");
            if index.is_file() {
                return Lookup::Found(index);
            }
            return Lookup::Forbidden;
        }

        Lookup::Found(path)
    }

    /// Read a resolved file. An unreadable file reads as empty.
    pub fn read(&self, path: &Path) -> Vec<u8> {
        fs::read(path).unwrap_or_else(|e| {
            debug!("Could not read {:?}: {}", path, e);
            Vec::new()
        })
    }
}

/// MIME type served for a file, by extension. `None` for anything not servable.
pub fn content_type(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match extension.as_str() {
        "txt" => "text/txt",
        "css" => "text/css",
        "html" => "text/html",
        "js" => "application/javascript",
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "swf" => "application/x-shockwave-flash",
        _ => return None,
    };
    Some(mime)
}
