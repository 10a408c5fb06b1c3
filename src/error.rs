//! Error handling within the reactor server.
//!
//! Socket and server operations report their outcome as status values. The errors here are for
//! the plumbing underneath them: the readiness queue, configuration loading and lock poisoning.
//!
//! As well as this enum, a macro throw has been defined - similar to try! - that logs errors at
//! the warn level and then propagates them up.

use std::io;
use std::os::unix::io::RawFd;
use std::result;
use std::sync::PoisonError;

use toml;

quick_error! {
    #[derive(Debug)]
    pub enum Error {
        Io(err: io::Error) {
            display("IO error: {}", err)
            source(err)
            from()
        }
        Config(err: toml::de::Error) {
            display("Config error: {}", err)
            source(err)
            from()
        }
        /// The readiness queue reported a descriptor the registry could not account for.
        Desync(fd: RawFd) {
            display("Registry out of sync with readiness queue on descriptor {}", fd)
        }
        Poisoned {
            display("A lock was poisoned by a panicking thread")
        }
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::Poisoned
    }
}

pub type Result<T> = result::Result<T, Error>;

#[macro_export]
macro_rules! throw {
    ($result:expr) =>  {
        match $result {
            Ok(t) => t,
            Err(e) => {
                let e = e.into();
                warn!("{}", e);
                return Err(e);
            },
        }
    }
}
