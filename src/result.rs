/// Unwraps a result, or logs the error, repeats it on stderr in case no logger is installed yet,
/// and exits the process with status 1.
#[macro_export]
macro_rules! unwrap {
    ($result:expr) => {
        match $result {
            Ok(t) => t,
            Err(e) => {
                error!("Aborting due to {}", e);
                eprintln!("Aborting due to {}", e);
                ::std::process::exit(1)
            }
        }
    }
}
