/// An error that can occur when installing a [`crate::SignalSentry`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// For simplicity sake, only one [`crate::SignalSentry`] can be installed
    /// at any one time.
    #[error("a signal sentry is already installed")]
    AlreadyInstalled,
    /// `sigaction` refused our handler, every handler that had already been
    /// replaced was restored before this was returned
    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[error("failed to register a handler for signal {signal}")]
    Register {
        signal: i32,
        source: std::io::Error,
    },
    /// Unable to `mmap` memory for the alternate signal stack
    #[error("unable to allocate memory for the alternate signal stack")]
    OutOfMemory,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
