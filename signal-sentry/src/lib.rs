//! [`SignalSentry`] records fatal signals into a pre-allocated
//! [`CrashContext`] and then gets out of the way, handing the signal on to
//! whatever handler was installed before it, or the default action.
//!
//! For each crash the signal, its code and faulting address, the crashing
//! process and thread, the registers of the interrupted thread, and a
//! backtrace walked from those registers are written into the context. All
//! of that happens inside the signal handler, so none of it allocates, takes
//! a lock, or calls anything that isn't [async signal safe](https://man7.org/linux/man-pages/man7/signal-safety.7.html).
//!
//! # Signals
//!
//! The following [signals](https://man7.org/linux/man-pages/man7/signal.7.html)
//! are handled
//!
//! ## `SIGABRT`
//!
//! Signal sent to a process to tell it to abort, i.e. to terminate. The signal
//! is usually initiated by the process itself when it calls `std::process::abort`
//! or `libc::abort`, but it can be sent to the process from outside like any
//! other signal.
//!
//! ## `SIGBUS`
//!
//! Signal sent to a process when it causes a [bus error](https://en.wikipedia.org/wiki/Bus_error).
//!
//! ## `SIGFPE`
//!
//! Signal sent to a process when it executes an erroneous arithmetic operation.
//! Though it stands for **f**loating **p**oint **e**xception this signal covers
//! integer operations as well.
//!
//! ## `SIGILL`
//!
//! Signal sent to a process when it attempts to execute an **illegal**, malformed,
//! unknown, or privileged, instruction.
//!
//! ## `SIGSEGV`
//!
//! Signal sent to a process when it makes an invalid virtual memory reference,
//! a [segmentation fault](https://en.wikipedia.org/wiki/Segmentation_fault).
//! This covers infamous `null` pointer access, out of bounds access, use after
//! free, stack overflows, etc.
//!
//! ## `SIGSYS`
//!
//! Signal sent to a process when it passes a bad argument to a system call,
//! or makes a system call that a `seccomp` filter forbids.
//!
//! ## `SIGTRAP`
//!
//! Signal sent to a process when a trap is raised, eg. a breakpoint or debug
//! assertion.
//!
//! `SIGPIPE` is deliberately not in this list, Rust programs ignore it.
//!
//! # Stack overflows
//!
//! Signals are normally handled on the stack of the thread that raised them,
//! which is of no help when that stack has just overflowed. By default
//! installing the sentry also installs an [alternate signal stack](https://man7.org/linux/man-pages/man2/sigaltstack.2.html)
//! for the installing thread, if it doesn't already have one. Threads spawned
//! via [`std::thread`] always have one.

#![allow(unsafe_code)]

mod error;

pub use error::Error;

#[cfg(feature = "debug-print")]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {
        let cstr = concat!($s, "\n");
        $crate::write_stderr(cstr);
    };
}

#[cfg(not(feature = "debug-print"))]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {};
}

/// Writes the specified string directly to stderr.
///
/// This is safe to be called from within a compromised context.
#[inline]
pub fn write_stderr(s: &'static str) {
    unsafe {
        libc::write(2, s.as_ptr().cast(), s.len());
    }
}

pub use crash_context::{CrashContext, CrashRecord};

/// User implemented trait for observing a crash once it has been recorded.
///
/// # Safety
///
/// This trait is marked unsafe as care needs to be taken when implementing it
/// due to the [`Self::on_crash`] method being run in a compromised context.
/// Only a small subset of libc functions are
/// [async signal safe](https://man7.org/linux/man-pages/man7/signal-safety.7.html)
/// and calling non-safe ones can have undefined behavior, including such common
/// ones as `malloc` (especially if using a multi-threaded allocator). Anything
/// more involved than copying the record somewhere should be set up before
/// the [`SignalSentry`] is installed, or hoisted out to another process
/// entirely.
pub unsafe trait CrashEvent: Send + Sync {
    /// Method invoked with the finished record, before the signal is passed on
    /// to the previous handler
    fn on_crash(&self, record: &CrashRecord);
}

/// Creates a [`CrashEvent`] using the supplied closure as the implementation.
///
/// # Safety
///
/// See the [`CrashEvent`] Safety section for information on why this is `unsafe`.
#[inline]
pub unsafe fn make_crash_event<F>(closure: F) -> Box<dyn CrashEvent>
where
    F: Send + Sync + Fn(&CrashRecord) + 'static,
{
    struct Wrapper<F> {
        inner: F,
    }

    unsafe impl<F> CrashEvent for Wrapper<F>
    where
        F: Send + Sync + Fn(&CrashRecord),
    {
        fn on_crash(&self, record: &CrashRecord) {
            (self.inner)(record);
        }
    }

    Box::new(Wrapper { inner: closure })
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod linux;

        pub use linux::{FATAL_SIGNALS, Options, Signal, SignalSentry, is_installed, uninstall};
    }
}
