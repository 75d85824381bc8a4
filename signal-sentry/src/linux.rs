mod state;

use crate::{CrashContext, Error};
use std::fmt;

/// The signals that we support catching and raising
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Signal {
    Abort = libc::SIGABRT,
    Bus = libc::SIGBUS,
    Fpe = libc::SIGFPE,
    Illegal = libc::SIGILL,
    Segv = libc::SIGSEGV,
    Sys = libc::SIGSYS,
    Trap = libc::SIGTRAP,
}

/// Every signal the sentry installs a handler for, in the order they are
/// installed. Uninstalling happens in the reverse order.
pub const FATAL_SIGNALS: [Signal; 7] = [
    Signal::Abort,
    Signal::Bus,
    Signal::Fpe,
    Signal::Illegal,
    Signal::Segv,
    Signal::Sys,
    Signal::Trap,
];

impl Signal {
    /// Maps a raw signal number to one of the fatal signals we handle
    #[inline]
    pub fn from_raw(signal: i32) -> Option<Self> {
        FATAL_SIGNALS.into_iter().find(|s| s.as_raw() == signal)
    }

    #[inline]
    pub fn as_raw(self) -> i32 {
        self as i32
    }

    /// True if the signal is raised again simply by returning from the handler
    /// when it was caused by a hardware fault, as the faulting instruction is
    /// re-executed.
    #[inline]
    pub fn refaults(self) -> bool {
        matches!(self, Self::Bus | Self::Fpe | Self::Illegal | Self::Segv)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Abort => "SIGABRT",
            Self::Bus => "SIGBUS",
            Self::Fpe => "SIGFPE",
            Self::Illegal => "SIGILL",
            Self::Segv => "SIGSEGV",
            Self::Sys => "SIGSYS",
            Self::Trap => "SIGTRAP",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Options for [`SignalSentry::install_with`]
pub struct Options {
    /// Installs an alternate signal stack for the installing thread if it
    /// doesn't already have a big enough one, so that stack overflows on that
    /// thread can be handled. Defaults to `true`.
    pub alt_stack: bool,
    /// Invoked from the signal handler with the finished record
    pub on_crash: Option<Box<dyn crate::CrashEvent>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            alt_stack: true,
            on_crash: None,
        }
    }
}

/// A Linux/Android fatal signal handler
pub struct SignalSentry;

#[allow(clippy::unused_self)]
impl SignalSentry {
    /// Installs the handler for every signal in [`FATAL_SIGNALS`], with the
    /// default [`Options`].
    ///
    /// The first fatal signal raised after this is recorded into `context`.
    /// Either every handler is installed, or, if any of them can't be, none
    /// of them are and the previous handlers are left exactly as they were.
    #[inline]
    pub fn install(context: &'static CrashContext) -> Result<Self, Error> {
        Self::install_with(context, Options::default())
    }

    /// Installs the handler, see [`Self::install`]
    pub fn install_with(context: &'static CrashContext, options: Options) -> Result<Self, Error> {
        state::install(context, options)?;
        Ok(Self)
    }

    /// Restores the handlers that were installed before this one.
    ///
    /// This is done automatically when this [`SignalSentry`] is dropped.
    #[inline]
    pub fn uninstall(self) {
        state::uninstall();
    }

    /// Records a crash for `signal` from the current state of the calling
    /// thread, as if that signal had just been raised, but without raising
    /// anything or passing it on to another handler.
    ///
    /// This consumes the context the same way a real crash does, returning
    /// `false` if a crash was already recorded.
    #[inline(never)]
    pub fn simulate_signal(&self, signal: Signal) -> bool {
        // SAFETY: every pointer handed to the capture refers to a local
        unsafe {
            let mut info: libc::siginfo_t = std::mem::zeroed();
            info.si_signo = signal.as_raw();
            info.si_code = state::SI_USER;

            let mut uc: crash_context::ucontext_t = std::mem::zeroed();
            let mut mc = crash_context::MachineContext::zeroed();
            mc.capture_current();
            uc.uc_mcontext = mc.mcontext().clone();

            state::simulate(signal, &info, (&raw const uc).cast())
        }
    }
}

impl Drop for SignalSentry {
    fn drop(&mut self) {
        state::uninstall();
    }
}

/// Uninstalls the current [`SignalSentry`], if there is one, restoring the
/// previous handler for each signal.
///
/// Calling this when nothing is installed does nothing.
#[inline]
pub fn uninstall() {
    state::uninstall();
}

/// True if a [`SignalSentry`] is currently installed
#[inline]
pub fn is_installed() -> bool {
    state::is_installed()
}
