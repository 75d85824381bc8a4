//! Types shared between a fatal signal handler and whatever reads its results
//! afterwards.
//!
//! [`CrashContext`] is the single, pre-allocated record a crash is written
//! into. It is meant to live in a `static` so that nothing has to be allocated
//! once a signal has been delivered:
//!
//! ```
//! # #[cfg(any(target_os = "linux", target_os = "android"))]
//! # {
//! use crash_context::CrashContext;
//!
//! static CRASH_CONTEXT: CrashContext = CrashContext::new();
//!
//! assert!(!CRASH_CONTEXT.is_handling());
//! assert!(CRASH_CONTEXT.record().is_none());
//! # }
//! ```
//!
//! [`MachineContext`] is the register snapshot of the interrupted thread,
//! copied out of the `ucontext_t` the kernel hands to the signal handler.

// crate-specific exceptions:
#![allow(unsafe_code, nonstandard_style)]

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod linux;
        mod record;

        pub use linux::*;
        pub use record::*;
    }
}
