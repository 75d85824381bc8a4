//! Installing and uninstalling changes process wide state, so this is all one
//! test in its own binary.
#![allow(unsafe_code)]

use signal_sentry::{self as ss, CrashContext, Error, FATAL_SIGNALS, Signal, SignalSentry};
use std::{mem, ptr};

static CRASH_CONTEXT: CrashContext = CrashContext::new();

extern "C" fn custom_trap(_sig: i32, _info: *mut libc::siginfo_t, _uc: *mut libc::c_void) {}

/// glibc adds `SA_RESTORER` behind our back, so only compare the flags anyone
/// here actually sets
const FLAGS: i32 =
    libc::SA_SIGINFO | libc::SA_ONSTACK | libc::SA_RESTART | libc::SA_NODEFER | libc::SA_RESETHAND;

#[derive(Debug, PartialEq)]
struct Registration {
    handler: usize,
    flags: i32,
    mask: Vec<bool>,
}

fn current(sig: i32) -> libc::sigaction {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        assert_eq!(libc::sigaction(sig, ptr::null(), &mut sa), 0);
        sa
    }
}

fn registrations() -> Vec<Registration> {
    FATAL_SIGNALS
        .iter()
        .map(|sig| {
            let sa = current(sig.as_raw());

            Registration {
                handler: sa.sa_sigaction,
                flags: sa.sa_flags & FLAGS,
                mask: (1..=64)
                    .map(|s| unsafe { libc::sigismember(&sa.sa_mask, s) == 1 })
                    .collect(),
            }
        })
        .collect()
}

#[test]
fn restores_previous_handlers() {
    // Give one of the signals a handler with a distinctive mask and flags
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaddset(&mut sa.sa_mask, libc::SIGUSR1);
        sa.sa_sigaction = custom_trap as usize;
        sa.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        assert_eq!(libc::sigaction(libc::SIGTRAP, &sa, ptr::null_mut()), 0);
    }

    let before = registrations();
    let trap = FATAL_SIGNALS
        .iter()
        .position(|sig| *sig == Signal::Trap)
        .unwrap();
    assert_eq!(before[trap].handler, custom_trap as usize);

    // Uninstalling when nothing is installed is fine
    ss::uninstall();
    assert!(!ss::is_installed());
    assert_eq!(registrations(), before);

    let sentry = SignalSentry::install(&CRASH_CONTEXT).unwrap();
    assert!(ss::is_installed());

    let installed = registrations();
    for (sig, reg) in FATAL_SIGNALS.iter().zip(&installed) {
        assert_ne!(reg.handler, libc::SIG_DFL, "{sig}");
        assert_eq!(reg.handler, installed[0].handler, "{sig}");
        assert_eq!(
            reg.flags,
            libc::SA_SIGINFO | libc::SA_ONSTACK,
            "{sig} has unexpected flags"
        );

        // Every fatal signal is blocked while any of them is being handled
        for other in FATAL_SIGNALS {
            assert!(reg.mask[other.as_raw() as usize - 1], "{sig} doesn't mask {other}");
        }
    }

    assert!(matches!(
        SignalSentry::install(&CRASH_CONTEXT),
        Err(Error::AlreadyInstalled)
    ));
    assert!(ss::is_installed());

    sentry.uninstall();
    assert!(!ss::is_installed());
    assert_eq!(registrations(), before);

    // Idempotent
    ss::uninstall();
    assert_eq!(registrations(), before);

    // We can install again after uninstalling, and dropping uninstalls
    {
        let _sentry = SignalSentry::install_with(
            &CRASH_CONTEXT,
            ss::Options {
                alt_stack: false,
                on_crash: None,
            },
        )
        .unwrap();
        assert_eq!(registrations(), installed);
    }
    assert!(!ss::is_installed());
    assert_eq!(registrations(), before);

    // Nothing has crashed through all of that
    assert!(CRASH_CONTEXT.record().is_none());

    // Simulating a signal records it without touching any handler
    let sentry = SignalSentry::install(&CRASH_CONTEXT).unwrap();
    assert!(sentry.simulate_signal(Signal::Trap));
    assert_eq!(registrations(), installed);

    let record = CRASH_CONTEXT.record().expect("simulated crash was recorded");
    assert_eq!(record.signal, libc::SIGTRAP);
    assert_eq!(record.code, 0);
    assert_eq!(record.fault_address, 0);
    assert_ne!(record.machine_context.instruction_pointer(), 0);

    // The context only ever holds one crash
    assert!(!sentry.simulate_signal(Signal::Abort));
    assert_eq!(CRASH_CONTEXT.record().unwrap().signal, libc::SIGTRAP);

    drop(sentry);
    assert_eq!(registrations(), before);
}
