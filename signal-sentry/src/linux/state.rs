use super::{FATAL_SIGNALS, Options, Signal};
use crate::{CrashContext, CrashEvent, CrashRecord, Error};
use crash_context::{MAX_BACKTRACE_ENTRIES, STACK_OVERFLOW_THRESHOLD};
use std::{
    cell::UnsafeCell,
    ffi::c_void,
    io, mem, ptr,
    sync::atomic::{AtomicBool, AtomicPtr, Ordering},
};

// std::cmp::max is not const :(
const fn get_stack_size() -> usize {
    if libc::SIGSTKSZ > 16 * 1024 {
        libc::SIGSTKSZ
    } else {
        16 * 1024
    }
}

/// The size of the alternate stack that is mapped for the installing thread.
///
/// This has a minimum size of 16k, which might seem a bit large, but this
/// memory will only ever be committed in case we actually get a stack overflow,
/// which is (hopefully) exceedingly rare
const SIG_STACK_SIZE: usize = get_stack_size();

/// kill
pub(super) const SI_USER: i32 = 0;

/// One more than the highest signal number on Linux
const MAX_SIGNALS: usize = 65;

/// The handler that was installed for a signal before ours
struct SavedHandler {
    saved: AtomicBool,
    action: UnsafeCell<mem::MaybeUninit<libc::sigaction>>,
}

/// The previous handlers, indexed by signal number.
///
/// Slots are only written under the [`INSTALLED`] lock, and only while our
/// handler is not installed for that signal, so the signal handler can read
/// them without taking a lock.
struct SavedHandlers([SavedHandler; MAX_SIGNALS]);

// SAFETY: see above
unsafe impl Sync for SavedHandlers {}

impl SavedHandlers {
    const fn new() -> Self {
        Self(
            [const {
                SavedHandler {
                    saved: AtomicBool::new(false),
                    action: UnsafeCell::new(mem::MaybeUninit::uninit()),
                }
            }; MAX_SIGNALS],
        )
    }

    #[inline]
    fn slot(&self, signal: i32) -> Option<&SavedHandler> {
        usize::try_from(signal).ok().and_then(|i| self.0.get(i))
    }

    /// Must only be called with the install lock held. Returns false if the
    /// signal number is out of range.
    unsafe fn save(&self, signal: i32, action: libc::sigaction) -> bool {
        let Some(slot) = self.slot(signal) else {
            return false;
        };

        // SAFETY: the caller holds the install lock, and the handler only
        // reads the slot once `saved` is set
        unsafe {
            (*slot.action.get()).write(action);
        }
        slot.saved.store(true, Ordering::Release);
        true
    }

    #[inline]
    fn get(&self, signal: i32) -> Option<&libc::sigaction> {
        let slot = self.slot(signal)?;
        if slot.saved.load(Ordering::Acquire) {
            // SAFETY: `saved` is only set after the action is written
            Some(unsafe { (*slot.action.get()).assume_init_ref() })
        } else {
            None
        }
    }

    #[inline]
    fn clear(&self, signal: i32) {
        if let Some(slot) = self.slot(signal) {
            slot.saved.store(false, Ordering::Release);
        }
    }
}

static SAVED_HANDLERS: SavedHandlers = SavedHandlers::new();

/// The context crashes are recorded into, published before any of our
/// handlers are installed
static CONTEXT: AtomicPtr<CrashContext> = AtomicPtr::new(ptr::null_mut());

/// The user's callback, if they supplied one
static EVENT: AtomicPtr<Box<dyn CrashEvent>> = AtomicPtr::new(ptr::null_mut());

/// An alternate signal stack we mapped, and the one it replaced
struct AltStack {
    old: Option<libc::stack_t>,
    new: libc::stack_t,
}

unsafe impl Send for AltStack {}

struct Installed {
    alt_stack: Option<AltStack>,
}

static INSTALLED: parking_lot::Mutex<Option<Installed>> = parking_lot::const_mutex(None);

impl AltStack {
    /// Create an alternative stack to run the signal handlers on. This is done
    /// since the signal might have been caused by a stack overflow.
    ///
    /// Returns `None` if the current thread already has one that is big enough.
    unsafe fn install() -> Result<Option<Self>, Error> {
        unsafe {
            // Check to see if the existing sigaltstack, and if it exists, is it big
            // enough. If so we don't need to allocate our own.
            let mut old_stack: libc::stack_t = mem::zeroed();
            if libc::sigaltstack(ptr::null(), &mut old_stack) == -1 {
                return Err(io::Error::last_os_error().into());
            }

            if old_stack.ss_flags & libc::SS_DISABLE == 0 && old_stack.ss_size >= SIG_STACK_SIZE {
                log::debug!(
                    "reusing existing alternate signal stack of {} bytes",
                    old_stack.ss_size
                );
                return Ok(None);
            }

            // ... but failing that we need to allocate our own, so do all that
            // here.
            let guard_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
            let alloc_size = guard_size + SIG_STACK_SIZE;

            let ptr = libc::mmap(
                ptr::null_mut(),
                alloc_size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(Error::OutOfMemory);
            }

            // Prepare the stack with readable/writable memory and then register it
            // with `sigaltstack`, leaving the guard page below it inaccessible
            let stack_ptr = (ptr as usize + guard_size) as *mut c_void;
            if libc::mprotect(
                stack_ptr,
                SIG_STACK_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
            ) == -1
            {
                let err = io::Error::last_os_error();
                libc::munmap(ptr, alloc_size);
                return Err(err.into());
            }

            let new_stack = libc::stack_t {
                ss_sp: stack_ptr,
                ss_flags: 0,
                ss_size: SIG_STACK_SIZE,
            };
            if libc::sigaltstack(&new_stack, ptr::null_mut()) == -1 {
                let err = io::Error::last_os_error();
                libc::munmap(ptr, alloc_size);
                return Err(err.into());
            }

            log::debug!("installed alternate signal stack of {SIG_STACK_SIZE} bytes");

            Ok(Some(Self {
                old: (old_stack.ss_flags & libc::SS_DISABLE == 0).then_some(old_stack),
                new: new_stack,
            }))
        }
    }

    /// Restores the alternate stack that was replaced, and unmaps ours.
    ///
    /// Our stack is only unmapped if it is the current one of the calling
    /// thread, otherwise it may still be in use by the thread that installed
    /// it, so it is leaked instead.
    unsafe fn restore(self) {
        unsafe {
            let mut current_stack: libc::stack_t = mem::zeroed();
            if libc::sigaltstack(ptr::null(), &mut current_stack) == -1 {
                return;
            }

            if current_stack.ss_sp != self.new.ss_sp {
                log::warn!("alternate signal stack was installed on another thread, leaking it");
                return;
            }

            let result = if let Some(old) = self.old {
                // Restore the old alt stack if there was one
                libc::sigaltstack(&old, ptr::null_mut())
            } else {
                // Restore to the default alt stack otherwise
                let mut disable: libc::stack_t = mem::zeroed();
                disable.ss_flags = libc::SS_DISABLE;
                libc::sigaltstack(&disable, ptr::null_mut())
            };

            if result == -1 {
                log::warn!(
                    "failed to restore the previous alternate signal stack: {}",
                    io::Error::last_os_error()
                );
                return;
            }

            let guard_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
            let r = libc::munmap(
                (self.new.ss_sp as usize - guard_size) as *mut c_void,
                self.new.ss_size + guard_size,
            );
            debug_assert_eq!(r, 0, "munmap failed while restoring the alternate stack");
        }
    }
}

/// Restores the signal handler for the specified signal back to its default
/// handler, which _should_ perform the default signal action as seen in
/// <https://man7.org/linux/man-pages/man7/signal.7.html>
#[inline]
unsafe fn install_default_handler(sig: i32) {
    // Android L+ expose signal and sigaction symbols that override the system
    // ones. There is a bug in these functions where a request to set the handler
    // to SIG_DFL is ignored. In that case, an infinite loop is entered as the
    // signal is repeatedly sent to our signal handler.
    // To work around this, directly call the system's sigaction.
    unsafe {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "android")] {
                let mut sa: libc::sigaction = mem::zeroed();
                libc::sigemptyset(&mut sa.sa_mask);
                sa.sa_sigaction = libc::SIG_DFL;
                sa.sa_flags = libc::SA_RESTART;
                libc::syscall(
                    libc::SYS_rt_sigaction,
                    sig,
                    &sa,
                    ptr::null::<libc::sigaction>(),
                    mem::size_of::<libc::sigset_t>(),
                );
            } else {
                libc::signal(sig, libc::SIG_DFL);
            }
        }
    }
}

/// Puts back the handler that was installed before ours for the signal, or
/// the default handler if there wasn't one or it can't be restored
unsafe fn restore_previous(sig: i32) {
    unsafe {
        match SAVED_HANDLERS.get(sig) {
            Some(old) if libc::sigaction(sig, old, ptr::null_mut()) == 0 => {}
            _ => install_default_handler(sig),
        }
    }
}

/// Restores the previous handlers of `signals`, in the reverse of the order
/// they were installed in
unsafe fn restore_handlers(signals: &[i32]) {
    for sig in signals.iter().rev().copied() {
        if SAVED_HANDLERS.get(sig).is_none() {
            continue;
        }

        // SAFETY: syscalls
        unsafe { restore_previous(sig) };
        SAVED_HANDLERS.clear(sig);
    }
}

/// The action our handler is installed with
unsafe fn our_action() -> libc::sigaction {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        libc::sigemptyset(&mut sa.sa_mask);

        // Mask all fatal signals when we're handling one of them.
        for sig in FATAL_SIGNALS {
            libc::sigaddset(&mut sa.sa_mask, sig.as_raw());
        }

        sa.sa_sigaction = signal_handler as usize;
        sa.sa_flags = libc::SA_ONSTACK | libc::SA_SIGINFO;
        sa
    }
}

/// The raw numbers of [`FATAL_SIGNALS`], in the order handlers are installed
fn fatal_signals() -> [i32; FATAL_SIGNALS.len()] {
    FATAL_SIGNALS.map(Signal::as_raw)
}

/// Saves the current handler of each signal and installs ours in its place.
/// If that fails for any signal, every signal changed so far is restored.
///
/// Must only be called with the install lock held.
unsafe fn install_handlers(signals: &[i32]) -> Result<(), Error> {
    unsafe {
        let sa = our_action();

        for (i, sig) in signals.iter().copied().enumerate() {
            // The previous handler is saved before ours is installed, so it is
            // always available to chain to, no matter how soon the signal is
            // raised
            let mut old: libc::sigaction = mem::zeroed();
            let registered = libc::sigaction(sig, ptr::null(), &mut old) == 0
                && SAVED_HANDLERS.save(sig, old)
                && libc::sigaction(sig, &sa, ptr::null_mut()) == 0;

            if !registered {
                let source = io::Error::last_os_error();
                log::error!("failed to install handler for signal {sig}: {source}");

                SAVED_HANDLERS.clear(sig);
                restore_handlers(&signals[..i]);

                return Err(Error::Register {
                    signal: sig,
                    source,
                });
            }
        }
    }

    Ok(())
}

unsafe fn release_event() {
    let event = EVENT.swap(ptr::null_mut(), Ordering::AcqRel);
    if !event.is_null() {
        // SAFETY: the pointer came from `Box::into_raw` in `install`
        drop(unsafe { Box::from_raw(event) });
    }
}

pub(super) fn install(context: &'static CrashContext, options: Options) -> Result<(), Error> {
    let mut lock = INSTALLED.lock();

    if lock.is_some() {
        return Err(Error::AlreadyInstalled);
    }

    // SAFETY: syscalls
    let alt_stack = if options.alt_stack {
        unsafe { AltStack::install()? }
    } else {
        None
    };

    CONTEXT.store(ptr::from_ref(context).cast_mut(), Ordering::Release);
    if let Some(on_crash) = options.on_crash {
        EVENT.store(Box::into_raw(Box::new(on_crash)), Ordering::Release);
    }

    // SAFETY: syscalls
    if let Err(err) = unsafe { install_handlers(&fatal_signals()) } {
        unsafe {
            release_event();
            if let Some(alt_stack) = alt_stack {
                alt_stack.restore();
            }
        }
        CONTEXT.store(ptr::null_mut(), Ordering::Release);

        return Err(err);
    }

    log::debug!("installed handlers for {} fatal signals", FATAL_SIGNALS.len());
    *lock = Some(Installed { alt_stack });

    Ok(())
}

/// Removes our signal handlers, restoring the previously installed or
/// default handlers
pub(super) fn uninstall() {
    let mut lock = INSTALLED.lock();

    if let Some(installed) = lock.take() {
        // SAFETY: syscalls
        unsafe {
            restore_handlers(&fatal_signals());
            release_event();
            if let Some(alt_stack) = installed.alt_stack {
                alt_stack.restore();
            }
        }
        CONTEXT.store(ptr::null_mut(), Ordering::Release);

        log::debug!("restored previous handlers");
    }
}

#[inline]
pub(super) fn is_installed() -> bool {
    INSTALLED.lock().is_some()
}

/// What happens to the signal once we're done with it
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum Disposition {
    /// The crash was recorded, pass the signal on to the previous handler
    Recorded,
    /// Restore the previous handler so that it receives the signal next
    Chain,
    /// Let the default action for the signal, almost always termination, take
    /// place
    Default,
}

/// Records the crash into `context`, if nothing else has.
///
/// # Safety
///
/// `uc` must point to a `ucontext_t`.
pub(super) unsafe fn capture(
    context: &CrashContext,
    signal: Signal,
    info: &libc::siginfo_t,
    uc: *const c_void,
    skip_entries: usize,
) -> Disposition {
    let Some(mut capture) = context.begin_capture() else {
        if context.is_handling() {
            // Another fatal signal while we're still busy with the first, most
            // likely we crashed in the handler itself. Leave the record alone
            // and just die.
            debug_print!("crashed during handling");
            context.mark_crashed_during_handling();
            return Disposition::Default;
        }

        debug_print!("crash already recorded");
        return Disposition::Chain;
    };

    debug_print!("capturing");

    {
        let record: &mut CrashRecord = &mut capture;

        record.signal = signal.as_raw();
        record.code = info.si_code;
        // si_addr is only meaningful for faults raised by the hardware
        record.fault_address = if signal.refaults() && info.si_code > 0 {
            // SAFETY: the kernel fills in si_addr for these signals
            unsafe { info.si_addr() as usize }
        } else {
            0
        };

        // SAFETY: syscalls, and the caller guarantees `uc`
        unsafe {
            record.pid = libc::getpid();
            record.tid = libc::syscall(libc::SYS_gettid) as libc::pid_t;
            record.machine_context.capture_from(uc);
        }
        debug_print!("copied context");

        record.backtrace_length = stack_walker::backtrace_thread_state(
            &record.machine_context,
            &mut record.backtrace,
            skip_entries,
            MAX_BACKTRACE_ENTRIES,
        );
        record.stack_overflow =
            stack_walker::is_backtrace_too_long(&record.machine_context, STACK_OVERFLOW_THRESHOLD);
        debug_print!("walked backtrace");
    }

    capture.finish();

    if let Some(record) = context.record() {
        let event = EVENT.load(Ordering::Acquire);
        if !event.is_null() {
            // SAFETY: the event is only released after our handlers have been
            // removed
            unsafe { (*event).on_crash(record) };
        }
    }

    Disposition::Recorded
}

/// Records a crash without a signal having been raised
pub(super) unsafe fn simulate(signal: Signal, info: &libc::siginfo_t, uc: *const c_void) -> bool {
    let context = CONTEXT.load(Ordering::Acquire);
    if context.is_null() {
        return false;
    }

    // SAFETY: the context is 'static. We skip the frame of `simulate_signal`
    // since that is where the registers were captured.
    unsafe {
        capture(&*context, signal, info, uc, 1) == Disposition::Recorded
    }
}

/// Sends the signal to ourselves again, if returning from the handler won't
unsafe fn reraise(sig: Signal, info: &libc::siginfo_t) {
    if info.si_code <= 0 || !sig.refaults() {
        // This signal was either sent by somebody with kill(), or doesn't
        // automatically recur once we return, eg. SIGABRT. In order to
        // retrigger it, we have to queue a new signal by calling tgkill()
        // ourselves. It is blocked until we return, at which point the handler
        // we just restored receives it.
        unsafe {
            let tid = libc::syscall(libc::SYS_gettid) as libc::pid_t;
            if libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, sig.as_raw()) < 0 {
                // If we failed to kill ourselves (e.g. because a sandbox disallows us
                // to do so), we instead resort to terminating our process. This will
                // result in an incorrect exit code.
                libc::_exit(1);
            }
        }
    } else {
        // This was a synchronous signal triggered by a hard fault (e.g. SIGSEGV).
        // No need to reissue the signal. It will automatically trigger again,
        // when we return from the signal handler.
    }
}

/// This is the actual function installed for each signal we support, invoked
/// by the kernel
unsafe extern "C" fn signal_handler(sig: i32, info: *mut libc::siginfo_t, uc: *mut c_void) {
    unsafe {
        // We might run inside a process where some other buggy code saves and
        // restores signal handlers temporarily with `signal` instead of `sigaction`.
        // This loses the `SA_SIGINFO` flag associated with this function. As a
        // consequence, the values of `info` and `uc` become totally bogus,
        // generally inducing a crash.
        //
        // The following code tries to detect this case. When it does, it
        // resets the signal handlers with `sigaction` & `SA_SIGINFO` and returns.
        // This forces the signal to be thrown again, but this time the kernel
        // will call the function with the right arguments.
        {
            let mut cur_handler: libc::sigaction = mem::zeroed();
            if libc::sigaction(sig, ptr::null(), &mut cur_handler) == 0
                && cur_handler.sa_sigaction == signal_handler as usize
                && cur_handler.sa_flags & libc::SA_SIGINFO == 0
            {
                debug_print!("handler lost SA_SIGINFO, reinstalling");

                if libc::sigaction(sig, &our_action(), ptr::null_mut()) == -1 {
                    // When resetting the handler fails, try to reset the
                    // default one to avoid an infinite loop here.
                    install_default_handler(sig);
                }

                // exit the handler as we should be called again soon
                return;
            }
        }

        let Some(signal) = Signal::from_raw(sig) else {
            return;
        };
        let info = &*info;

        let context = CONTEXT.load(Ordering::Acquire);
        let disposition = if context.is_null() {
            Disposition::Chain
        } else {
            capture(&*context, signal, info, uc, 0)
        };

        // Upon returning from this signal handler, sig will become unmasked and
        // then it will be retriggered, and delivered to whatever handler we
        // set here.
        match disposition {
            Disposition::Recorded | Disposition::Chain => {
                debug_print!("restoring previous handler");
                restore_previous(sig);
            }
            Disposition::Default => {
                debug_print!("installing default handler");
                install_default_handler(sig);
            }
        }

        debug_print!("finishing signal handler");
        reraise(signal, info);
    }
}
