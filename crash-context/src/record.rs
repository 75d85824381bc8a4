use crate::MachineContext;
use std::{
    cell::UnsafeCell,
    fmt, mem, ops,
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
};

/// A single return or instruction address in a backtrace
pub type BacktraceEntry = usize;

/// The number of backtrace entries a [`CrashRecord`] has room for
pub const MAX_BACKTRACE_ENTRIES: usize = 150;

/// A walk from the crashing thread that yields more frames than this is
/// considered to be the result of a stack overflow
pub const STACK_OVERFLOW_THRESHOLD: usize = 200;

/// The details of a single crash, filled in by the signal handler.
#[repr(C)]
#[derive(Clone)]
pub struct CrashRecord {
    /// The signal that was raised
    pub signal: i32,
    /// The `si_code` of the signal, `<= 0` if it was sent by a user
    pub code: i32,
    /// The faulting address for memory and arithmetic faults, 0 otherwise
    pub fault_address: usize,
    /// The id of the crashing process
    pub pid: libc::pid_t,
    /// The id of the crashing thread
    pub tid: libc::pid_t,
    /// The register state of the crashing thread when it was interrupted
    pub machine_context: MachineContext,
    /// Storage for the backtrace, only the first `backtrace_length` entries
    /// are valid
    pub backtrace: [BacktraceEntry; MAX_BACKTRACE_ENTRIES],
    /// The number of valid entries in `backtrace`
    pub backtrace_length: usize,
    /// The stack was deeper than [`STACK_OVERFLOW_THRESHOLD`] frames
    pub stack_overflow: bool,
}

impl CrashRecord {
    const fn zeroed() -> Self {
        // SAFETY: all integers, pointers, and a bool, for which 0 is valid
        unsafe { mem::zeroed() }
    }

    /// The valid portion of the backtrace, innermost frame first
    #[inline]
    pub fn backtrace(&self) -> &[BacktraceEntry] {
        &self.backtrace[..self.backtrace_length.min(MAX_BACKTRACE_ENTRIES)]
    }
}

impl fmt::Debug for CrashRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrashRecord")
            .field("signal", &self.signal)
            .field("code", &self.code)
            .field("fault_address", &format_args!("{:#x}", self.fault_address))
            .field("pid", &self.pid)
            .field("tid", &self.tid)
            .field("machine_context", &self.machine_context)
            .field("backtrace", &self.backtrace())
            .field("stack_overflow", &self.stack_overflow)
            .finish()
    }
}

/// Where a [`CrashContext`] is in its lifecycle
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CaptureState {
    /// No crash has happened
    Idle,
    /// A signal handler is currently filling in the record
    Capturing,
    /// The record is complete and can be read
    Recorded,
}

const IDLE: u8 = 0;
const CAPTURING: u8 = 1;
const RECORDED: u8 = 2;

/// The process wide crash record.
///
/// This is created once, before any signal handler that could write to it is
/// installed, and lives for the rest of the process. It is written at most
/// once, by whichever signal handler wins [`Self::begin_capture`], and is only
/// readable via [`Self::record`] after that handler has finished with it.
///
/// The guard is a lock-free flag rather than a mutex since the crashing
/// thread may well have been interrupted while holding any given lock.
pub struct CrashContext {
    state: AtomicU8,
    crashed_during_handling: AtomicBool,
    record: UnsafeCell<CrashRecord>,
}

// SAFETY: the record is only written through a `Capture`, of which there is
// at most one for the lifetime of the context, and only read after that
// `Capture` is dropped
unsafe impl Sync for CrashContext {}

impl CrashContext {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
            crashed_during_handling: AtomicBool::new(false),
            record: UnsafeCell::new(CrashRecord::zeroed()),
        }
    }

    #[inline]
    pub fn state(&self) -> CaptureState {
        match self.state.load(Ordering::Acquire) {
            IDLE => CaptureState::Idle,
            CAPTURING => CaptureState::Capturing,
            _ => CaptureState::Recorded,
        }
    }

    /// True while a signal handler is in the middle of recording a crash
    #[inline]
    pub fn is_handling(&self) -> bool {
        self.state() == CaptureState::Capturing
    }

    /// The recorded crash, if one has been fully captured
    #[inline]
    pub fn record(&self) -> Option<&CrashRecord> {
        if self.state() == CaptureState::Recorded {
            // SAFETY: once recorded there are no more writers
            Some(unsafe { &*self.record.get() })
        } else {
            None
        }
    }

    /// True if another fatal signal was raised while the crash was being
    /// captured
    #[inline]
    pub fn crashed_during_handling(&self) -> bool {
        self.crashed_during_handling.load(Ordering::Acquire)
    }

    /// Notes that a fatal signal arrived while a capture was in progress.
    ///
    /// This only sets a flag, the record itself is left alone.
    #[inline]
    pub fn mark_crashed_during_handling(&self) {
        self.crashed_during_handling.store(true, Ordering::Release);
    }

    /// Claims the record for writing.
    ///
    /// Only the first call for the lifetime of the context succeeds, every
    /// later call, whether the first capture is still in progress or not,
    /// returns `None`.
    #[inline]
    pub fn begin_capture(&self) -> Option<Capture<'_>> {
        self.state
            .compare_exchange(IDLE, CAPTURING, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Capture { context: self })
    }
}

impl Default for CrashContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive write access to the record of a [`CrashContext`].
///
/// Dropping it publishes the record.
pub struct Capture<'ctx> {
    context: &'ctx CrashContext,
}

impl Capture<'_> {
    /// Publishes the record, same as dropping
    #[inline]
    pub fn finish(self) {}
}

impl ops::Deref for Capture<'_> {
    type Target = CrashRecord;

    #[inline]
    fn deref(&self) -> &CrashRecord {
        // SAFETY: we are the only holder of write access
        unsafe { &*self.context.record.get() }
    }
}

impl ops::DerefMut for Capture<'_> {
    #[inline]
    fn deref_mut(&mut self) -> &mut CrashRecord {
        // SAFETY: we are the only holder of write access
        unsafe { &mut *self.context.record.get() }
    }
}

impl Drop for Capture<'_> {
    fn drop(&mut self) {
        self.context.state.store(RECORDED, Ordering::Release);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn starts_idle() {
        let cc = CrashContext::new();

        assert_eq!(cc.state(), CaptureState::Idle);
        assert!(!cc.is_handling());
        assert!(!cc.crashed_during_handling());
        assert!(cc.record().is_none());
    }

    #[test]
    fn record_is_published_when_capture_finishes() {
        let cc = CrashContext::new();

        let mut capture = cc.begin_capture().expect("first capture");
        assert!(cc.is_handling());
        assert!(cc.record().is_none());

        capture.signal = libc::SIGSEGV;
        capture.backtrace[0] = 0x1000;
        capture.backtrace[1] = 0x2000;
        capture.backtrace_length = 2;
        capture.finish();

        assert_eq!(cc.state(), CaptureState::Recorded);
        let record = cc.record().expect("recorded");
        assert_eq!(record.signal, libc::SIGSEGV);
        assert_eq!(record.backtrace(), &[0x1000, 0x2000]);
    }

    #[test]
    fn second_capture_cannot_clobber_the_first() {
        static CC: CrashContext = CrashContext::new();

        let mut first = CC.begin_capture().expect("first capture");
        first.signal = libc::SIGBUS;
        first.fault_address = 0xbad;

        // A second fatal signal arrives while the first is still being captured
        assert!(CC.begin_capture().is_none());
        CC.mark_crashed_during_handling();

        assert_eq!(first.signal, libc::SIGBUS);
        drop(first);

        // ...and after it has been captured
        assert!(CC.begin_capture().is_none());

        let record = CC.record().expect("recorded");
        assert_eq!(record.signal, libc::SIGBUS);
        assert_eq!(record.fault_address, 0xbad);
        assert!(CC.crashed_during_handling());
    }

    #[test]
    fn backtrace_never_exceeds_storage() {
        let cc = CrashContext::new();
        {
            let mut capture = cc.begin_capture().unwrap();
            capture.backtrace_length = MAX_BACKTRACE_ENTRIES + 10;
        }

        assert_eq!(cc.record().unwrap().backtrace().len(), MAX_BACKTRACE_ENTRIES);
    }
}
