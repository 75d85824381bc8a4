//! Reconstructs the call stack of an interrupted thread from a
//! [`MachineContext`] by following the saved frame pointer chain.
//!
//! Everything in this crate is safe to run inside a signal handler: nothing
//! allocates, nothing takes a lock, and every walk is bounded, both by the
//! caller's limits and by [`GIVE_UP_POINT`], regardless of how corrupted the
//! stack being walked is.
//!
//! # Frames
//!
//! The first frame is the instruction pointer of the snapshot. Every frame
//! after that is the return address stored in the next frame record of the
//! chain, where a frame record is the pair of words a function prologue
//! pushes, `[fp]` being the caller's frame pointer and `[fp + word]` the
//! return address. This layout is shared by x86_64 (`rbp`) and aarch64
//! (`x29`).
//!
//! The walk ends at the first of
//!
//! - an instruction pointer or return address of 0
//! - a frame record whose link to its caller doesn't point further up the
//!   stack than the record itself, which covers a link of 0 and every cycle
//! - a frame pointer that is not plausible: null, not word aligned, or below
//!   the stack pointer of the snapshot
//! - a frame record that can't be read
//! - [`GIVE_UP_POINT`] frames
//!
//! # Memory
//!
//! Reads go through [`StackMemory`]. [`ProcessMemory`] reads the memory of
//! the current process in a way that fails rather than faults if the address
//! is bogus, which is exactly what a stack that caused a crash tends to
//! contain.

#![allow(unsafe_code)]

mod cursor;

pub use crash_context::{BacktraceEntry, MachineContext};
pub use cursor::FrameCursor;

/// The point at which a walk gives up, no matter what the caller asked for.
///
/// This really only comes into play when the frame chain loops back on
/// itself, eg. after a stack overflow.
pub const GIVE_UP_POINT: usize = 10_000_000;

/// A frame record as laid out on the stack by a function prologue
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct FrameRecord {
    /// The frame pointer of the caller
    pub previous: usize,
    /// The address execution resumes at in the caller
    pub return_address: usize,
}

/// Source of frame records.
///
/// Implementations must not allocate, lock, or fault, since they are called
/// from signal handlers with addresses taken from a possibly corrupted stack.
pub trait StackMemory {
    /// Reads the frame record at `address`, or `None` if it can't be read
    fn read_frame(&self, address: usize) -> Option<FrameRecord>;
}

impl<M: StackMemory + ?Sized> StackMemory for &M {
    #[inline]
    fn read_frame(&self, address: usize) -> Option<FrameRecord> {
        (**self).read_frame(address)
    }
}

/// Walks the stack described by a [`MachineContext`]
pub struct StackWalker<'ctx, M> {
    context: &'ctx MachineContext,
    memory: M,
}

impl<'ctx, M: StackMemory> StackWalker<'ctx, M> {
    #[inline]
    pub fn new(context: &'ctx MachineContext, memory: M) -> Self {
        Self { context, memory }
    }

    /// An iterator over the frames of the stack, innermost first
    #[inline]
    pub fn frames(&self) -> FrameCursor<'_, M> {
        FrameCursor::new(self.context, &self.memory)
    }

    /// Counts the frames that can be walked, up to [`GIVE_UP_POINT`].
    ///
    /// This is useful for intelligently generating a backtrace after a stack
    /// overflow, though [`Self::is_backtrace_too_long`] is the cheaper choice
    /// if only a yes or no answer is needed.
    pub fn backtrace_length(&self) -> usize {
        self.frames().count()
    }

    /// True if more than `max_length` frames can be walked.
    ///
    /// Stops walking as soon as the answer is known.
    pub fn is_backtrace_too_long(&self, max_length: usize) -> bool {
        // Walks are capped at the give up point, so a walk can never be longer
        // than a limit at or past it
        max_length < GIVE_UP_POINT && self.frames().take(max_length + 1).count() > max_length
    }

    /// Writes the stack's frames into `buffer`, innermost first.
    ///
    /// The first `skip_entries` frames are skipped, eg. to hide the frames of
    /// whatever captured the context, and at most `max_entries` (and never more
    /// than `buffer.len()`) entries are written. Returns the number of entries
    /// written.
    pub fn backtrace_thread_state(
        &self,
        buffer: &mut [BacktraceEntry],
        skip_entries: usize,
        max_entries: usize,
    ) -> usize {
        let limit = max_entries.min(buffer.len());
        let mut written = 0;

        for (slot, address) in buffer[..limit]
            .iter_mut()
            .zip(self.frames().skip(skip_entries))
        {
            *slot = address;
            written += 1;
        }

        written
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod linux;

        pub use linux::ProcessMemory;

        /// Counts the frames of the snapshot in the memory of the current
        /// process, see [`StackWalker::backtrace_length`]
        #[inline]
        pub fn backtrace_length(context: &MachineContext) -> usize {
            StackWalker::new(context, ProcessMemory::current()).backtrace_length()
        }

        /// See [`StackWalker::is_backtrace_too_long`]
        #[inline]
        pub fn is_backtrace_too_long(context: &MachineContext, max_length: usize) -> bool {
            StackWalker::new(context, ProcessMemory::current()).is_backtrace_too_long(max_length)
        }

        /// Generates a backtrace from the snapshot in the memory of the current
        /// process, see [`StackWalker::backtrace_thread_state`]
        #[inline]
        pub fn backtrace_thread_state(
            context: &MachineContext,
            buffer: &mut [BacktraceEntry],
            skip_entries: usize,
            max_entries: usize,
        ) -> usize {
            StackWalker::new(context, ProcessMemory::current())
                .backtrace_thread_state(buffer, skip_entries, max_entries)
        }
    }
}
