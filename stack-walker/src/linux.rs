use crate::{FrameRecord, StackMemory};
use std::{ffi::c_void, mem};

/// Reads frame records out of the memory of a process with
/// [`process_vm_readv`](https://man7.org/linux/man-pages/man2/process_vm_readv.2.html).
///
/// Unlike dereferencing a pointer, the syscall reports an unmapped or
/// unreadable address as an error instead of raising `SIGSEGV`, and being a
/// plain syscall it is async signal safe.
#[derive(Copy, Clone, Debug)]
pub struct ProcessMemory {
    pid: libc::pid_t,
}

impl ProcessMemory {
    /// Reads the memory of the current process
    #[inline]
    pub fn current() -> Self {
        // SAFETY: syscall
        Self {
            pid: unsafe { libc::getpid() },
        }
    }

    /// Copies `buffer.len()` words starting at `address`, failing if any of
    /// them can't be read
    pub fn read_words(&self, address: usize, buffer: &mut [usize]) -> bool {
        let len = mem::size_of_val(buffer);

        let local = libc::iovec {
            iov_base: buffer.as_mut_ptr().cast::<c_void>(),
            iov_len: len,
        };
        let remote = libc::iovec {
            iov_base: address as *mut c_void,
            iov_len: len,
        };

        // SAFETY: syscall, the local iovec covers exactly `buffer`. We call the
        // syscall directly as the libc wrapper is missing on older Androids
        let read = unsafe {
            libc::syscall(
                libc::SYS_process_vm_readv,
                self.pid,
                &local as *const libc::iovec,
                1usize,
                &remote as *const libc::iovec,
                1usize,
                0usize,
            )
        };

        // A partial read means the record straddles the end of a mapping
        read >= 0 && read as usize == len
    }
}

impl StackMemory for ProcessMemory {
    #[inline]
    fn read_frame(&self, address: usize) -> Option<FrameRecord> {
        let mut words = [0usize; 2];
        self.read_words(address, &mut words).then(|| FrameRecord {
            previous: words[0],
            return_address: words[1],
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{MachineContext, StackWalker};

    #[test]
    fn reads_own_memory() {
        let record = [0x1234usize, 0x5678];

        let read = ProcessMemory::current().read_frame(record.as_ptr() as usize);
        assert_eq!(
            read,
            Some(FrameRecord {
                previous: 0x1234,
                return_address: 0x5678,
            })
        );
    }

    #[test]
    fn fails_instead_of_faulting() {
        let memory = ProcessMemory::current();

        assert!(memory.read_frame(8).is_none());
        assert!(memory.read_frame(usize::MAX - 4).is_none());
    }

    #[test]
    fn walks_a_chain_in_real_memory() {
        // Lay out 3 frame records, each linking to the next, in one allocation
        // so they are at increasing addresses like on a real stack
        let mut records = vec![[0usize; 2]; 3];
        let base = records.as_ptr() as usize;
        let record_size = mem::size_of::<[usize; 2]>();

        for (i, record) in records.iter_mut().enumerate() {
            record[0] = if i < 2 { base + (i + 1) * record_size } else { 0 };
            record[1] = 0x2000 + i * 0x1000;
        }

        let mc = MachineContext::from_registers(0x1000, base, base);
        let mut buffer = [0; 8];

        let written = crate::backtrace_thread_state(&mc, &mut buffer, 0, 8);
        assert_eq!(&buffer[..written], &[0x1000, 0x2000, 0x3000, 0x4000]);
        assert_eq!(crate::backtrace_length(&mc), 4);
        assert!(crate::is_backtrace_too_long(&mc, 3));
        assert!(!crate::is_backtrace_too_long(&mc, 4));
    }

    #[test]
    fn walks_the_current_thread() {
        let mut mc = MachineContext::zeroed();
        mc.capture_current();

        let walker = StackWalker::new(&mc, ProcessMemory::current());
        let mut buffer = [0; 32];
        let written = walker.backtrace_thread_state(&mut buffer, 0, 32);

        // The workspace is built with frame pointers, so at least this test's
        // caller is on the chain
        assert!(written > 1, "{:x?}", &buffer[..written]);
        assert_eq!(buffer[0], mc.instruction_pointer());
    }
}
