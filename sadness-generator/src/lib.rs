//! Deliberately raises each of the fatal signals, for testing crash handling.
//!
//! Every function here ends the process one way or another, unless a signal
//! handler intervenes.

#![allow(unsafe_code)]

use std::{arch::asm, hint::black_box, ptr};

/// The address [`raise_segfault`] reads a `usize` from. It lies in the first
/// page, which is never mapped, and is aligned so the read itself is valid.
pub const SEGFAULT_ADDRESS: usize = 0x40;

/// The ways we can make a program sad
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SadnessFlavor {
    /// `SIGABRT`
    Abort,
    /// `SIGBUS`
    Bus,
    /// `SIGFPE`
    DivideByZero,
    /// `SIGILL`
    Illegal,
    /// `SIGSEGV`
    Segfault,
    /// `SIGSEGV`, on a guard page
    StackOverflow,
    /// `SIGSYS`
    Sys,
    /// `SIGTRAP`
    Trap,
}

impl SadnessFlavor {
    /// The signal this flavor of sadness raises
    pub fn signal(self) -> i32 {
        match self {
            Self::Abort => libc::SIGABRT,
            Self::Bus => libc::SIGBUS,
            Self::DivideByZero => libc::SIGFPE,
            Self::Illegal => libc::SIGILL,
            Self::Segfault | Self::StackOverflow => libc::SIGSEGV,
            Self::Sys => libc::SIGSYS,
            Self::Trap => libc::SIGTRAP,
        }
    }

    /// Makes you sad
    ///
    /// # Safety
    ///
    /// This is not safe. It intentionally crashes.
    pub unsafe fn make_sad(self) -> ! {
        unsafe {
            match self {
                Self::Abort => raise_abort(),
                Self::Bus => raise_bus(),
                Self::DivideByZero => raise_floating_point_exception(),
                Self::Illegal => raise_illegal_instruction(),
                Self::Segfault => raise_segfault(),
                Self::StackOverflow => raise_stack_overflow(),
                Self::Sys => raise_sys(),
                Self::Trap => raise_trap(),
            }
        }
    }
}

/// Raises `SIGABRT`
pub fn raise_abort() -> ! {
    std::process::abort();
}

/// Raises `SIGSEGV` by reading [`SEGFAULT_ADDRESS`]
///
/// # Safety
///
/// This is not safe. It intentionally crashes.
pub unsafe fn raise_segfault() -> ! {
    let value = unsafe { ptr::read_volatile(SEGFAULT_ADDRESS as *const usize) };

    println!("we should have crashed by reading {SEGFAULT_ADDRESS:#x}: {value}");
    unreachable!();
}

/// Raises `SIGFPE` by dividing by zero
///
/// # Safety
///
/// This is not safe. It intentionally crashes.
pub unsafe fn raise_floating_point_exception() -> ! {
    #[cfg(target_arch = "x86_64")]
    {
        let ohno: u32;
        unsafe {
            asm!(
                "mov eax, 1",
                "cdq",
                "mov {div:e}, 0",
                "idiv {div:e}",
                div = out(reg) ohno,
                out("eax") _,
                out("edx") _,
            );
        }

        println!("we should have crashed by dividing by zero: {ohno}");
    }

    // Integer division by zero doesn't trap on aarch64, it just returns 0, so
    // the best we can do is raise the signal directly
    #[cfg(target_arch = "aarch64")]
    unsafe {
        libc::raise(libc::SIGFPE);
    }

    unreachable!();
}

/// Raises `SIGILL` by executing an instruction that is permanently undefined
///
/// # Safety
///
/// This is not safe. It intentionally crashes.
pub unsafe fn raise_illegal_instruction() -> ! {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        asm!("ud2");
    }
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("udf #0");
    }

    unreachable!();
}

/// Raises `SIGTRAP` by hitting a breakpoint instruction
///
/// # Safety
///
/// This is not safe. It intentionally crashes.
pub unsafe fn raise_trap() -> ! {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        asm!("int3");
    }
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("brk #0");
    }

    unreachable!();
}

/// The file [`raise_bus`] maps for the process with the given pid. It is
/// removed as soon as it is mapped.
pub fn bus_file_path(pid: u32) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("sadness-{pid}.bus"))
}

/// Raises `SIGBUS` by reading past the end of a file mapping
///
/// # Safety
///
/// This is not safe. It intentionally crashes.
pub unsafe fn raise_bus() -> ! {
    use std::os::fd::AsRawFd;

    let path = bus_file_path(std::process::id());
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .expect("failed to create file to map");

    unsafe {
        // The file is empty, so every page of the mapping is past its end
        let mapping = libc::mmap(
            ptr::null_mut(),
            128,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        );
        assert_ne!(mapping, libc::MAP_FAILED, "failed to map {}", path.display());

        // The mapping keeps the file alive
        let _ = std::fs::remove_file(&path);

        let value = ptr::read_volatile(mapping.cast::<u8>().add(1));
        println!("we should have crashed by reading past the end of a file: {value}");
    }

    unreachable!();
}

/// Raises `SIGSYS`.
///
/// The kernel only raises this itself for system calls a seccomp filter
/// forbids, so it is sent directly instead.
///
/// # Safety
///
/// This is not safe. It intentionally crashes.
pub unsafe fn raise_sys() -> ! {
    unsafe {
        libc::raise(libc::SIGSYS);
    }

    unreachable!();
}

/// Raises `SIGSEGV` by recursing until the guard page below the stack is hit
///
/// # Safety
///
/// This is not safe. It intentionally crashes.
pub unsafe fn raise_stack_overflow() -> ! {
    #[inline(never)]
    #[allow(unconditional_recursion)]
    fn recurse(depth: u64) -> u64 {
        let frame = black_box([depth as u8; 1024]);
        recurse(depth + 1) + u64::from(frame[0])
    }

    println!("{}", recurse(0));
    unreachable!();
}
