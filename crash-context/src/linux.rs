use std::{ffi::c_void, fmt, mem, ptr};

#[repr(C)]
#[derive(Clone)]
pub struct sigset_t {
    __val: [u64; 16],
}

#[repr(C)]
#[derive(Clone)]
pub struct stack_t {
    pub ss_sp: *mut c_void,
    pub ss_flags: i32,
    pub ss_size: usize,
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        #[repr(C)]
        #[derive(Clone)]
        pub struct ucontext_t {
            pub uc_flags: u64,
            pub uc_link: *mut ucontext_t,
            pub uc_stack: stack_t,
            pub uc_mcontext: mcontext_t,
            pub uc_sigmask: sigset_t,
        }

        #[repr(C)]
        #[derive(Clone)]
        pub struct mcontext_t {
            pub gregs: [i64; 23],
            /// Points into the signal frame of the interrupted thread, so it
            /// is cleared when a snapshot is taken
            pub fpregs: *mut c_void,
            __reserved: [u64; 8],
        }

        const REG_RBP: usize = 10;
        const REG_RSP: usize = 15;
        const REG_RIP: usize = 16;

        impl MachineContext {
            #[inline]
            pub fn instruction_pointer(&self) -> usize {
                self.mcontext.gregs[REG_RIP] as usize
            }

            #[inline]
            pub fn stack_pointer(&self) -> usize {
                self.mcontext.gregs[REG_RSP] as usize
            }

            #[inline]
            pub fn frame_pointer(&self) -> usize {
                self.mcontext.gregs[REG_RBP] as usize
            }

            fn set_registers(&mut self, ip: usize, sp: usize, fp: usize) {
                self.mcontext.gregs[REG_RIP] = ip as i64;
                self.mcontext.gregs[REG_RSP] = sp as i64;
                self.mcontext.gregs[REG_RBP] = fp as i64;
            }

            /// Overwrites the snapshot with the instruction, stack, and frame
            /// pointers of the caller.
            ///
            /// Only those three registers are captured, which is all a frame
            /// pointer walk needs.
            #[inline(always)]
            pub fn capture_current(&mut self) {
                let (ip, sp, fp): (usize, usize, usize);
                unsafe {
                    std::arch::asm!(
                        "lea {ip}, [rip]",
                        "mov {sp}, rsp",
                        "mov {fp}, rbp",
                        ip = out(reg) ip,
                        sp = out(reg) sp,
                        fp = out(reg) fp,
                        options(nomem, nostack, preserves_flags),
                    );
                }

                *self = Self::zeroed();
                self.set_registers(ip, sp, fp);
            }

            fn clear_signal_frame_pointers(&mut self) {
                self.mcontext.fpregs = ptr::null_mut();
            }
        }
    } else if #[cfg(target_arch = "aarch64")] {
        #[repr(C)]
        #[derive(Clone)]
        pub struct ucontext_t {
            pub uc_flags: u64,
            pub uc_link: *mut ucontext_t,
            pub uc_stack: stack_t,
            pub uc_sigmask: sigset_t,
            pub uc_mcontext: mcontext_t,
        }

        #[repr(C)]
        #[derive(Clone)]
        pub struct mcontext_t {
            pub fault_address: u64,
            pub regs: [u64; 31],
            pub sp: u64,
            pub pc: u64,
            pub pstate: u64,
            // `long double` alignment, the kernel stores the fpsimd and other
            // extension records here
            __reserved: [u128; 256],
        }

        /// x29
        const REG_FP: usize = 29;

        impl MachineContext {
            #[inline]
            pub fn instruction_pointer(&self) -> usize {
                self.mcontext.pc as usize
            }

            #[inline]
            pub fn stack_pointer(&self) -> usize {
                self.mcontext.sp as usize
            }

            #[inline]
            pub fn frame_pointer(&self) -> usize {
                self.mcontext.regs[REG_FP] as usize
            }

            fn set_registers(&mut self, ip: usize, sp: usize, fp: usize) {
                self.mcontext.pc = ip as u64;
                self.mcontext.sp = sp as u64;
                self.mcontext.regs[REG_FP] = fp as u64;
            }

            /// Overwrites the snapshot with the instruction, stack, and frame
            /// pointers of the caller.
            ///
            /// Only those three registers are captured, which is all a frame
            /// pointer walk needs.
            #[inline(always)]
            pub fn capture_current(&mut self) {
                let (ip, sp, fp): (usize, usize, usize);
                unsafe {
                    std::arch::asm!(
                        "adr {ip}, .",
                        "mov {sp}, sp",
                        "mov {fp}, x29",
                        ip = out(reg) ip,
                        sp = out(reg) sp,
                        fp = out(reg) fp,
                        options(nomem, nostack, preserves_flags),
                    );
                }

                *self = Self::zeroed();
                self.set_registers(ip, sp, fp);
            }

            fn clear_signal_frame_pointers(&mut self) {}
        }
    } else {
        compile_error!("unsupported target architecture, only x86_64 and aarch64 are implemented");
    }
}

/// Snapshot of the registers of a thread at the point it was interrupted.
///
/// This is a copy of the kernel's `mcontext_t` for the target architecture.
/// Once captured it is never modified by anything that reads it.
#[repr(C)]
#[derive(Clone)]
pub struct MachineContext {
    mcontext: mcontext_t,
}

unsafe impl Send for MachineContext {}

impl MachineContext {
    /// A snapshot with every register set to 0
    #[inline]
    pub const fn zeroed() -> Self {
        // SAFETY: every field is an integer, an integer array, or a raw pointer
        unsafe { mem::zeroed() }
    }

    /// Creates a snapshot where only the instruction, stack, and frame
    /// pointers are set.
    ///
    /// This is mainly useful for walking synthetic stacks.
    pub fn from_registers(ip: usize, sp: usize, fp: usize) -> Self {
        let mut mc = Self::zeroed();
        mc.set_registers(ip, sp, fp);
        mc
    }

    /// Copies the machine context out of a `ucontext_t`, as received as the
    /// third argument of an `SA_SIGINFO` signal handler.
    ///
    /// The copy is done in place since the snapshot is large enough that
    /// returning it by value could overflow a small alternate signal stack.
    ///
    /// # Safety
    ///
    /// `uc` must point to a valid `ucontext_t` for the target.
    pub unsafe fn capture_from(&mut self, uc: *const c_void) {
        unsafe {
            let uc = uc.cast::<ucontext_t>();
            ptr::copy_nonoverlapping(&raw const (*uc).uc_mcontext, &mut self.mcontext, 1);
        }
        self.clear_signal_frame_pointers();
    }

    /// The raw machine context
    #[inline]
    pub fn mcontext(&self) -> &mcontext_t {
        &self.mcontext
    }
}

impl fmt::Debug for MachineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineContext")
            .field("ip", &format_args!("{:#x}", self.instruction_pointer()))
            .field("sp", &format_args!("{:#x}", self.stack_pointer()))
            .field("fp", &format_args!("{:#x}", self.frame_pointer()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn registers_round_trip() {
        let mc = MachineContext::from_registers(0x1000, 0x7ff0_0000, 0x7ff0_0040);

        assert_eq!(mc.instruction_pointer(), 0x1000);
        assert_eq!(mc.stack_pointer(), 0x7ff0_0000);
        assert_eq!(mc.frame_pointer(), 0x7ff0_0040);
    }

    #[test]
    fn copies_mcontext_out_of_ucontext() {
        let mut uc: ucontext_t = unsafe { mem::zeroed() };
        {
            let mut regs = MachineContext::zeroed();
            regs.set_registers(0xdead, 0xbeef0, 0xbeef8);
            uc.uc_mcontext = regs.mcontext;
        }

        let mut mc = MachineContext::zeroed();
        unsafe { mc.capture_from((&raw const uc).cast()) };

        assert_eq!(mc.instruction_pointer(), 0xdead);
        assert_eq!(mc.stack_pointer(), 0xbeef0);
        assert_eq!(mc.frame_pointer(), 0xbeef8);
    }

    #[test]
    fn captures_own_registers() {
        let mut mc = MachineContext::zeroed();
        mc.capture_current();

        let local = 0u64;
        let local_addr = std::hint::black_box(&raw const local) as usize;

        assert_ne!(mc.instruction_pointer(), 0);
        // The stack grows down, our local lives somewhere in the current frame
        // which sits at or above the stack pointer we captured
        assert!(mc.stack_pointer() <= local_addr);
    }

    // Musl doesn't contain fpregs in libc https://github.com/rust-lang/libc/pull/1646
    #[cfg(all(target_arch = "x86_64", target_env = "gnu"))]
    #[test]
    fn matches_libc() {
        assert_eq!(
            mem::size_of::<libc::mcontext_t>(),
            mem::size_of::<super::mcontext_t>()
        );
    }
}
