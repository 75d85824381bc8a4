use sentry_test::{REPORT_PREFIX, Signal};

use clap::Parser;
use signal_sentry::{CrashContext, CrashRecord};
use std::fmt::{self, Write as _};

#[derive(Parser)]
struct Command {
    /// The signal to raise
    #[clap(long)]
    signal: Signal,
    /// Raises the signal on a separate thread rather than the main thread
    #[clap(long)]
    use_thread: bool,
}

static CRASH_CONTEXT: CrashContext = CrashContext::new();

/// Formats into a fixed size buffer, since we can't allocate in the crash
/// callback
struct StackWriter {
    buf: [u8; 256],
    len: usize,
}

impl fmt::Write for StackWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let end = self.len + s.len();
        if end > self.buf.len() {
            return Err(fmt::Error);
        }

        self.buf[self.len..end].copy_from_slice(s.as_bytes());
        self.len = end;
        Ok(())
    }
}

fn write_report(record: &CrashRecord) {
    let mut writer = StackWriter {
        buf: [0; 256],
        len: 0,
    };

    if writeln!(
        writer,
        "{REPORT_PREFIX} signal={} code={} frames={} overflow={}",
        record.signal,
        record.code,
        record.backtrace().len(),
        record.stack_overflow,
    )
    .is_ok()
    {
        // SAFETY: syscall
        unsafe {
            libc::write(2, writer.buf.as_ptr().cast(), writer.len);
        }
    }
}

#[allow(unsafe_code)]
fn real_main() -> anyhow::Result<()> {
    let cmd = Command::parse();

    println!("pid: {}", std::process::id());

    let _sentry = signal_sentry::SignalSentry::install_with(
        &CRASH_CONTEXT,
        signal_sentry::Options {
            alt_stack: true,
            on_crash: Some(unsafe { signal_sentry::make_crash_event(write_report) }),
        },
    )?;

    let flavor = cmd.signal.flavor();

    let raise_signal = move || {
        // SAFETY: we're about to intentionally crash ourselves via shenanigans,
        // none of this is safe
        unsafe {
            flavor.make_sad();
        }
    };

    let mut threads = Vec::new();

    for _ in 0..10 {
        threads.push(std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::MAX);
        }));
    }

    if cmd.use_thread {
        std::thread::spawn(raise_signal)
            .join()
            .map_err(|_| anyhow::anyhow!("failed to join thread"))?;
    } else {
        raise_signal();
    }

    anyhow::bail!("we should have raised a signal and exited");
}

fn main() {
    // We want this program to crash, it _shouldn't_ have errors that prevent
    // that from happening, so emit an error code if we do encounter an error
    // so that we can fail the test
    if let Err(e) = real_main() {
        eprintln!("error: {:#}", e);

        // When exiting due to a crash, the exit code will be 128 + the integer
        // signal number, at least on unixes
        #[allow(clippy::exit)]
        std::process::exit(222);
    }
}
