use sadness_generator::SadnessFlavor;
use std::{fmt, process::Command};

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    Abort,
    Bus,
    Fpe,
    Illegal,
    Segv,
    StackOverflow,
    Sys,
    Trap,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Illegal => "illegal",
            Self::Trap => "trap",
            Self::Abort => "abort",
            Self::Bus => "bus",
            Self::Fpe => "fpe",
            Self::Segv => "segv",
            Self::StackOverflow => "stack-overflow",
            Self::Sys => "sys",
        })
    }
}

impl Signal {
    #[inline]
    pub fn flavor(self) -> SadnessFlavor {
        match self {
            Self::Abort => SadnessFlavor::Abort,
            Self::Bus => SadnessFlavor::Bus,
            Self::Fpe => SadnessFlavor::DivideByZero,
            Self::Illegal => SadnessFlavor::Illegal,
            Self::Segv => SadnessFlavor::Segfault,
            Self::StackOverflow => SadnessFlavor::StackOverflow,
            Self::Sys => SadnessFlavor::Sys,
            Self::Trap => SadnessFlavor::Trap,
        }
    }

    /// The signals the crash client may die from.
    ///
    /// A stack overflow is a `SIGSEGV`, but when it hits the guard page of a
    /// Rust thread the previous handler, installed by std, reports it and then
    /// aborts.
    pub fn terminating_signals(self) -> &'static [i32] {
        match self {
            Self::StackOverflow => &[libc::SIGSEGV, libc::SIGABRT],
            Self::Abort => &[libc::SIGABRT],
            Self::Bus => &[libc::SIGBUS],
            Self::Fpe => &[libc::SIGFPE],
            Self::Illegal => &[libc::SIGILL],
            Self::Segv => &[libc::SIGSEGV],
            Self::Sys => &[libc::SIGSYS],
            Self::Trap => &[libc::SIGTRAP],
        }
    }
}

/// The line the crash client writes to stderr from its crash callback
#[derive(Debug, PartialEq, Eq)]
pub struct Report {
    pub signal: i32,
    pub code: i32,
    pub frames: usize,
    pub overflow: bool,
}

pub const REPORT_PREFIX: &str = "sentry:";

impl Report {
    /// Parses a `sentry: signal=<n> code=<n> frames=<n> overflow=<bool>` line
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.strip_prefix(REPORT_PREFIX)?.split_whitespace();

        let mut field = |name: &str| {
            fields
                .next()?
                .strip_prefix(name)?
                .strip_prefix('=')
                .map(str::to_owned)
        };

        Some(Self {
            signal: field("signal")?.parse().ok()?,
            code: field("code")?.parse().ok()?,
            frames: field("frames")?.parse().ok()?,
            overflow: field("overflow")?.parse().ok()?,
        })
    }
}

/// How a crash client run ended
#[derive(Debug)]
pub struct Outcome {
    /// The pid the client printed before crashing
    pub pid: Option<u32>,
    /// The signal the process was terminated by, if it was
    pub signal: Option<i32>,
    pub exit_code: Option<i32>,
    pub report: Option<Report>,
    pub stderr: String,
}

pub fn run_client(signal: Signal, use_thread: bool) -> Outcome {
    use std::{env, os::unix::process::ExitStatusExt};

    // Adapted from
    // https://github.com/rust-lang/cargo/blob/485670b3983b52289a2f353d589c57fae2f60f82/tests/testsuite/support/mod.rs#L507
    let mut cmd_path = env::current_exe().expect("failed to get exe path");
    cmd_path.pop();
    if cmd_path.ends_with("deps") {
        cmd_path.pop();
    }

    cmd_path.push("crash-client");

    let mut cmd = Command::new(&cmd_path);
    cmd.stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    cmd.args(["--signal", &signal.to_string()]);
    if use_thread {
        cmd.arg("--use-thread");
    }

    let child = cmd.spawn().expect("failed to run crash-client");
    let output = child.wait_with_output().expect("failed to wait for output");

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    println!("{stdout}");
    eprintln!("{stderr}");

    Outcome {
        pid: stdout
            .lines()
            .find_map(|line| line.strip_prefix("pid: ")?.parse().ok()),
        signal: output.status.signal(),
        exit_code: output.status.code(),
        report: stderr.lines().find_map(Report::parse),
        stderr,
    }
}

/// Asserts the client recorded the signal it raised, and then died from it
pub fn assert_outcome(outcome: &Outcome, signal: Signal) {
    let expected = signal.flavor().signal();

    assert_eq!(
        outcome.exit_code, None,
        "crash-client exited normally:\n{}",
        outcome.stderr
    );

    let died_from = outcome.signal.expect("crash-client was not killed by a signal");
    assert!(
        signal.terminating_signals().contains(&died_from),
        "crash-client died from signal {died_from}, expected one of {:?}",
        signal.terminating_signals()
    );

    let report = outcome
        .report
        .as_ref()
        .expect("crash-client didn't report the crash");
    assert_eq!(report.signal, expected);
    assert!(report.frames >= 1, "the crashing frame is always recorded");

    match signal {
        // Raised with raise(3)
        Signal::Abort | Signal::Sys => assert!(report.code <= 0),
        Signal::Segv | Signal::Bus | Signal::Illegal => assert!(report.code > 0),
        _ => {}
    }

    if signal == Signal::StackOverflow {
        assert!(
            report.overflow,
            "stack overflow not detected after {} frames",
            report.frames
        );
    }
}

pub fn run_test(signal: Signal, use_thread: bool) -> Outcome {
    let outcome = run_client(signal, use_thread);
    assert_outcome(&outcome, signal);
    outcome
}

pub fn run_threaded_test(signal: Signal, count: u32) {
    use rayon::prelude::*;

    (0..count).into_par_iter().for_each(|_| {
        run_test(signal, true);
    });
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_report() {
        assert_eq!(
            Report::parse("sentry: signal=11 code=1 frames=12 overflow=false"),
            Some(Report {
                signal: 11,
                code: 1,
                frames: 12,
                overflow: false,
            })
        );

        assert_eq!(
            Report::parse("sentry: signal=6 code=-6 frames=3 overflow=true"),
            Some(Report {
                signal: 6,
                code: -6,
                frames: 3,
                overflow: true,
            })
        );

        assert!(Report::parse("thread 'main' has overflowed its stack").is_none());
        assert!(Report::parse("sentry: signal=11").is_none());
        assert!(Report::parse("sentry: code=1 signal=11 frames=1 overflow=false").is_none());
    }
}
