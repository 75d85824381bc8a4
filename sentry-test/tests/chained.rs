//! The sentry never swallows a crash, the process always dies from the signal
//! it raised, after the crash has been reported
use sentry_test::*;

#[test]
fn report_precedes_death() {
    for signal in [Signal::Segv, Signal::Abort, Signal::Trap] {
        let outcome = run_client(signal, false);
        assert_outcome(&outcome, signal);

        let report_line = outcome
            .stderr
            .lines()
            .position(|line| line.starts_with(REPORT_PREFIX));
        assert!(report_line.is_some());
        assert!(!outcome.stderr.contains("error:"), "{}", outcome.stderr);
    }
}
