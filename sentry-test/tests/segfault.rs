use sentry_test::*;

#[test]
fn segfault_simple() {
    let outcome = run_test(Signal::Segv, false);

    // The fault, the closure raising it, real_main, main and the runtime
    // above it, all chained by frame pointers
    let report = outcome.report.unwrap();
    assert!(report.frames > 2, "{report:?}");
    assert!(!report.overflow);
}

#[test]
fn segfault_threaded() {
    run_threaded_test(Signal::Segv, 8);
}
