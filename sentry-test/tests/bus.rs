use sentry_test::*;

#[test]
fn bus_simple() {
    let outcome = run_test(Signal::Bus, false);

    let report = outcome.report.as_ref().unwrap();
    assert!(report.frames > 2, "{report:?}");

    // The mapped file is unlinked before the crash
    let pid = outcome.pid.expect("crash-client didn't print its pid");
    assert!(!sadness_generator::bus_file_path(pid).exists());
}

#[test]
fn bus_threaded() {
    run_threaded_test(Signal::Bus, 8);
}
