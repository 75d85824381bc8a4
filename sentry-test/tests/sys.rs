use sentry_test::*;

#[test]
fn sys_simple() {
    run_test(Signal::Sys, false);
}

#[test]
fn sys_threaded() {
    run_threaded_test(Signal::Sys, 8);
}
