use sentry_test::*;

#[test]
fn trap_simple() {
    run_test(Signal::Trap, false);
}

#[test]
fn trap_threaded() {
    run_threaded_test(Signal::Trap, 8);
}
