
#[test]
fn handles_fpe() {
    shared::handles_crash(shared::SadnessFlavor::DivideByZero);
}
