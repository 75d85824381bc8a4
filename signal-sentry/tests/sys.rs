
#[test]
fn handles_sys() {
    shared::handles_crash(shared::SadnessFlavor::Sys);
}
