
#[test]
fn handles_illegal() {
    shared::handles_crash(shared::SadnessFlavor::Illegal);
}
