fn main() {
    // ESP-IDF environment is only needed for the firmware target; host builds and
    // tests of the workspace skip it
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();
    }
}
