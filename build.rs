fn main() {
    // Emit the ESP-IDF link configuration only when cross-compiling for the
    // chip; host builds (tests, simulation) need none of it.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();
    }
}
