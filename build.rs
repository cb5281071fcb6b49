fn main() {
    // CoreBluetooth refuses to scan from a binary without an embedded
    // Info.plist carrying NSBluetoothAlwaysUsageDescription.  Command-line
    // tools get one by linking the plist into the `__TEXT,__info_plist`
    // section.  `CARGO_CFG_TARGET_OS` is the target, so cross builds work.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("macos") {
        return;
    }
    let Ok(dir) = std::env::var("CARGO_MANIFEST_DIR") else {
        return;
    };
    let plist = format!("{dir}/Info.plist");

    // Only the gateway binary talks to the radio; test and bench targets
    // link without the section.
    for arg in ["-sectcreate", "__TEXT", "__info_plist", &plist] {
        println!("cargo:rustc-link-arg-bins={arg}");
    }
    println!("cargo:rerun-if-changed=Info.plist");
}
