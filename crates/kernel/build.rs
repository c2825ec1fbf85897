fn main() {
    let arch = std::env::var("CARGO_CFG_TARGET_ARCH").expect("target arch is set by cargo");
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").expect("manifest dir is set by cargo");
    let script_path = std::path::Path::new(&manifest_dir).join(format!("linker-{}.ld", arch));

    // Host builds (tests, tooling) link normally.
    if script_path.exists() {
        println!("cargo:rustc-link-arg-bins=-T{}", script_path.display());
    }
    println!("cargo:rerun-if-changed={}", script_path.display());
}
