use std::env;
use std::path::PathBuf;

fn main() {
    let manifest = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());

    // Guest images are embedded via include_bytes!; the stub payloads ship
    // with the repository and real images are dropped in per build.
    for (var, default) in [
        ("PAYLOAD_MICRO", "payloads/guest_micro.bin"),
        ("PAYLOAD_MAIN", "payloads/guest_main.bin"),
    ] {
        let path = env::var(var).unwrap_or_else(|_| manifest.join(default).display().to_string());
        println!("cargo:rustc-env={var}={path}");
        println!("cargo:rerun-if-env-changed={var}");
        println!("cargo:rerun-if-changed={path}");
    }

    println!(
        "cargo:rustc-link-arg=-T{}",
        manifest.join("loader.ld").display()
    );
    println!("cargo:rerun-if-changed=loader.ld");
}
