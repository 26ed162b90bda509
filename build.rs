use std::env;
use std::path::Path;
use std::path::PathBuf;

fn main() {
    // override EVQ_SYS_PATH, defaulting to the loom backend when the loom
    // feature is enabled (build scripts see features as env vars, not cfgs)
    println!("cargo:rerun-if-env-changed=EVQ_SYS_PATH");
    let mut sys_path = env::var_os("EVQ_SYS_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            if env::var_os("CARGO_FEATURE_LOOM").is_some() {
                PathBuf::from("sys/loom.rs")
            } else {
                PathBuf::from("sys/std.rs")
            }
        });
    // convert from crate relative, include! resolves relative to src/
    if sys_path.is_relative() {
        sys_path = Path::new("..").join(sys_path);
    }
    println!("cargo:rustc-env=EVQ_SYS_PATH={}", sys_path.display());
    println!("cargo:rerun-if-changed=sys");
}
