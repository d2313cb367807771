fn main() {
    let target = std::env::var("TARGET").unwrap_or_default();
    if target.starts_with("riscv64") {
        let dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
        println!("cargo:rustc-link-arg-bin=oxbow-kernel=-T{dir}/kernel.ld");
        println!("cargo:rerun-if-changed=kernel.ld");
    }
}
