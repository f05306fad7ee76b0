//! Generate `include/mk_ffi.h` from the `extern "C"` surface.

use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=src");

    let crate_dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => return,
    };
    let header = crate_dir.join("include").join("mk_ffi.h");

    let config = cbindgen::Config {
        language: cbindgen::Language::C,
        include_guard: Some("MK_FFI_H".to_string()),
        cpp_compat: true,
        documentation: true,
        ..Default::default()
    };

    // A missing header must not break the Rust build itself.
    match cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_config(config)
        .generate()
    {
        Ok(bindings) => {
            bindings.write_to_file(&header);
        }
        Err(err) => println!("cargo:warning=cbindgen failed: {err}"),
    }
}
