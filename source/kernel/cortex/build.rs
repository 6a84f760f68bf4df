// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

fn main() {
    println!("cargo:rerun-if-env-changed=CORTEX_LINKER_SCRIPT");
    println!("cargo:rerun-if-env-changed=LOG");
    println!("cargo:rerun-if-changed=linker.ld");
    let bare_metal = std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("none");
    if let Ok(script) = std::env::var("CORTEX_LINKER_SCRIPT") {
        println!("cargo:rustc-link-arg=-T{script}");
    } else if bare_metal {
        let dir = std::env::var("CARGO_MANIFEST_DIR").unwrap_or_default();
        println!("cargo:rustc-link-arg=-T{dir}/linker.ld");
    }
}
