// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Compiles the CUDA/OptiX device programs under `src/gpu/` to PTX.
//!
//! Requires `nvcc` on the PATH and `OPTIX_INSTALL_DIR` pointing at an
//! OptiX SDK. Without them the build still succeeds with empty PTX
//! placeholders so the CPU-only parts of the crate (and its tests)
//! remain usable; GPU entry points then report `NotInitialized`.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=src/gpu/nodeKernels.cu");
    println!("cargo:rerun-if-changed=src/gpu/optixPrograms.cu");
    println!("cargo:rerun-if-env-changed=OPTIX_INSTALL_DIR");

    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));
    let nvcc_available = Command::new("nvcc")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    let optix_include = env::var("OPTIX_INSTALL_DIR")
        .ok()
        .map(|dir| PathBuf::from(dir).join("include"))
        .filter(|p| p.exists());

    compile_or_stub(
        nvcc_available,
        &[],
        Path::new("src/gpu/nodeKernels.cu"),
        &out_dir.join("nodeKernels.ptx"),
    );

    match &optix_include {
        Some(include) if nvcc_available => {
            let flag = format!("-I{}", include.display());
            compile_or_stub(
                true,
                &[flag.as_str(), "--std=c++17"],
                Path::new("src/gpu/optixPrograms.cu"),
                &out_dir.join("optixPrograms.ptx"),
            );
        }
        _ => {
            if nvcc_available {
                println!(
                    "cargo:warning=OPTIX_INSTALL_DIR is not set or invalid; \
                     building without ray-casting device programs"
                );
            }
            stub(&out_dir.join("optixPrograms.ptx"));
        }
    }
}

fn compile_or_stub(nvcc_available: bool, extra_args: &[&str], src: &Path, dst: &Path) {
    if !nvcc_available {
        println!(
            "cargo:warning=nvcc not found; building without device programs ({})",
            src.display()
        );
        stub(dst);
        return;
    }

    let mut cmd = Command::new("nvcc");
    cmd.arg("-ptx")
        .arg("-lineinfo")
        .arg("--use_fast_math")
        .args(extra_args)
        .arg("-o")
        .arg(dst)
        .arg(src);

    match cmd.output() {
        Ok(output) if output.status.success() => {}
        Ok(output) => {
            println!(
                "cargo:warning=nvcc failed for {}: {}",
                src.display(),
                String::from_utf8_lossy(&output.stderr).replace('\n', " ")
            );
            stub(dst);
        }
        Err(err) => {
            println!("cargo:warning=cannot run nvcc: {}", err);
            stub(dst);
        }
    }
}

fn stub(dst: &Path) {
    fs::write(dst, "").expect("writing PTX placeholder");
}
