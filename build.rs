use std::env;
use std::path::{Path, PathBuf};

/// Include directories reported by `pkg-config` for the RDMA userspace stack.
struct RdmaCoreLink {
    include_dirs: Vec<PathBuf>,
}

/// Link to the installed `librdmacm` and `libibverbs`.
///
/// Both libraries register themselves with `pkg-config` in rdma-core and
/// MLNX_OFED v5.x. `RDMA_CORE_LIB_DIR` overrides discovery for installations
/// that do not (e.g., MLNX_OFED v4.9-x LTS).
fn link_rdma_core() -> Result<RdmaCoreLink, String> {
    if let Ok(lib_dir) = env::var("RDMA_CORE_LIB_DIR") {
        println!("cargo:rustc-link-search=native={}", lib_dir);
        println!("cargo:rustc-link-lib=rdmacm");
        println!("cargo:rustc-link-lib=ibverbs");
        let include_dirs = env::var("RDMA_CORE_INCLUDE_DIR")
            .map(|dir| vec![PathBuf::from(dir)])
            .unwrap_or_default();
        return Ok(RdmaCoreLink { include_dirs });
    }

    let mut include_dirs = Vec::new();
    for (name, version) in [("librdmacm", "1.2.28"), ("libibverbs", "1.8.28")] {
        let lib = pkg_config::Config::new()
            .atleast_version(version)
            .statik(false)
            .probe(name)
            .map_err(|e| format!("cannot find {}: {}", name, e))?;
        include_dirs.extend(lib.include_paths);
    }
    Ok(RdmaCoreLink { include_dirs })
}

/// Build flow:
///
/// 1. Without the `verbs` feature, do nothing: only the software fabric is built.
/// 2. Otherwise, link to the installed RDMA userspace libraries.
/// 3. Generate bindings for `rdma_cma.h` and `verbs.h`.
fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    if env::var_os("CARGO_FEATURE_VERBS").is_none() {
        return;
    }

    // Refuse to compile on non-64-bit platforms.
    if cfg!(not(target_pointer_width = "64")) {
        panic!("`roce-session` currently only supports 64-bit platforms");
    }

    println!("cargo:rerun-if-changed=src/bindings/rdma.h");
    println!("cargo:rerun-if-env-changed=RDMA_CORE_LIB_DIR");
    println!("cargo:rerun-if-env-changed=RDMA_CORE_INCLUDE_DIR");

    let link = match link_rdma_core() {
        Ok(link) => link,
        Err(e) => panic!("the `verbs` feature requires librdmacm and libibverbs: {}", e),
    };
    gen_bindings(&link.include_dirs);
}

fn gen_bindings(include_dirs: &[PathBuf]) {
    let include_args = include_dirs.iter().map(|p| format!("-I{}", p.display()));
    let bindings = bindgen::builder()
        .clang_args(include_args)
        .header("src/bindings/rdma.h")
        .allowlist_function("rdma_.*")
        .allowlist_function("ibv_.*")
        .allowlist_type("rdma_.*")
        .allowlist_type("ibv_.*")
        .opaque_type("pthread_.*")
        .blocklist_type("in6_addr")
        .blocklist_type("sockaddr")
        .blocklist_type("sockaddr_in")
        .blocklist_type("sockaddr_in6")
        .blocklist_type("sockaddr_storage")
        .blocklist_type("timespec")
        .bitfield_enum("ibv_access_flags")
        .bitfield_enum("ibv_send_flags")
        .bitfield_enum("ibv_wc_flags")
        .constified_enum_module("ibv_wc_status")
        .constified_enum_module("ibv_wc_opcode")
        .constified_enum_module("ibv_wr_opcode")
        .constified_enum_module("ibv_qp_type")
        .constified_enum_module("rdma_cm_event_type")
        .constified_enum_module("rdma_port_space")
        .derive_copy(true)
        .derive_debug(false)
        .derive_default(true)
        .generate_comments(false)
        .layout_tests(false)
        .prepend_enum_name(false)
        .size_t_is_usize(true)
        .generate()
        .expect("failed to generate bindings");

    let out_dir = env::var_os("OUT_DIR").expect("OUT_DIR is set by cargo");
    let dest = Path::new(&out_dir).join("rdma_bindings.rs");
    bindings
        .write_to_file(dest)
        .expect("failed to write bindings");
}
