#![forbid(unsafe_code)]

// Git values fall back to "unknown" when building outside a git checkout.
fn main() {
    set_env("GIT_BRANCH", build_data::get_git_branch());
    set_env("GIT_COMMIT_SHORT", build_data::get_git_commit_short());
    set_env("GIT_DIRTY", build_data::get_git_dirty().map(|d| d.to_string()));
    set_env("SOURCE_TIMESTAMP", build_data::get_source_time().map(build_data::format_timestamp)); // Using BUILD_TIMESTAMP makes build unreproducible.
    build_data::set_RUSTC_VERSION();

    // Tells cargo not to rebuild build.rs during debug builds when other files change.
    // This speeds up development builds.
    //build_data::no_debug_rebuilds();
}

fn set_env(name: &str, value: Result<String, String>) {
    let value = value.unwrap_or_else(|_| "unknown".to_string());
    println!("cargo:rustc-env={}={}", name, value);
}
