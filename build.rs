// build.rs - Build metadata for plantgraph
//
// Exposes the build timestamp and git commit to the crate through
// `option_env!`, see `plantgraph::build_info`.

use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=Cargo.toml");
    println!("cargo:rerun-if-changed=.git/HEAD");

    println!(
        "cargo:rustc-env=PLANTGRAPH_BUILD_TIMESTAMP={}",
        chrono::Utc::now().to_rfc3339()
    );

    let git_hash = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    if let Some(hash) = git_hash {
        println!("cargo:rustc-env=PLANTGRAPH_GIT_HASH={}", hash);
    }
}
