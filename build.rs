// SPDX-License-Identifier: GPL-3.0-only

use std::process::Command;

fn main() {
    println!("cargo::rerun-if-changed=.git/HEAD");
    println!("cargo::rerun-if-changed=.git/refs/tags");
    println!("cargo::rerun-if-env-changed=STILLCAM_VERSION");

    // Packagers may pin the version (no .git in release tarballs)
    let version = std::env::var("STILLCAM_VERSION").unwrap_or_else(|_| git_version());
    println!("cargo::rustc-env=GIT_VERSION={}", version);
}

/// `0.1.0-abcdef1` on a tag, `0.1.0-dirty-abcdef1` after it,
/// the crate version when git is unavailable
fn git_version() -> String {
    let package = env!("CARGO_PKG_VERSION").to_string();
    let Some(hash) = git(&["rev-parse", "--short", "HEAD"]) else {
        return package;
    };

    match git(&["describe", "--tags", "--match", "v*"]) {
        Some(described) => {
            let described = described.strip_prefix('v').unwrap_or(&described);
            // "<tag>-<commits>-g<hash>" when HEAD is past the tag
            let parts: Vec<&str> = described.rsplitn(3, '-').collect();
            if parts.len() == 3 {
                format!("{}-dirty-{}", parts[2], hash)
            } else {
                format!("{}-{}", described, hash)
            }
        }
        None => format!("{}-{}", package, hash),
    }
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
}
