//! Embeds the git revision so the service can log which build is running

use std::process::Command;

fn git_short_hash() -> Option<String> {
    let out = Command::new("git").args(["rev-parse", "--short", "HEAD"]).output().ok()?;
    if !out.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

fn main() {
    let rev = git_short_hash().unwrap_or_else(|| String::from("unknown"));
    println!("cargo:rustc-env=GIT_HASH={}", rev);
    println!("cargo:rerun-if-changed=.git/HEAD");
}
