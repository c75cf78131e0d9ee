use std::process::Command;

fn git_describe() -> Option<String> {
    let out = Command::new("git").args(["describe", "--always", "--dirty", "--tags"]).output().ok()?;
    if !out.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

fn main() {
    // Stamped into every job manifest
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
    let version = git_describe().unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=GIT_VERSION={}", version);
}
