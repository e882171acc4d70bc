use std::process::Command;

fn main() {
    let build_time = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let dirty = match git(&["diff", "--quiet", "--ignore-submodules"]) {
        Some(_) => "clean",
        None if git(&["rev-parse", "HEAD"]).is_some() => "dirty",
        None => "unknown",
    };

    let stamps = [
        ("BUILD_TIME", build_time.to_string()),
        ("GIT_COMMIT_HASH", git_or_unknown(&["rev-parse", "--short", "HEAD"])),
        ("GIT_BRANCH", git_or_unknown(&["rev-parse", "--abbrev-ref", "HEAD"])),
        ("GIT_DIRTY", dirty.to_string()),
    ];
    for (key, value) in stamps {
        println!("cargo:rustc-env={}={}", key, value);
    }

    for path in ["Cargo.toml", ".git/HEAD", ".git/index"] {
        println!("cargo:rerun-if-changed={}", path);
    }
}

/// Trimmed stdout of a successful git invocation.
fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn git_or_unknown(args: &[&str]) -> String {
    git(args)
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
