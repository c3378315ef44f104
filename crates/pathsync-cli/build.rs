use std::process::Command;

fn git_stdout(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let sha = git_stdout(&["rev-parse", "--short=10", "HEAD"]).unwrap_or_else(|| "unknown".into());
    // Untracked files count as dirty too.
    let dirty = match git_stdout(&["status", "--porcelain"]) {
        Some(changes) if changes.is_empty() => "",
        Some(_) => ".dirty",
        None => "",
    };

    println!("cargo:rustc-env=PATHSYNC_GIT_SHA={sha}");
    println!("cargo:rustc-env=PATHSYNC_GIT_DIRTY={dirty}");
}
