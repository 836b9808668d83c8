use std::process::Command;

fn git(args: &[&str]) -> Option<String> {
    let o = Command::new("git").args(args).output().ok()?;
    if !o.status.success() {
        return None;
    }
    String::from_utf8(o.stdout).ok().map(|s| s.trim().to_string())
}

fn main() {
    // Source tarballs have no git metadata, use the crate version there.
    let version = git(&["describe", "--always", "--dirty"]).unwrap_or_else(|| {
        format!("{} (no git)", std::env::var("CARGO_PKG_VERSION").unwrap_or_default())
    });
    println!("cargo:rustc-env=VERSION={version}");

    if let Some(path) = git(&["rev-parse", "--path-format=relative", "--git-dir"]) {
        println!("cargo:rerun-if-changed={path}/HEAD");
        // default rerun paths get lost once any have been added.
        println!("cargo:rerun-if-changed=.");
    }
}
