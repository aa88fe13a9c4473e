fn main() {
    // Rerun when git HEAD moves (commit, checkout, etc.)
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let described = std::process::Command::new("git")
        .args(["describe", "--always", "--dirty", "--tags"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string());

    // Builds from a source tarball have no repository to describe.
    let version = described.unwrap_or_else(|| concat!("v", env!("CARGO_PKG_VERSION")).to_string());
    println!("cargo:rustc-env=GIT_VERSION={version}");
}
