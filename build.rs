use std::process::Command;

fn main() {
    println!("cargo:rerun-if-env-changed=GIT_COMMIT");
    println!("cargo:rerun-if-changed=.git/HEAD");

    // An explicit GIT_COMMIT from the release pipeline takes precedence.
    if std::env::var("GIT_COMMIT").is_ok() {
        return;
    }

    let output = Command::new("git")
        .args(["rev-parse", "--short=12", "HEAD"])
        .output();

    match output {
        Ok(out) if out.status.success() => {
            let commit = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if !commit.is_empty() {
                println!("cargo:rustc-env=GIT_COMMIT={commit}");
            }
        }
        Ok(_) | Err(_) => {
            println!("cargo:warning=git commit unavailable, version will report unknown");
        }
    }
}
