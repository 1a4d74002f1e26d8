use std::env;
use std::path::Path;
use std::process::Command;

use chrono::Utc;

const OVERRIDE_VAR: &str = "STARLIGHT_BUILD_ID_OVERRIDE";

fn main() {
    println!("cargo:rerun-if-env-changed={OVERRIDE_VAR}");
    watch_git_head();

    let stamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let revision = git_revision().unwrap_or_else(|| "nogit".to_string());
    let build_id = env::var(OVERRIDE_VAR)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| format!("{revision}@{stamp}"));

    println!("cargo:rustc-env=STARLIGHT_BUILD_ID={build_id}");
    println!("cargo:rustc-env=STARLIGHT_BUILD_STAMP={stamp}");
    println!("cargo:rustc-env=STARLIGHT_BUILD_REVISION={revision}");
}

/// Rebuild when the checked-out ref moves, so the revision label stays honest.
fn watch_git_head() {
    let head = Path::new(".git/HEAD");
    if !head.exists() {
        return;
    }
    println!("cargo:rerun-if-changed={}", head.display());
    if let Ok(contents) = std::fs::read_to_string(head) {
        if let Some(reference) = contents.trim().strip_prefix("ref: ") {
            let target = Path::new(".git").join(reference);
            if target.exists() {
                println!("cargo:rerun-if-changed={}", target.display());
            }
        }
    }
}

fn git_revision() -> Option<String> {
    let output = Command::new("git")
        .args(["describe", "--always", "--dirty", "--abbrev=10"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let label = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!label.is_empty()).then_some(label)
}
