use std::env;
use std::path::Path;
use std::process::Command;

fn main() {
    let label = resolve_version_label();
    let git_sha = resolve_git_sha();
    let build_time = resolve_build_time();

    println!("cargo:rustc-env=SSHPILOT_VERSION_LABEL={label}");
    println!("cargo:rustc-env=SSHPILOT_GIT_SHA={git_sha}");
    println!("cargo:rustc-env=SSHPILOT_BUILD_TIME={build_time}");

    println!("cargo:rerun-if-env-changed=SSHPILOT_VERSION_LABEL");
    println!("cargo:rerun-if-env-changed=SSHPILOT_BUILD_TIME");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
}

fn resolve_version_label() -> String {
    env::var("SSHPILOT_VERSION_LABEL")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "0.0.0".to_string()))
}

fn resolve_git_sha() -> String {
    if let Ok(value) = env::var("GITHUB_SHA") {
        return normalize_git_sha(&value);
    }

    if !Path::new(".git").exists() {
        return String::new();
    }

    let Some(mut sha) = git_output(&["rev-parse", "--short", "HEAD"]) else {
        return String::new();
    };
    let dirty = env::var("SSHPILOT_GIT_DIRTY")
        .ok()
        .and_then(|value| parse_bool(&value))
        .unwrap_or_else(|| {
            git_output(&["status", "--porcelain"]).is_some_and(|s| !s.trim().is_empty())
        });
    if dirty {
        sha.push_str("-dirty");
    }
    sha
}

fn normalize_git_sha(value: &str) -> String {
    value.trim().chars().take(7).collect()
}

fn resolve_build_time() -> String {
    if let Ok(value) = env::var("SSHPILOT_BUILD_TIME")
        && !value.trim().is_empty()
    {
        return value;
    }
    if let Ok(value) = env::var("SOURCE_DATE_EPOCH")
        && let Ok(epoch) = value.trim().parse::<i64>()
        && let Ok(dt) = time::OffsetDateTime::from_unix_timestamp(epoch)
        && let Ok(text) = dt.format(&time::format_description::well_known::Rfc3339)
    {
        return text;
    }

    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn git_output(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let value = text.trim();
    (!value.is_empty()).then(|| value.to_string())
}
