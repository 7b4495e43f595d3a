use std::fs;
use std::path::{Path, PathBuf};

fn collect_rust_files(root: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_rust_files(&path, out);
            continue;
        }
        if path.extension().and_then(|s| s.to_str()) == Some("rs") {
            out.push(path);
        }
    }
}

/// `(relative path, line number, trimmed line)` for non-test source lines
fn production_lines() -> Vec<(String, usize, String)> {
    let repo_root = Path::new(env!("CARGO_MANIFEST_DIR"));
    let mut files = Vec::new();
    collect_rust_files(&repo_root.join("src"), &mut files);

    let mut lines = Vec::new();
    for file in files {
        let rel = file
            .strip_prefix(repo_root)
            .unwrap_or(&file)
            .to_string_lossy()
            .replace('\\', "/");
        let content = fs::read_to_string(&file).unwrap_or_default();
        for (idx, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed == "#[cfg(test)]" {
                break;
            }
            lines.push((rel.clone(), idx + 1, trimmed.to_string()));
        }
    }
    lines
}

fn offenders<F>(allowed: &[&str], matches: F) -> Vec<String>
where
    F: Fn(&str) -> bool,
{
    production_lines()
        .into_iter()
        .filter(|(_, _, line)| !line.starts_with("//") && matches(line))
        .filter(|(rel, _, _)| !allowed.iter().any(|a| rel.starts_with(a)))
        .map(|(rel, n, line)| format!("{rel}:{n}: {line}"))
        .collect()
}

#[test]
fn venue_submissions_go_through_the_gateway() {
    let found = offenders(&["src/exchange/gateway.rs"], |line| {
        line.contains(".submit_order(")
    });
    assert!(
        found.is_empty(),
        "venue submit call outside the exchange gateway:\n{}",
        found.join("\n")
    );
}

#[test]
fn kill_switch_has_a_single_writer() {
    let found = offenders(&["src/risk/governor.rs", "src/persistence/"], |line| {
        line.contains(".set_kill_switch_state(")
    });
    assert!(
        found.is_empty(),
        "kill switch written outside the risk governor:\n{}",
        found.join("\n")
    );
}

#[test]
fn allocations_are_written_only_at_startup_reload_and_close() {
    let found = offenders(
        &[
            "src/coordinator/engine.rs",
            "src/strategy/runtime.rs",
            "src/strategy/reconciliation.rs",
            "src/persistence/",
        ],
        |line| line.contains(".put_allocation(") || line.contains("update_allocation("),
    );
    assert!(
        found.is_empty(),
        "allocation written outside startup, reload or position close:\n{}",
        found.join("\n")
    );
}
