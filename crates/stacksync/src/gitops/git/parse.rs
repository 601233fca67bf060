//! Parsing of git (and other CLI) output.

use std::process::Output;

/// Message for a failed command: stderr if any, else stdout, else the exit status.
pub fn failure_message(output: &Output) -> String {
    [&output.stderr, &output.stdout]
        .into_iter()
        .map(|bytes| String::from_utf8_lossy(bytes).trim().to_string())
        .find(|text| !text.is_empty())
        .unwrap_or_else(|| match output.status.code() {
            Some(code) => format!("exited with status {}", code),
            None => "terminated by signal".to_string(),
        })
}

/// Parses `git ls-tree --name-only` output into paths.
pub fn parse_ls_tree(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Reads a commit sha from `git rev-parse` output.
///
/// Returns `None` unless the output is a full hex object name.
pub fn parse_commit_sha(stdout: &str) -> Option<String> {
    let sha = stdout.lines().next()?.trim();
    let valid = (sha.len() == 40 || sha.len() == 64) && sha.chars().all(|c| c.is_ascii_hexdigit());
    valid.then(|| sha.to_string())
}
