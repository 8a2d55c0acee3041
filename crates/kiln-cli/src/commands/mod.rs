pub mod build;
pub mod plan;
pub mod squash;

use indicatif::{ProgressBar, ProgressStyle};
use kiln_core::{BuildConfig, CoreError};
use kiln_schema::{parse_manifest_file, Manifest};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_MANIFEST_ERROR: u8 = 2;
pub const EXIT_DAEMON_ERROR: u8 = 3;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_outcome(outcome: &str) -> String {
    use console::Style;
    match outcome {
        "built" => Style::new().green().apply_to(outcome).to_string(),
        "failed" => Style::new().red().bold().apply_to(outcome).to_string(),
        "skipped" => Style::new().dim().apply_to(outcome).to_string(),
        other => other.to_owned(),
    }
}

/// Config file if given, otherwise defaults.
pub fn load_config(path: Option<&Path>) -> Result<BuildConfig, String> {
    match path {
        Some(path) => BuildConfig::load(path).map_err(|e| e.to_string()),
        None => Ok(BuildConfig::default()),
    }
}

pub fn load_manifest(config: &BuildConfig) -> Result<Manifest, String> {
    let options = config.load_options().map_err(|e| e.to_string())?;
    parse_manifest_file(&config.manifest_path(), &options)
        .map_err(|e| CoreError::from(e).to_string())
}

/// Parse repeated `KEY=VALUE` arguments.
pub fn parse_pairs(pairs: &[String]) -> Result<BTreeMap<String, String>, String> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
            _ => Err(format!("expected KEY=VALUE, got '{pair}'")),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_pretty_serializes_object() {
        let val = serde_json::json!({"key": "value"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"key\""));
        assert!(result.contains("\"value\""));
    }

    #[test]
    fn colorize_outcome_keeps_text() {
        for outcome in ["built", "failed", "skipped"] {
            assert!(colorize_outcome(outcome).contains(outcome));
        }
        assert_eq!(colorize_outcome("other"), "other");
    }

    #[test]
    fn pairs_parsed() {
        let parsed = parse_pairs(&["A=1".to_owned(), "B=x=y".to_owned(), "C=".to_owned()]).unwrap();
        assert_eq!(parsed["A"], "1");
        assert_eq!(parsed["B"], "x=y");
        assert_eq!(parsed["C"], "");
        assert!(parse_pairs(&["novalue".to_owned()]).is_err());
        assert!(parse_pairs(&["=1".to_owned()]).is_err());
    }

    #[test]
    fn load_config_defaults_without_file() {
        let config = load_config(None).unwrap();
        assert_eq!(config.build_file, "build.yml");
    }

    #[test]
    fn manifest_errors_are_prefixed() {
        let dir = tempfile::tempdir().unwrap();
        let config = BuildConfig {
            workdir: dir.path().to_path_buf(),
            ..BuildConfig::default()
        };
        let err = load_manifest(&config).unwrap_err();
        assert!(err.starts_with("manifest error:"), "{err}");
    }

    #[test]
    fn exit_codes_are_distinct() {
        assert_ne!(EXIT_SUCCESS, EXIT_FAILURE);
        assert_ne!(EXIT_FAILURE, EXIT_MANIFEST_ERROR);
        assert_ne!(EXIT_MANIFEST_ERROR, EXIT_DAEMON_ERROR);
    }

    #[test]
    fn spinner_finishes() {
        let pb = spinner("testing...");
        spin_ok(&pb, "done");
        let pb = spinner("testing...");
        spin_fail(&pb, "failed");
    }
}
