//! Dockerfile text transformations applied before a step's image build.

use crate::CoreError;
use std::collections::BTreeMap;

fn is_from_line(line: &str) -> bool {
    line.trim_start()
        .split_whitespace()
        .next()
        .is_some_and(|word| word.eq_ignore_ascii_case("FROM"))
}

/// The `AS <alias>` stage name of a FROM line, if any.
fn stage_alias(line: &str) -> Option<&str> {
    if !is_from_line(line) {
        return None;
    }
    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        [.., keyword, alias] if words.len() >= 4 && keyword.eq_ignore_ascii_case("AS") => {
            Some(*alias)
        }
        _ => None,
    }
}

/// Point every FROM that names a step of this build at that step's
/// run-qualified image.
///
/// `images` maps step names to unique image names. Flags such as
/// `--platform=...` and a trailing `AS alias` are kept; indentation is
/// normalized. A Dockerfile without any FROM is rejected.
pub fn rewrite_from(text: &str, images: &BTreeMap<String, String>) -> Result<String, CoreError> {
    let mut found = false;
    let mut out = String::with_capacity(text.len());

    for line in text.lines() {
        if !is_from_line(line) {
            out.push_str(line);
            out.push('\n');
            continue;
        }
        found = true;

        let mut words: Vec<&str> = line.split_whitespace().collect();
        if let Some(pos) = words.iter().skip(1).position(|w| !w.starts_with("--")) {
            let pos = pos + 1;
            if let Some(image) = images.get(words[pos]) {
                words[pos] = image.as_str();
            }
        }
        out.push_str(&words.join(" "));
        out.push('\n');
    }

    if found {
        Ok(out)
    } else {
        Err(CoreError::Dockerfile("no FROM found in Dockerfile".to_owned()))
    }
}

/// Keep only the text up to the end of build stage `target`.
///
/// Everything before the target's FROM is kept too, since earlier stages may
/// be copied from. Cutting happens at the next FROM line that names a stage.
pub fn read_to_target(text: &str, target: &str) -> Result<String, CoreError> {
    let mut out = String::with_capacity(text.len());
    let mut in_target = false;

    for line in text.lines() {
        if let Some(alias) = stage_alias(line) {
            if in_target {
                return Ok(out);
            }
            in_target = alias == target;
        }
        out.push_str(line);
        out.push('\n');
    }

    if in_target {
        Ok(out)
    } else {
        Err(CoreError::Dockerfile(format!(
            "build target \"{target}\" does not exist in Dockerfile"
        )))
    }
}
