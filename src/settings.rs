use crate::error::BootError;
use crate::fsutil::write_atomic_text_file;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "settings.json".into());
    name.push(".bak");
    path.with_file_name(name)
}

// Strips comments and trailing commas outside strings.
pub fn strip_jsonc(input: &str) -> String {
    let mut without_comments = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    while let Some(ch) = chars.next() {
        if in_string {
            without_comments.push(ch);
            if ch == '\\' {
                if let Some(next) = chars.next() {
                    without_comments.push(next);
                }
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match (ch, chars.peek()) {
            ('"', _) => {
                in_string = true;
                without_comments.push(ch);
            }
            ('/', Some('/')) => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        without_comments.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        without_comments.push('\n');
                    }
                    if prev == '*' && skipped == '/' {
                        break;
                    }
                    prev = skipped;
                }
            }
            _ => without_comments.push(ch),
        }
    }

    let mut out = String::with_capacity(without_comments.len());
    let chars: Vec<char> = without_comments.chars().collect();
    let mut in_string = false;
    let mut idx = 0;
    while idx < chars.len() {
        let ch = chars[idx];
        if in_string {
            out.push(ch);
            if ch == '\\' && idx + 1 < chars.len() {
                idx += 1;
                out.push(chars[idx]);
            } else if ch == '"' {
                in_string = false;
            }
            idx += 1;
            continue;
        }
        if ch == '"' {
            in_string = true;
        } else if ch == ',' {
            let next = chars[idx + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                idx += 1;
                continue;
            }
        }
        out.push(ch);
        idx += 1;
    }
    out
}

pub fn parse_settings(text: &str) -> Result<Map<String, Value>, BootError> {
    let stripped = strip_jsonc(text);
    if stripped.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(&stripped)? {
        Value::Object(map) => Ok(map),
        _ => Err(BootError::Config(
            "editor settings file must contain a JSON object".to_string(),
        )),
    }
}

pub fn read_settings(path: &Path) -> Result<Map<String, Value>, BootError> {
    match fs::read_to_string(path) {
        Ok(text) => parse_settings(&text),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Map::new()),
        Err(err) => Err(err.into()),
    }
}

pub fn pending_keys(current: &Map<String, Value>, desired: &BTreeMap<String, Value>) -> Vec<String> {
    desired
        .iter()
        .filter(|(key, value)| current.get(key.as_str()) != Some(*value))
        .map(|(key, _)| key.clone())
        .collect()
}

fn render_settings(map: &Map<String, Value>) -> Result<String, BootError> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    map.serialize(&mut ser)?;
    let mut text = String::from_utf8_lossy(&buf).to_string();
    text.push('\n');
    Ok(text)
}

// The old file is copied to `.bak` before every overwrite.
pub fn apply_settings(
    path: &Path,
    desired: &BTreeMap<String, Value>,
) -> Result<Option<PathBuf>, BootError> {
    let mut current = read_settings(path)?;
    for (key, value) in desired {
        current.insert(key.clone(), value.clone());
    }
    let backup = if path.exists() {
        let backup = backup_path(path);
        fs::copy(path, &backup)?;
        Some(backup)
    } else {
        None
    };
    write_atomic_text_file(path, &render_settings(&current)?)?;
    Ok(backup)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn desired() -> BTreeMap<String, Value> {
        let mut map = BTreeMap::new();
        map.insert("dev.containers.dockerPath".to_string(), json!("podman"));
        map
    }

    #[test]
    fn strip_jsonc_removes_comments_and_trailing_commas() {
        let input = r#"{
    // editor look
    "editor.fontSize": 14, /* inline */
    "url": "https://example.test/a//b",
    "list": [1, 2,],
}"#;
        let parsed = parse_settings(input).unwrap();
        assert_eq!(parsed["editor.fontSize"], json!(14));
        assert_eq!(parsed["url"], json!("https://example.test/a//b"));
        assert_eq!(parsed["list"], json!([1, 2]));
    }

    #[test]
    fn strip_jsonc_keeps_escaped_quotes() {
        let parsed = parse_settings(r#"{"a": "say \"hi\", // not a comment"}"#).unwrap();
        assert_eq!(parsed["a"], json!("say \"hi\", // not a comment"));
    }

    #[test]
    fn parse_settings_rejects_non_object() {
        assert!(parse_settings("[1, 2]").is_err());
        assert!(parse_settings("").unwrap().is_empty());
    }

    #[test]
    fn pending_keys_reports_only_differences() {
        let current = parse_settings(r#"{"dev.containers.dockerPath": "docker"}"#).unwrap();
        assert_eq!(pending_keys(&current, &desired()), vec!["dev.containers.dockerPath"]);
        let current = parse_settings(r#"{"dev.containers.dockerPath": "podman"}"#).unwrap();
        assert!(pending_keys(&current, &desired()).is_empty());
    }

    #[test]
    fn apply_settings_creates_missing_file_without_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("User").join("settings.json");
        let backup = apply_settings(&path, &desired()).unwrap();
        assert!(backup.is_none());
        assert!(pending_keys(&read_settings(&path).unwrap(), &desired()).is_empty());
    }

    #[test]
    fn apply_settings_backs_up_and_preserves_other_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let original = "{\n    // mine\n    \"editor.fontSize\": 14,\n}\n";
        fs::write(&path, original).unwrap();

        let backup = apply_settings(&path, &desired()).unwrap().expect("backup");
        assert_eq!(backup, dir.path().join("settings.json.bak"));
        assert_eq!(fs::read_to_string(&backup).unwrap(), original);

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("    \"editor.fontSize\": 14"));
        let current = read_settings(&path).unwrap();
        assert_eq!(current["dev.containers.dockerPath"], json!("podman"));
        let keys: Vec<_> = current.keys().cloned().collect();
        assert_eq!(keys, vec!["editor.fontSize", "dev.containers.dockerPath"]);
    }
}
