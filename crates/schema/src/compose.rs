//! Structural validation of a compose manifest.
//!
//! Checks only the shape the engine needs to bring a project up: a YAML
//! mapping with a non-empty `services` mapping whose entries name an `image`
//! or a `build` context. Issues are reported with a dotted path.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

pub const COMPOSE_FILE: &str = "docker-compose.yml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub path: String,
    pub error: String,
    pub hint: Option<String>,
}

impl ValidationIssue {
    fn new(path: impl Into<String>, error: impl Into<String>, hint: Option<&str>) -> Self {
        Self { path: path.into(), error: error.into(), hint: hint.map(str::to_string) }
    }
}

pub fn compose_file(dir: &Path) -> PathBuf { dir.join(COMPOSE_FILE) }

/// Validate `<dir>/docker-compose.yml`. I/O failures are errors; shape problems are issues.
pub fn validate_dir(dir: &Path) -> Result<Vec<ValidationIssue>> {
    let path = compose_file(dir);
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    Ok(validate_yaml(&text))
}

/// Returns an empty list for a structurally valid manifest.
pub fn validate_yaml(yaml: &str) -> Vec<ValidationIssue> {
    let doc: Value = match serde_yaml::from_str(yaml) {
        Ok(v) => v,
        Err(e) => return vec![ValidationIssue::new("", format!("YAML parse error: {e}"), Some("check indentation and syntax"))],
    };
    let Value::Mapping(root) = doc else {
        return vec![ValidationIssue::new("", "top level must be a mapping", None)];
    };
    let services = match root.get("services") {
        Some(Value::Mapping(m)) => m,
        Some(_) => return vec![ValidationIssue::new("services", "must be a mapping", None)],
        None => return vec![ValidationIssue::new("services", "required property missing", Some("declare at least one service"))],
    };
    if services.is_empty() {
        return vec![ValidationIssue::new("services", "no services declared", Some("declare at least one service"))];
    }
    let mut issues = Vec::new();
    for (key, svc) in services {
        let name = match key {
            Value::String(s) => s.clone(),
            other => format!("{other:?}"),
        };
        let path = format!("services.{name}");
        match svc {
            Value::Mapping(m) if m.contains_key("image") || m.contains_key("build") => {}
            Value::Mapping(_) => issues.push(ValidationIssue::new(path, "service needs `image` or `build`", Some("missing required field"))),
            _ => issues.push(ValidationIssue::new(path, "service must be a mapping", Some("mismatched type"))),
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_manifest_has_no_issues() {
        let y = "services:\n  web:\n    image: nginx\n  api:\n    build: .\n";
        assert!(validate_yaml(y).is_empty());
    }

    #[test]
    fn reports_shape_problems() {
        assert_eq!(validate_yaml("- a\n- b\n")[0].error, "top level must be a mapping");
        assert_eq!(validate_yaml("version: '3'\n")[0].path, "services");
        assert_eq!(validate_yaml("services: {}\n")[0].error, "no services declared");
        let issues = validate_yaml("services:\n  web:\n    ports: ['80:80']\n  db: 3\n");
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].path, "services.web");
        assert_eq!(issues[1].path, "services.db");
        assert!(validate_yaml("services: [\n")[0].error.starts_with("YAML parse error"));
    }

    #[test]
    fn validate_dir_reads_compose_file() {
        let dir = tempfile::tempdir().expect("tmp");
        assert!(validate_dir(dir.path()).is_err());
        std::fs::write(compose_file(dir.path()), "services:\n  web:\n    image: nginx\n").expect("write");
        assert!(validate_dir(dir.path()).expect("ok").is_empty());
    }
}
