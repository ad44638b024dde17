//! Workflow file loading: parse (YAML or JSON), schema check, reference check.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::workflow::{Workflow, validate_workflow};
use crate::error::FleetError;

const WORKFLOW_SCHEMA: &str = include_str!("../../schemas/workflow.v1.schema.json");
const EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

/// Load and validate a workflow file.
///
/// Every failure past reading the file (syntax, schema, dangling guard or
/// state references) is a [`FleetError::Config`].
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_workflow(path: &Path) -> Result<Workflow> {
    let contents =
        fs::read_to_string(path).map_err(|err| config_err(path, &format!("read: {err}")))?;
    let value = parse_document(path, &contents)?;
    validate_schema(path, &value)?;
    let workflow: Workflow = serde_json::from_value(value)
        .map_err(|err| config_err(path, &format!("deserialize: {err}")))?;
    let errors = validate_workflow(&workflow);
    if !errors.is_empty() {
        return Err(config_err(path, &errors.join("; ")));
    }
    debug!(
        workflow = %workflow.name,
        states = workflow.states.len(),
        guards = workflow.guards.len(),
        "workflow loaded"
    );
    Ok(workflow)
}

/// Resolve `name` to `<dir>/<name>.yaml|.yml|.json`, first match wins.
pub fn find_workflow(dir: &Path, name: &str) -> Result<PathBuf> {
    EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{name}.{ext}")))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| {
            FleetError::config(format!("workflow '{name}' not found in {}", dir.display())).into()
        })
}

fn parse_document(path: &Path, contents: &str) -> Result<Value> {
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        serde_json::from_str(contents).map_err(|err| config_err(path, &format!("parse json: {err}")))
    } else {
        serde_yaml::from_str(contents).map_err(|err| config_err(path, &format!("parse yaml: {err}")))
    }
}

fn validate_schema(path: &Path, value: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(WORKFLOW_SCHEMA).context("parse workflow schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    let messages: Vec<String> = compiled
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(config_err(
            path,
            &format!("schema validation failed: {}", messages.join("; ")),
        ));
    }
    Ok(())
}

fn config_err(path: &Path, message: &str) -> anyhow::Error {
    FleetError::config(format!("workflow {}: {message}", path.display())).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_config_error;

    const REVIEW_YAML: &str = r#"
name: review
initial: queued
states:
  queued:
    next: Build
  Build:
    guards: [unit_tests]
    on_pass: Review
    on_fail: Quarantine
  Review: {}
  Quarantine: {}
guards:
  unit_tests: "true"
"#;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).expect("write workflow");
        path
    }

    #[test]
    fn loads_yaml_workflow() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(temp.path(), "review.yaml", REVIEW_YAML);
        let workflow = load_workflow(&path).expect("load");
        assert_eq!(workflow.name, "review");
        assert_eq!(workflow.states["Build"].guards, vec!["unit_tests"]);
        assert_eq!(workflow.guards["unit_tests"].command(), "true");
    }

    #[test]
    fn loads_json_workflow_with_detailed_guard() {
        let temp = tempfile::tempdir().expect("tempdir");
        let raw = r#"{
            "name": "ci",
            "initial": "Build",
            "states": {"Build": {"guards": ["t"], "on_pass": "Done"}, "Done": {}},
            "guards": {"t": {"cmd": "make test", "timeout_secs": 30}}
        }"#;
        let path = write(temp.path(), "ci.json", raw);
        let workflow = load_workflow(&path).expect("load");
        assert_eq!(workflow.guards["t"].timeout_secs(), Some(30));
    }

    #[test]
    fn undeclared_guard_is_config_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let broken = REVIEW_YAML.replace("guards: [unit_tests]", "guards: [unit_tests, lint]");
        let path = write(temp.path(), "review.yaml", &broken);
        let err = load_workflow(&path).unwrap_err();
        assert!(is_config_error(&err));
        assert!(err.to_string().contains("undeclared guard 'lint'"));
    }

    #[test]
    fn undeclared_next_state_is_config_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let broken = REVIEW_YAML.replace("on_pass: Review", "on_pass: Shipped");
        let path = write(temp.path(), "review.yaml", &broken);
        let err = load_workflow(&path).unwrap_err();
        assert!(is_config_error(&err));
        assert!(err.to_string().contains("Shipped"));
    }

    #[test]
    fn unknown_state_key_fails_schema() {
        let temp = tempfile::tempdir().expect("tempdir");
        let broken = REVIEW_YAML.replace("on_fail: Quarantine", "on_error: Quarantine");
        let path = write(temp.path(), "review.yaml", &broken);
        let err = load_workflow(&path).unwrap_err();
        assert!(is_config_error(&err));
        assert!(err.to_string().contains("schema validation failed"));
    }

    #[test]
    fn find_workflow_prefers_yaml() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), "review.json", "{}");
        write(temp.path(), "review.yaml", REVIEW_YAML);
        let found = find_workflow(temp.path(), "review").expect("find");
        assert!(found.ends_with("review.yaml"));
        assert!(find_workflow(temp.path(), "missing").is_err());
    }
}
