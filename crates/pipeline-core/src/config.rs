//! Per-stage configuration loading.
//!
//! Each stage owns a YAML file under the config directory
//! (`stageN_<name>.yaml`). Environment variables of the form
//! `ORBIT_ENGINE_STAGE{N}_PARENT___CHILD___KEY` override nested keys, with
//! triple underscore as the path separator. Override values are coerced in
//! order: bool, integer, float, string. The override layer is applied to
//! the raw YAML value tree before typed deserialization, so any nested key
//! a stage config declares is overridable without extra plumbing.

use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::context::RuntimeContext;
use crate::error::{PipelineError, Result};

/// Load a stage config: YAML file (optional, serde defaults apply when
/// absent) + environment overrides for that stage number.
pub fn load_stage_config<T>(ctx: &RuntimeContext, stage: u8, file_name: &str) -> Result<T>
where
    T: DeserializeOwned,
{
    let path = ctx.config_path(file_name);
    let mut tree: Value = if path.exists() {
        let text = std::fs::read_to_string(&path)?;
        serde_yaml::from_str(&text)
            .map_err(|e| PipelineError::Config(format!("{}: {e}", path.display())))?
    } else {
        debug!("config file {} absent, using defaults", path.display());
        Value::Mapping(Mapping::new())
    };

    apply_env_overrides(&mut tree, stage, std::env::vars());

    serde_yaml::from_value(tree)
        .map_err(|e| PipelineError::Config(format!("stage {stage} config: {e}")))
}

/// Apply `ORBIT_ENGINE_STAGE{N}_…` overrides from an iterator of
/// environment pairs. Exposed separately so tests can inject vars without
/// touching the process environment.
pub fn apply_env_overrides(
    tree: &mut Value,
    stage: u8,
    vars: impl Iterator<Item = (String, String)>,
) {
    let prefix = format!("ORBIT_ENGINE_STAGE{stage}_");
    for (name, raw) in vars {
        let Some(rest) = name.strip_prefix(&prefix) else {
            continue;
        };
        let segments: Vec<String> = rest
            .split("___")
            .map(|s| s.to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        if segments.is_empty() {
            continue;
        }
        debug!("override {} = {raw}", segments.join("."));
        insert_path(tree, &segments, coerce(&raw));
    }
}

/// Coercion order fixed as bool, int, float, string.
fn coerce(raw: &str) -> Value {
    let trimmed = raw.trim();
    match trimmed {
        "true" | "True" => return Value::Bool(true),
        "false" | "False" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        return Value::Number(serde_yaml::Number::from(f));
    }
    Value::String(trimmed.to_string())
}

fn insert_path(tree: &mut Value, segments: &[String], value: Value) {
    if !matches!(tree, Value::Mapping(_)) {
        *tree = Value::Mapping(Mapping::new());
    }
    let Value::Mapping(map) = tree else {
        return;
    };
    let key = Value::String(segments[0].clone());
    if segments.len() == 1 {
        map.insert(key, value);
        return;
    }
    let child = map
        .entry(key)
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    insert_path(child, &segments[1..], value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Demo {
        #[serde(default)]
        time_window: Window,
        #[serde(default = "default_workers")]
        max_workers: usize,
    }

    #[derive(Debug, Deserialize, Default)]
    struct Window {
        #[serde(default)]
        step_seconds: u64,
        #[serde(default)]
        point_count: usize,
    }

    fn default_workers() -> usize {
        30
    }

    #[test]
    fn test_env_override_nested_and_coerced() {
        let mut tree: Value = serde_yaml::from_str("time_window:\n  step_seconds: 30\n").unwrap();
        let vars = vec![
            (
                "ORBIT_ENGINE_STAGE2_TIME_WINDOW___POINT_COUNT".to_string(),
                "240".to_string(),
            ),
            (
                "ORBIT_ENGINE_STAGE2_MAX_WORKERS".to_string(),
                "8".to_string(),
            ),
            // Wrong stage number must be ignored.
            (
                "ORBIT_ENGINE_STAGE3_MAX_WORKERS".to_string(),
                "99".to_string(),
            ),
        ];
        apply_env_overrides(&mut tree, 2, vars.into_iter());

        let demo: Demo = serde_yaml::from_value(tree).unwrap();
        assert_eq!(demo.time_window.step_seconds, 30);
        assert_eq!(demo.time_window.point_count, 240);
        assert_eq!(demo.max_workers, 8);
    }

    #[test]
    fn test_coercion_order() {
        assert_eq!(coerce("true"), Value::Bool(true));
        assert_eq!(coerce("42"), Value::Number(42.into()));
        assert!(matches!(coerce("0.5"), Value::Number(_)));
        assert_eq!(coerce("WGS84"), Value::String("WGS84".into()));
    }
}
