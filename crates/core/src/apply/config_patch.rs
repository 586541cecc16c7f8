//! Structured edits to dependency manifests.
//!
//! JSON and TOML manifests are edited as documents: each key of the
//! patch's `changes` map is a dotted path to set, and a `null` value
//! removes the key. TOML is edited in place, so comments are kept.
//! `requirements.txt` and `go.mod` are edited line by line: the key is a
//! package/module name and the value its new version.

use serde_json::Value as JsonValue;
use toml_edit::{DocumentMut, Item, TableLike};
use tracing::debug;

use crate::errors::ChangeError;
use crate::models::{ConfigPatch, ConfigType};

/// Apply `patch` to the manifest text `current` and return the new text.
pub fn apply_config_patch(current: &str, patch: &ConfigPatch) -> Result<String, ChangeError> {
    debug!(
        path = %patch.path,
        config_type = %patch.config_type,
        keys = patch.changes.len(),
        "patching manifest"
    );
    match patch.config_type {
        ConfigType::PackageJson | ConfigType::Json => patch_json(current, patch),
        ConfigType::CargoToml | ConfigType::Toml => patch_toml(current, patch),
        ConfigType::RequirementsTxt => patch_requirements(current, patch),
        ConfigType::GoMod => patch_go_mod(current, patch),
    }
}

fn error(patch: &ConfigPatch, detail: impl Into<String>) -> ChangeError {
    ChangeError::ConfigPatch {
        path: patch.path.clone(),
        detail: detail.into(),
    }
}

fn split_key(key: &str) -> Vec<&str> {
    key.split('.').filter(|s| !s.is_empty()).collect()
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

fn patch_json(current: &str, patch: &ConfigPatch) -> Result<String, ChangeError> {
    let mut doc: JsonValue = if current.trim().is_empty() {
        JsonValue::Object(Default::default())
    } else {
        serde_json::from_str(current).map_err(|e| error(patch, format!("invalid JSON: {}", e)))?
    };

    for (key, value) in &patch.changes {
        let segments = split_key(key);
        set_json(&mut doc, &segments, value.clone()).map_err(|d| error(patch, d))?;
    }

    let mut out = serde_json::to_string_pretty(&doc).map_err(|e| error(patch, e.to_string()))?;
    out.push('\n');
    Ok(out)
}

fn set_json(doc: &mut JsonValue, segments: &[&str], value: JsonValue) -> Result<(), String> {
    let Some((last, parents)) = segments.split_last() else {
        return Err("empty key".into());
    };

    let mut node = doc;
    for seg in parents {
        let obj = node
            .as_object_mut()
            .ok_or_else(|| format!("'{}' is not inside an object", seg))?;
        node = obj
            .entry(seg.to_string())
            .or_insert_with(|| JsonValue::Object(Default::default()));
    }

    let obj = node
        .as_object_mut()
        .ok_or_else(|| format!("parent of '{}' is not an object", last))?;
    if value.is_null() {
        obj.remove(*last);
    } else {
        obj.insert(last.to_string(), value);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// TOML
// ---------------------------------------------------------------------------

/// Edits go through `toml_edit` so comments, key order and the user's
/// formatting survive.
fn patch_toml(current: &str, patch: &ConfigPatch) -> Result<String, ChangeError> {
    let mut doc: DocumentMut = current
        .parse()
        .map_err(|e: toml_edit::TomlError| error(patch, format!("invalid TOML: {}", e)))?;

    for (key, value) in &patch.changes {
        let segments = split_key(key);
        let Some((last, parents)) = segments.split_last() else {
            return Err(error(patch, "empty key"));
        };

        let mut table: &mut dyn TableLike = doc.as_table_mut();
        for seg in parents {
            if table.get(seg).is_none() {
                let mut fresh = toml_edit::Table::new();
                fresh.set_implicit(true);
                table.insert(seg, Item::Table(fresh));
            }
            table = table
                .get_mut(seg)
                .and_then(Item::as_table_like_mut)
                .ok_or_else(|| error(patch, format!("'{}' is not a table", seg)))?;
        }

        if value.is_null() {
            table.remove(last);
            continue;
        }

        let mut converted = json_to_toml(value).map_err(|e| {
            error(patch, format!("value for '{}' is not representable in TOML: {}", key, e))
        })?;
        // Keep a trailing comment such as `# keep pinned`.
        if let Some(previous) = table.get(last).and_then(Item::as_value) {
            *converted.decor_mut() = previous.decor().clone();
        }
        table.insert(last, Item::Value(converted));
    }

    Ok(doc.to_string())
}

fn json_to_toml(value: &JsonValue) -> Result<toml_edit::Value, String> {
    let converted = match value {
        JsonValue::Null => return Err("null is only allowed for a whole key".into()),
        JsonValue::Bool(b) => toml_edit::Value::from(*b),
        JsonValue::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => toml_edit::Value::from(i),
            (None, Some(f)) => toml_edit::Value::from(f),
            (None, None) => return Err(format!("number {} out of range", n)),
        },
        JsonValue::String(text) => toml_edit::Value::from(text.as_str()),
        JsonValue::Array(items) => {
            let mut array = toml_edit::Array::new();
            for item in items {
                array.push(json_to_toml(item)?);
            }
            toml_edit::Value::Array(array)
        }
        JsonValue::Object(map) => {
            let mut inline = toml_edit::InlineTable::new();
            for (k, v) in map {
                inline.insert(k.as_str(), json_to_toml(v)?);
            }
            toml_edit::Value::InlineTable(inline)
        }
    };
    Ok(converted)
}

// ---------------------------------------------------------------------------
// Line-based manifests
// ---------------------------------------------------------------------------

fn version_string(
    patch: &ConfigPatch,
    name: &str,
    value: &JsonValue,
) -> Result<Option<String>, ChangeError> {
    match value {
        JsonValue::Null => Ok(None),
        JsonValue::String(s) => Ok(Some(s.trim().to_string())),
        JsonValue::Number(n) => Ok(Some(n.to_string())),
        other => Err(error(
            patch,
            format!("version for '{}' must be a string, got {}", name, other),
        )),
    }
}

/// PEP 503 name normalisation.
fn normalize_py(name: &str) -> String {
    name.trim()
        .to_ascii_lowercase()
        .replace(['_', '.'], "-")
}

fn requirement_name(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('-') {
        return None;
    }
    let end = trimmed
        .find(|c: char| "=<>!~[; \t".contains(c))
        .unwrap_or(trimmed.len());
    Some(&trimmed[..end])
}

fn patch_requirements(current: &str, patch: &ConfigPatch) -> Result<String, ChangeError> {
    let mut lines: Vec<String> = current.lines().map(str::to_string).collect();

    for (name, value) in &patch.changes {
        let version = version_string(patch, name, value)?;
        let wanted = normalize_py(name);
        let pos = lines.iter().position(|l| {
            requirement_name(l).map(normalize_py).as_deref() == Some(wanted.as_str())
        });

        match (pos, version) {
            (Some(i), None) => {
                lines.remove(i);
            }
            (Some(i), Some(v)) => {
                let line = &lines[i];
                // Keep environment markers and trailing comments.
                let tail = line
                    .find(';')
                    .or_else(|| line.find(" #"))
                    .map(|p| line[..p].trim_end().len())
                    .map(|p| line[p..].to_string())
                    .unwrap_or_default();
                let original = requirement_name(line).unwrap_or(name).to_string();
                lines[i] = format!("{}=={}{}", original, v.trim_start_matches("=="), tail);
            }
            (None, Some(v)) => lines.push(format!("{}=={}", name, v.trim_start_matches("=="))),
            (None, None) => {}
        }
    }

    Ok(join_lines(&lines))
}

fn patch_go_mod(current: &str, patch: &ConfigPatch) -> Result<String, ChangeError> {
    let mut lines: Vec<String> = current.lines().map(str::to_string).collect();

    for (module, value) in &patch.changes {
        let version = version_string(patch, module, value)?;
        let pos = lines.iter().position(|l| go_require_module(l) == Some(module.as_str()));

        match (pos, version) {
            (Some(i), None) => {
                lines.remove(i);
            }
            (Some(i), Some(v)) => {
                let line = &lines[i];
                let indent: String = line.chars().take_while(|c| c.is_whitespace()).collect();
                let prefix = if line.trim_start().starts_with("require ") {
                    "require "
                } else {
                    ""
                };
                let comment = line
                    .find("//")
                    .map(|p| format!(" {}", &line[p..]))
                    .unwrap_or_default();
                lines[i] = format!("{}{}{} {}{}", indent, prefix, module, v, comment);
            }
            (None, Some(v)) => lines.push(format!("require {} {}", module, v)),
            (None, None) => {}
        }
    }

    Ok(join_lines(&lines))
}

/// Module path of a `require` line, inside or outside a block.
fn go_require_module(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    let body = trimmed.strip_prefix("require ").unwrap_or(trimmed);
    if body.starts_with('(') || body.starts_with("//") {
        return None;
    }
    let mut parts = body.split_whitespace();
    let module = parts.next()?;
    let version = parts.next()?;
    version.starts_with('v').then_some(module)
}

fn join_lines(lines: &[String]) -> String {
    if lines.is_empty() {
        return String::new();
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patch(config_type: ConfigType, changes: serde_json::Value) -> ConfigPatch {
        ConfigPatch {
            path: "manifest".into(),
            config_type,
            changes: changes.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_package_json_keeps_key_order() {
        let current = r#"{"name":"app","dependencies":{"react":"^17.0.0","lodash":"^4.0.0"}}"#;
        let out = apply_config_patch(
            current,
            &patch(
                ConfigType::PackageJson,
                json!({"dependencies.react": "^18.2.0", "dependencies.lodash": null}),
            ),
        )
        .unwrap();
        let doc: JsonValue = serde_json::from_str(&out).unwrap();
        assert_eq!(doc["dependencies"]["react"], "^18.2.0");
        assert!(doc["dependencies"].get("lodash").is_none());
        assert!(out.find("\"name\"").unwrap() < out.find("\"dependencies\"").unwrap());
    }

    #[test]
    fn test_cargo_toml_nested_set() {
        let current = "[package]\nname = \"demo\"\n\n[dependencies]\nserde = \"1.0.100\"\n";
        let out = apply_config_patch(
            current,
            &patch(
                ConfigType::CargoToml,
                json!({
                    "dependencies.serde": "1.0.200",
                    "dependencies.tokio": {"version": "1", "features": ["full"]},
                }),
            ),
        )
        .unwrap();
        let doc: toml::Table = out.parse().unwrap();
        assert_eq!(doc["dependencies"]["serde"].as_str(), Some("1.0.200"));
        assert_eq!(doc["dependencies"]["tokio"]["version"].as_str(), Some("1"));
        assert_eq!(doc["package"]["name"].as_str(), Some("demo"));
    }

    #[test]
    fn test_cargo_toml_keeps_comments() {
        let current = "# workspace manifest\n[package]\nname = \"demo\" # crate name\n\n\
                       [dependencies]\nserde = \"1.0.100\" # keep pinned\n";
        let bump = patch(ConfigType::CargoToml, json!({"dependencies.serde": "1.0.200"}));
        let out = apply_config_patch(current, &bump).unwrap();
        assert_eq!(
            out,
            "# workspace manifest\n[package]\nname = \"demo\" # crate name\n\n\
             [dependencies]\nserde = \"1.0.200\" # keep pinned\n"
        );
    }

    #[test]
    fn test_toml_rejects_non_table_parent() {
        let nested = patch(ConfigType::Toml, json!({"a.b": 2}));
        let err = apply_config_patch("a = 1\n", &nested).unwrap_err();
        assert!(matches!(err, ChangeError::ConfigPatch { .. }));
    }

    #[test]
    fn test_requirements() {
        let current =
            "# deps\nDjango==3.2 ; python_version >= \"3.8\"\nrequests>=2.0\nold_pkg==1.0\n";
        let out = apply_config_patch(
            current,
            &patch(
                ConfigType::RequirementsTxt,
                json!({"django": "4.2.1", "requests": "2.31.0", "old-pkg": null, "rich": "13.0"}),
            ),
        )
        .unwrap();
        assert_eq!(
            out,
            "# deps\nDjango==4.2.1 ; python_version >= \"3.8\"\nrequests==2.31.0\nrich==13.0\n"
        );
    }

    #[test]
    fn test_go_mod() {
        let current = "module example.com/app\n\ngo 1.21\n\n\
                       require (\n\tgithub.com/pkg/errors v0.9.0 // indirect\n\
                       \tgolang.org/x/sync v0.1.0\n)\n\n\
                       require github.com/stretchr/testify v1.8.0\n";
        let out = apply_config_patch(
            current,
            &patch(
                ConfigType::GoMod,
                json!({
                    "github.com/pkg/errors": "v0.9.1",
                    "github.com/stretchr/testify": "v1.9.0",
                    "golang.org/x/sync": null,
                }),
            ),
        )
        .unwrap();
        assert!(out.contains("\tgithub.com/pkg/errors v0.9.1 // indirect\n"));
        assert!(out.contains("require github.com/stretchr/testify v1.9.0\n"));
        assert!(!out.contains("golang.org/x/sync"));
        assert!(out.starts_with("module example.com/app\n"));
    }

    #[test]
    fn test_bad_version_type() {
        let bad = patch(ConfigType::RequirementsTxt, json!({"x": [1]}));
        let err = apply_config_patch("x==1\n", &bad).unwrap_err();
        assert!(err.to_string().contains("must be a string"));
    }
}
