//! Module return conventions
//!
//! `render()` and `fetch()` may return:
//! - a `Table`
//! - a string: an error message, with an empty table
//! - `()`: an empty table
//! - a map with any of `table`, `errors` and (render only) `json`
//!
//! Errors are strings or maps `#{id, arguments, quick_fixes}`.
//! `migrate_params()` must return a map. Anything else is an invalid return.

use std::collections::BTreeMap;

use modbox_table::Table;
use modbox_wire::{I18nArgument, I18nMessage, I18nSource, QuickFix, RenderError};
use rhai::Dynamic;
use serde::Deserialize;
use serde_json::Value;

use crate::script_table::ScriptTable;

/// Table-producing return, normalized
#[derive(Debug, Clone, PartialEq)]
pub struct TableReturn {
    /// Table to write
    pub table: Table,
    /// Module-reported errors
    pub errors: Vec<RenderError>,
    /// Side-channel value
    pub json: Value,
}

impl Default for TableReturn {
    fn default() -> Self {
        Self {
            table: Table::empty(),
            errors: Vec::new(),
            json: Value::Null,
        }
    }
}

/// Error as a script spells it in a map
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScriptError {
    id: String,
    #[serde(default)]
    arguments: BTreeMap<String, I18nArgument>,
    #[serde(default)]
    quick_fixes: Vec<QuickFix>,
}

/// Normalize a `render()` or `fetch()` return value
///
/// # Errors
///
/// Returns a description of the offending shape.
pub fn table_return(value: Dynamic, module_id: &str, allow_json: bool) -> Result<TableReturn, String> {
    if value.is_unit() {
        return Ok(TableReturn::default());
    }
    if value.is::<ScriptTable>() {
        return Ok(TableReturn {
            table: script_table(value)?,
            ..TableReturn::default()
        });
    }
    if value.is_string() {
        return Ok(TableReturn {
            errors: render_errors(value, module_id)?,
            ..TableReturn::default()
        });
    }
    if !value.is_map() {
        return Err(format!("expected Table, string, () or map, got {}", value.type_name()));
    }

    let mut result = TableReturn::default();
    for (key, item) in value.cast::<rhai::Map>() {
        match key.as_str() {
            "table" if item.is_unit() => {}
            "table" => result.table = script_table(item)?,
            "errors" => result.errors = render_errors(item, module_id)?,
            "json" if allow_json => result.json = to_json(&item)?,
            other => return Err(format!("unexpected key {other:?} in returned map")),
        }
    }
    Ok(result)
}

/// Normalize a `migrate_params()` return value
///
/// # Errors
///
/// Returns a description of the offending shape.
pub fn params_return(value: &Dynamic) -> Result<Value, String> {
    if !value.is_map() {
        return Err(format!("expected map, got {}", value.type_name()));
    }
    to_json(value)
}

fn script_table(value: Dynamic) -> Result<Table, String> {
    let type_name = value.type_name();
    let table = value
        .try_cast::<ScriptTable>()
        .ok_or_else(|| format!("expected Table, got {type_name}"))?;
    table.into_table().map_err(|e| e.to_string())
}

fn to_json(value: &Dynamic) -> Result<Value, String> {
    rhai::serde::from_dynamic::<Value>(value).map_err(|e| format!("value is not JSON-compatible: {e}"))
}

fn render_errors(value: Dynamic, module_id: &str) -> Result<Vec<RenderError>, String> {
    if value.is_array() {
        value
            .cast::<rhai::Array>()
            .into_iter()
            .map(|item| render_error(item, module_id))
            .collect()
    } else {
        render_error(value, module_id).map(|e| vec![e])
    }
}

fn render_error(value: Dynamic, module_id: &str) -> Result<RenderError, String> {
    if value.is_string() {
        let text = value.into_string().map_err(str::to_string)?;
        return Ok(RenderError::plain_text(text));
    }
    if !value.is_map() {
        return Err(format!("error must be a string or map, got {}", value.type_name()));
    }
    let error: ScriptError = serde_json::from_value(to_json(&value)?).map_err(|e| format!("malformed error: {e}"))?;
    let message = I18nMessage {
        id: error.id,
        arguments: error.arguments,
        source: Some(I18nSource::Module {
            module_id: module_id.to_string(),
        }),
    };
    Ok(RenderError {
        message,
        quick_fixes: error.quick_fixes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use modbox_test_utils::number_table;
    use modbox_wire::QuickFixAction;
    use pretty_assertions::assert_eq;
    use rhai::Engine;

    fn eval(script: &str) -> Dynamic {
        let mut engine = Engine::new();
        engine.register_type_with_name::<ScriptTable>("Table");
        engine.register_fn("a_table", || ScriptTable::from(number_table("A", &[1])));
        engine.eval(script).unwrap()
    }

    #[test]
    fn table_and_unit() {
        let table = table_return(eval("a_table()"), "m", true).unwrap();
        assert_eq!(table.table, number_table("A", &[1]));
        assert_eq!(table_return(eval("()"), "m", true).unwrap(), TableReturn::default());
    }

    #[test]
    fn string_is_a_plain_text_error() {
        let result = table_return(eval(r#""no column A""#), "m", true).unwrap();
        assert!(result.table.is_empty());
        assert_eq!(result.errors, vec![RenderError::plain_text("no column A")]);
    }

    #[test]
    fn map_with_structured_errors() {
        let result = table_return(
            eval(
                r#"#{
                    table: a_table(),
                    errors: [
                        "plain",
                        #{
                            id: "convert.needed",
                            arguments: #{ n: 3, name: "A" },
                            quick_fixes: [#{
                                button_text: #{ id: "convert.button" },
                                action: #{ type: "prepend_step", module_slug: "converttexttonumber",
                                           partial_params: #{ colnames: ["A"] } }
                            }]
                        }
                    ],
                    json: #{ chart: [1, 2] }
                }"#,
            ),
            "double",
            true,
        )
        .unwrap();
        assert_eq!(result.table.num_rows(), 1);
        assert_eq!(result.errors.len(), 2);
        let structured = &result.errors[1];
        assert_eq!(structured.message.arguments["n"], I18nArgument::Integer(3));
        assert_eq!(
            structured.message.source,
            Some(I18nSource::Module {
                module_id: "double".into()
            })
        );
        assert!(matches!(
            &structured.quick_fixes[0].action,
            QuickFixAction::PrependStep { module_slug, .. } if module_slug == "converttexttonumber"
        ));
        assert_eq!(result.json, serde_json::json!({"chart": [1, 2]}));
    }

    #[test]
    fn invalid_shapes() {
        assert!(table_return(eval("42"), "m", true).is_err());
        assert!(table_return(eval("#{ tabel: () }"), "m", true).is_err());
        assert!(table_return(eval("#{ json: 1 }"), "m", false).is_err());
        assert!(table_return(eval("#{ errors: [#{ text: 1 }] }"), "m", true).is_err());
        assert!(table_return(eval("#{ table: 3 }"), "m", true).is_err());
    }

    #[test]
    fn migrate_params_needs_a_map() {
        assert_eq!(
            params_return(&eval("#{ factor: 2 }")).unwrap(),
            serde_json::json!({"factor": 2})
        );
        assert!(params_return(&eval("[1]")).is_err());
    }
}
