//! Module spec
//!
//! Declares a module's parameters, capabilities and UI metadata. A spec is
//! first checked against the embedded JSON Schema (see [`crate::schema`]),
//! then deserialized here and checked for cross-references the schema
//! cannot express.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LoadError;

/// Parameter widget type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    /// Free text
    String,
    /// Whole number
    Integer,
    /// Floating-point number
    Float,
    /// Boolean checkbox
    Checkbox,
    /// Drop-down of options
    Menu,
    /// Radio buttons of options
    Radio,
    /// One input column
    Column,
    /// Several input columns
    Multicolumn,
    /// One other tab
    Tab,
    /// Several other tabs
    Multitab,
    /// Credential, only for data-loading modules
    Secret,
    /// Uploaded file
    File,
    /// Label with no value
    Statictext,
    /// Action button with no value
    Button,
    /// Repeated group of child parameters
    List,
    /// Module-defined widget
    Custom,
}

impl ParamType {
    /// Check if the type carries a list of options
    #[must_use]
    pub const fn has_options(self) -> bool {
        matches!(self, Self::Menu | Self::Radio)
    }
}

/// One choice of a menu or radio parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MenuOption {
    /// Selectable value
    Choice {
        /// Stored value
        value: Value,
        /// Display label
        label: String,
    },
    /// Visual divider, written as the string `separator`
    Separator(String),
}

impl MenuOption {
    /// Stored value, unless this is a separator
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Choice { value, .. } => Some(value),
            Self::Separator(_) => None,
        }
    }
}

/// Condition showing a parameter only for some values of another
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisibleIf {
    /// Parameter the condition reads
    pub id_name: String,
    /// Value, list of values, or `a|b` alternatives
    pub value: Value,
    /// Show when the condition does not hold
    #[serde(default)]
    pub invert: bool,
}

impl VisibleIf {
    /// Values the condition names, as strings
    fn named_values(&self) -> BTreeSet<String> {
        match &self.value {
            Value::Array(items) => items.iter().map(value_key).collect(),
            Value::String(s) => s.split('|').map(str::to_string).collect(),
            other => BTreeSet::from([value_key(other)]),
        }
    }
}

fn value_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Declared parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Key in the parameter dictionary
    pub id_name: String,
    /// Widget type
    #[serde(rename = "type")]
    pub param_type: ParamType,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Value used when the user has set none
    #[serde(default)]
    pub default: Option<Value>,
    /// Choices for menu and radio parameters
    #[serde(default)]
    pub options: Option<Vec<MenuOption>>,
    /// Visibility condition
    #[serde(default)]
    pub visible_if: Option<VisibleIf>,
    /// Tab parameter whose table this column parameter reads
    #[serde(default)]
    pub tab_parameter: Option<String>,
    /// Placeholder text
    #[serde(default)]
    pub placeholder: String,
    /// Multi-line text input
    #[serde(default)]
    pub multiline: bool,
    /// Child parameters of a list
    #[serde(default)]
    pub child_parameters: Vec<ParamSpec>,
}

impl ParamSpec {
    fn option_values(&self) -> Option<BTreeSet<String>> {
        self.options
            .as_ref()
            .map(|options| options.iter().filter_map(MenuOption::value).map(value_key).collect())
    }
}

/// Deprecation notice shown to users of an old module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deprecation {
    /// Date the module was deprecated
    pub end_date: String,
    /// Explanation shown to users
    pub message: String,
}

/// Parsed, validated module spec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSpec {
    /// Module id; must equal the archive id
    pub id_name: String,
    /// Display name
    pub name: String,
    /// Catalog category
    pub category: String,
    /// One-line description
    #[serde(default)]
    pub description: String,
    /// Module fetches external data
    #[serde(default)]
    pub loads_data: bool,
    /// Module reads its input table; defaults to `!loads_data`
    #[serde(default)]
    pub uses_data: Option<bool>,
    /// Module produces HTML output
    #[serde(default)]
    pub html_output: bool,
    /// Help page
    #[serde(default)]
    pub help_url: String,
    /// Catalog icon
    #[serde(default)]
    pub icon: String,
    /// Version of the parameter layout, for migrations
    #[serde(default)]
    pub parameters_version: Option<u32>,
    /// Deprecation notice
    #[serde(default)]
    pub deprecated: Option<Deprecation>,
    /// Declared parameters, in display order
    #[serde(default)]
    pub parameters: Vec<ParamSpec>,
}

impl ModuleSpec {
    /// Parse a spec from YAML or JSON text, checking it against the schema
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::Spec`] for unparseable text, schema violations
    /// and semantic errors.
    pub fn parse(bytes: &[u8], archive_id: &str) -> Result<Self, LoadError> {
        // YAML is a superset of JSON, so one parser covers both spellings.
        let value: Value = serde_yaml::from_slice(bytes).map_err(|e| LoadError::Spec(format!("unparseable: {e}")))?;
        crate::schema::check(&value)?;
        let spec: Self = serde_json::from_value(value).map_err(|e| LoadError::Spec(e.to_string()))?;
        spec.validate(archive_id)?;
        Ok(spec)
    }

    /// Whether the module reads its input table
    #[must_use]
    pub fn uses_data(&self) -> bool {
        self.uses_data.unwrap_or(!self.loads_data)
    }

    /// Look up a parameter by id
    #[must_use]
    pub fn param(&self, id_name: &str) -> Option<&ParamSpec> {
        self.parameters.iter().find(|p| p.id_name == id_name)
    }

    /// Ids of every secret parameter
    pub fn secret_params(&self) -> impl Iterator<Item = &str> {
        self.parameters
            .iter()
            .filter(|p| p.param_type == ParamType::Secret)
            .map(|p| p.id_name.as_str())
    }

    /// Check cross-references the schema cannot express
    ///
    /// All problems are collected into one message.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::Spec`] listing every problem found.
    pub fn validate(&self, archive_id: &str) -> Result<(), LoadError> {
        let mut problems = Vec::new();

        if self.id_name != archive_id {
            problems.push(format!("id_name '{}' does not match archive id '{archive_id}'", self.id_name));
        }

        let mut lookup: HashMap<&str, &ParamSpec> = HashMap::new();
        for param in &self.parameters {
            if lookup.insert(&param.id_name, param).is_some() {
                problems.push(format!("param '{}' appears twice", param.id_name));
            }
        }

        for param in &self.parameters {
            if let (Some(default), Some(options)) = (&param.default, param.option_values()) {
                if !options.contains(&value_key(default)) {
                    problems.push(format!("param '{}' has a 'default' that is not in its 'options'", param.id_name));
                }
            }
            if param.param_type.has_options() && param.options.as_ref().map_or(true, Vec::is_empty) {
                problems.push(format!("param '{}' needs 'options'", param.id_name));
            }

            if param.param_type == ParamType::Secret && !self.loads_data {
                problems.push(format!(
                    "param '{}' is a secret, but only modules with loads_data may declare secrets",
                    param.id_name
                ));
            }

            if let Some(visible_if) = &param.visible_if {
                match lookup.get(visible_if.id_name.as_str()) {
                    None => problems.push(format!(
                        "param '{}' has visible_if id_name '{}', which does not exist",
                        param.id_name, visible_if.id_name
                    )),
                    Some(target) => {
                        if let Some(options) = target.option_values() {
                            let missing: Vec<String> =
                                visible_if.named_values().difference(&options).cloned().collect();
                            if !missing.is_empty() {
                                problems.push(format!(
                                    "param '{}' has visible_if values {missing:?} not in '{}' options",
                                    param.id_name, target.id_name
                                ));
                            }
                        }
                    }
                }
            }

            if let Some(tab_parameter) = &param.tab_parameter {
                match lookup.get(tab_parameter.as_str()) {
                    None => problems.push(format!(
                        "param '{}' has a 'tab_parameter' that is not in 'parameters'",
                        param.id_name
                    )),
                    Some(target) if target.param_type != ParamType::Tab => problems.push(format!(
                        "param '{}' has a 'tab_parameter' that is not a 'tab'",
                        param.id_name
                    )),
                    Some(_) => {}
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(LoadError::Spec(problems.join("; ")))
        }
    }
}
