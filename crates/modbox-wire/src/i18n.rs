//! Localizable module errors and quick fixes

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Message id used when a module reports a bare string
pub const PLAIN_TEXT_MESSAGE_ID: &str = "modbox.plain_text";

/// Interpolation argument of a localized message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum I18nArgument {
    /// Whole number
    Integer(i64),
    /// Floating-point number
    Float(f64),
    /// Text
    Text(String),
}

impl From<&str> for I18nArgument {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for I18nArgument {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for I18nArgument {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for I18nArgument {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// Catalog a message id belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum I18nSource {
    /// The module's own catalog
    Module {
        /// Module id owning the catalog
        module_id: String,
    },
    /// A shared library catalog
    Library {
        /// Library name
        library: String,
    },
}

/// A message id plus arguments, rendered by the host in the user's locale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct I18nMessage {
    /// Catalog key
    pub id: String,
    /// Named interpolation arguments
    #[serde(default)]
    pub arguments: BTreeMap<String, I18nArgument>,
    /// Catalog, if not the host's
    #[serde(default)]
    pub source: Option<I18nSource>,
}

impl I18nMessage {
    /// Create a message with no arguments
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            arguments: BTreeMap::new(),
            source: None,
        }
    }

    /// Wrap untranslated text a module returned
    #[must_use]
    pub fn plain_text(text: impl Into<String>) -> Self {
        Self::new(PLAIN_TEXT_MESSAGE_ID).with_argument("text", text.into())
    }

    /// Add an interpolation argument
    #[inline]
    #[must_use]
    pub fn with_argument(mut self, name: impl Into<String>, value: impl Into<I18nArgument>) -> Self {
        self.arguments.insert(name.into(), value.into());
        self
    }

    /// Set the catalog
    #[inline]
    #[must_use]
    pub fn with_source(mut self, source: I18nSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Text of a plain-text message
    #[must_use]
    pub fn as_plain_text(&self) -> Option<&str> {
        if self.id != PLAIN_TEXT_MESSAGE_ID {
            return None;
        }
        match self.arguments.get("text") {
            Some(I18nArgument::Text(text)) => Some(text),
            _ => None,
        }
    }
}

/// What a quick-fix button does when clicked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuickFixAction {
    /// Insert a module before the current step
    PrependStep {
        /// Module to insert
        module_slug: String,
        /// Parameters to preset on the inserted step
        #[serde(default)]
        partial_params: serde_json::Map<String, serde_json::Value>,
    },
}

/// Remediation suggested alongside an error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuickFix {
    /// Button label
    pub button_text: I18nMessage,
    /// Action applied on click
    pub action: QuickFixAction,
}

/// Module-reported error or warning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderError {
    /// What went wrong
    pub message: I18nMessage,
    /// Suggested fixes, possibly none
    #[serde(default)]
    pub quick_fixes: Vec<QuickFix>,
}

impl RenderError {
    /// Error with no quick fixes
    #[inline]
    #[must_use]
    pub fn new(message: I18nMessage) -> Self {
        Self {
            message,
            quick_fixes: Vec::new(),
        }
    }

    /// Plain-text error with no quick fixes
    #[inline]
    #[must_use]
    pub fn plain_text(text: impl Into<String>) -> Self {
        Self::new(I18nMessage::plain_text(text))
    }
}
