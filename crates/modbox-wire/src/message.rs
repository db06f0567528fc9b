//! Invocation messages
//!
//! Required fields carry no serde default, so a message missing one fails to
//! decode. Optional fields default when absent, and unknown fields are
//! ignored so older readers accept newer writers.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WireError;
use crate::filename::validate_filename;
use crate::i18n::RenderError;
use crate::params::{Params, RawParams};

/// Call kind, selected by the request tag rather than by module contents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    /// Transform an input table
    Render,
    /// Produce a table from external data
    Fetch,
    /// Upgrade stored parameters
    MigrateParams,
}

impl CallKind {
    /// Name of the module entry point serving this call
    #[must_use]
    pub const fn entry_point(self) -> &'static str {
        match self {
            Self::Render => "render",
            Self::Fetch => "fetch",
            Self::MigrateParams => "migrate_params",
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.entry_point())
    }
}

/// Code handed to the worker; the worker compiles it in-process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeUnit {
    /// Module id
    pub module_id: String,
    /// Module version
    pub version: String,
    /// Script source
    pub source: String,
}

/// A tab of the caller's workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabInfo {
    /// Stable identifier
    pub slug: String,
    /// Display name
    pub name: String,
}

/// Output of another tab, made available to a render call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabOutput {
    /// Tab that produced the table
    pub tab: TabInfo,
    /// Table file inside the scratch directory
    pub table_filename: String,
}

/// Render call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderRequest {
    /// Absolute scratch directory path
    pub basedir: String,
    /// Input table file inside `basedir`
    pub input_filename: String,
    /// File the module must write its output table to
    pub output_filename: String,
    /// Validated parameters
    pub params: Params,
    /// Tab being rendered
    pub tab: TabInfo,
    /// Outputs of other tabs, keyed by tab slug
    #[serde(default)]
    pub input_tabs: BTreeMap<String, TabOutput>,
    /// Most recent fetch result of this step
    #[serde(default)]
    pub fetch_result: Option<FetchResult>,
}

/// Fetch call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Absolute scratch directory path
    pub basedir: String,
    /// File the module must write its fetched table to
    pub output_filename: String,
    /// Validated parameters
    pub params: Params,
    /// Secret material, keyed by parameter id
    #[serde(default)]
    pub secrets: BTreeMap<String, Value>,
    /// Previous fetch result, for incremental fetches
    #[serde(default)]
    pub last_fetch_result: Option<FetchResult>,
    /// Table the step receives as input, when the module wants it
    #[serde(default)]
    pub input_table_filename: Option<String>,
}

/// Parameter-migration call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrateParamsRequest {
    /// Parameters as stored
    pub params: RawParams,
}

/// One request, tagged by call kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvocationRequest {
    /// Render call
    Render(RenderRequest),
    /// Fetch call
    Fetch(FetchRequest),
    /// Parameter-migration call
    MigrateParams(MigrateParamsRequest),
}

impl InvocationRequest {
    /// Kind of this call
    #[must_use]
    pub fn call_kind(&self) -> CallKind {
        match self {
            Self::Render(_) => CallKind::Render,
            Self::Fetch(_) => CallKind::Fetch,
            Self::MigrateParams(_) => CallKind::MigrateParams,
        }
    }

    /// Scratch directory, for calls that carry one in the message
    #[must_use]
    pub fn basedir(&self) -> Option<&str> {
        match self {
            Self::Render(r) => Some(&r.basedir),
            Self::Fetch(f) => Some(&f.basedir),
            Self::MigrateParams(_) => None,
        }
    }

    /// File the module must write, for table-producing calls
    #[must_use]
    pub fn output_filename(&self) -> Option<&str> {
        match self {
            Self::Render(r) => Some(&r.output_filename),
            Self::Fetch(f) => Some(&f.output_filename),
            Self::MigrateParams(_) => None,
        }
    }

    /// Check every filename the request references
    ///
    /// # Errors
    ///
    /// Returns the first unsafe filename found.
    pub fn validate_filenames(&self) -> Result<(), WireError> {
        let mut names: Vec<&str> = Vec::new();
        let params = match self {
            Self::Render(r) => {
                names.push(&r.input_filename);
                names.push(&r.output_filename);
                names.extend(r.input_tabs.values().map(|t| t.table_filename.as_str()));
                if let Some(fetch) = &r.fetch_result {
                    names.push(&fetch.filename);
                }
                Some(&r.params)
            }
            Self::Fetch(f) => {
                names.push(&f.output_filename);
                if let Some(last) = &f.last_fetch_result {
                    names.push(&last.filename);
                }
                if let Some(input) = &f.input_table_filename {
                    names.push(input);
                }
                Some(&f.params)
            }
            Self::MigrateParams(_) => None,
        };
        if let Some(params) = params {
            names.extend(params.values().flat_map(|v| v.filenames()));
        }
        names.into_iter().try_for_each(validate_filename)
    }
}

/// Everything a worker needs for one call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInvocation {
    /// Module code
    pub code: CodeUnit,
    /// The call
    pub request: InvocationRequest,
}

/// Successful render
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderResult {
    /// Table file written inside the scratch directory
    pub table_filename: String,
    /// Module-reported errors and warnings
    #[serde(default)]
    pub errors: Vec<RenderError>,
    /// JSON side-channel value
    #[serde(default)]
    pub json: Value,
}

/// Successful fetch; also the stored record of a previous fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResult {
    /// Table file inside the scratch directory
    pub filename: String,
    /// Module-reported errors and warnings
    #[serde(default)]
    pub errors: Vec<RenderError>,
}

/// Migrated parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrateParamsResult {
    /// Parameters in the current version's shape
    pub params: RawParams,
}

/// Success value, tagged by call kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvocationOutput {
    /// Render output
    Render(RenderResult),
    /// Fetch output
    Fetch(FetchResult),
    /// Migrated parameters
    MigrateParams(MigrateParamsResult),
}

impl InvocationOutput {
    /// Kind of call this answers
    #[must_use]
    pub fn call_kind(&self) -> CallKind {
        match self {
            Self::Render(_) => CallKind::Render,
            Self::Fetch(_) => CallKind::Fetch,
            Self::MigrateParams(_) => CallKind::MigrateParams,
        }
    }
}

/// Why a worker could not produce a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Module code raised an uncaught error
    ModuleError,
    /// Module returned a value of the wrong shape
    InvalidReturn,
    /// Module lacks the entry point for this call kind
    MissingEntryPoint,
    /// Module code did not compile in the worker
    CompileError,
    /// The worker could not understand the request
    BadRequest,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ModuleError => "module error",
            Self::InvalidReturn => "invalid return value",
            Self::MissingEntryPoint => "missing entry point",
            Self::CompileError => "compile error",
            Self::BadRequest => "bad request",
        };
        f.write_str(name)
    }
}

/// Worker-side failure report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerFailure {
    /// Failure category
    pub error_kind: FailureKind,
    /// Human-diagnosable detail
    pub diagnostic_message: String,
}

impl WorkerFailure {
    /// Create a failure report
    #[inline]
    #[must_use]
    pub fn new(error_kind: FailureKind, diagnostic_message: impl Into<String>) -> Self {
        Self {
            error_kind,
            diagnostic_message: diagnostic_message.into(),
        }
    }
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_kind, self.diagnostic_message)
    }
}

/// Worker response, tagged by status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvocationResponse {
    /// Call produced a result
    Ok {
        /// The result
        output: InvocationOutput,
    },
    /// Call failed inside the worker
    Failed(WorkerFailure),
}

impl InvocationResponse {
    /// Wrap a success value
    #[inline]
    #[must_use]
    pub fn ok(output: InvocationOutput) -> Self {
        Self::Ok { output }
    }

    /// Check for success
    #[inline]
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamValue;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn render_request() -> RenderRequest {
        RenderRequest {
            basedir: "/tmp/scratch".into(),
            input_filename: "input.arrow".into(),
            output_filename: "output.arrow".into(),
            params: Params::from([("factor".to_string(), ParamValue::Integer(2))]),
            tab: TabInfo {
                slug: "tab-1".into(),
                name: "Tab 1".into(),
            },
            input_tabs: BTreeMap::new(),
            fetch_result: None,
        }
    }

    #[test]
    fn request_is_tagged_by_kind() {
        let request = InvocationRequest::Render(render_request());
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["kind"], "render");
        assert_eq!(value["params"]["factor"], json!({"type": "integer", "value": 2}));
        assert_eq!(request.call_kind(), CallKind::Render);
        assert_eq!(request.output_filename(), Some("output.arrow"));
    }

    #[test]
    fn unknown_fields_are_ignored_and_optionals_default() {
        let request: InvocationRequest = serde_json::from_value(json!({
            "kind": "fetch",
            "basedir": "/tmp/s",
            "output_filename": "out.arrow",
            "params": {},
            "added_in_v2": {"anything": true}
        }))
        .unwrap();
        let InvocationRequest::Fetch(fetch) = request else {
            panic!("expected fetch");
        };
        assert!(fetch.secrets.is_empty());
        assert_eq!(fetch.last_fetch_result, None);
        assert_eq!(fetch.input_table_filename, None);
    }

    #[test]
    fn missing_required_field_fails() {
        let result = serde_json::from_value::<InvocationRequest>(json!({
            "kind": "render",
            "basedir": "/tmp/s",
            "output_filename": "out.arrow",
            "params": {},
            "tab": {"slug": "t", "name": "T"}
        }));
        assert!(result.is_err(), "input_filename is required");
    }

    #[test]
    fn filenames_are_checked_everywhere() {
        let mut request = render_request();
        assert!(InvocationRequest::Render(request.clone()).validate_filenames().is_ok());

        request.params.insert("upload".into(), ParamValue::Filename("../etc".into()));
        assert!(InvocationRequest::Render(request.clone()).validate_filenames().is_err());

        request.params.remove("upload");
        request.fetch_result = Some(FetchResult {
            filename: ".hidden".into(),
            errors: vec![],
        });
        assert!(InvocationRequest::Render(request).validate_filenames().is_err());
    }

    #[test]
    fn response_layout() {
        let ok = InvocationResponse::ok(InvocationOutput::Render(RenderResult {
            table_filename: "output.arrow".into(),
            errors: vec![RenderError::plain_text("careful")],
            json: json!({"chart": [1, 2]}),
        }));
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["output"]["kind"], "render");

        let failed = InvocationResponse::Failed(WorkerFailure::new(FailureKind::ModuleError, "boom"));
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(
            value,
            json!({"status": "failed", "error_kind": "module_error", "diagnostic_message": "boom"})
        );
        let back: InvocationResponse = serde_json::from_value(value).unwrap();
        assert_eq!(back, failed);
    }

    #[test]
    fn render_result_defaults() {
        let result: RenderResult = serde_json::from_value(json!({"table_filename": "o.arrow"})).unwrap();
        assert!(result.errors.is_empty());
        assert_eq!(result.json, Value::Null);
    }
}
