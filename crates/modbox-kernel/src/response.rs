//! Certified invocation results

use modbox_table::{MetadataWarning, Table};
use modbox_wire::{RawParams, RenderError};
use serde_json::Value;

/// Successful render
#[derive(Debug, Clone, PartialEq)]
pub struct RenderOutcome {
    /// Certified output table
    pub table: Table,
    /// Errors and warnings the module reported
    pub errors: Vec<RenderError>,
    /// Side-channel value
    pub json: Value,
    /// Metadata the validator dropped
    pub warnings: Vec<MetadataWarning>,
}

/// Successful fetch
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    /// Certified fetched table
    pub table: Table,
    /// Errors the module reported
    pub errors: Vec<RenderError>,
    /// Metadata the validator dropped
    pub warnings: Vec<MetadataWarning>,
}

/// What `invoke` returns on success
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationResponse {
    /// Render output
    Render(RenderOutcome),
    /// Fetch output
    Fetch(FetchOutcome),
    /// Migrated parameters
    MigrateParams(RawParams),
}

impl InvocationResponse {
    /// Render output, if this is one
    #[must_use]
    pub fn into_render(self) -> Option<RenderOutcome> {
        match self {
            Self::Render(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// Fetch output, if this is one
    #[must_use]
    pub fn into_fetch(self) -> Option<FetchOutcome> {
        match self {
            Self::Fetch(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// Migrated parameters, if this is a migration
    #[must_use]
    pub fn into_params(self) -> Option<RawParams> {
        match self {
            Self::MigrateParams(params) => Some(params),
            _ => None,
        }
    }
}
