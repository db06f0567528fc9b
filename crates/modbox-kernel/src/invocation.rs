//! One request, bound to the scratch directory it runs in

use std::collections::BTreeMap;

use modbox_wire::{
    CallKind, FetchRequest, InvocationRequest, MigrateParamsRequest, Params, RawParams, RenderRequest, TabInfo,
};
use serde_json::Value;

use crate::scratch::ScratchDir;

/// Name the worker writes its output table to
pub const OUTPUT_FILENAME: &str = "output.arrow";

/// A request plus the scratch directory it owns
///
/// The request's `basedir` always names the owned directory.
#[derive(Debug)]
pub struct Invocation {
    scratch: ScratchDir,
    request: InvocationRequest,
}

impl Invocation {
    /// Bind `request` to `scratch`, overriding its `basedir`
    #[must_use]
    pub fn new(scratch: ScratchDir, mut request: InvocationRequest) -> Self {
        let basedir = scratch.path().display().to_string();
        match &mut request {
            InvocationRequest::Render(render) => render.basedir = basedir,
            InvocationRequest::Fetch(fetch) => fetch.basedir = basedir,
            InvocationRequest::MigrateParams(_) => {}
        }
        Self { scratch, request }
    }

    /// Render `input_filename`, already written into `scratch`
    #[must_use]
    pub fn render(scratch: ScratchDir, input_filename: impl Into<String>, params: Params, tab: TabInfo) -> Self {
        let request = InvocationRequest::Render(RenderRequest {
            basedir: String::new(),
            input_filename: input_filename.into(),
            output_filename: OUTPUT_FILENAME.to_string(),
            params,
            tab,
            input_tabs: BTreeMap::new(),
            fetch_result: None,
        });
        Self::new(scratch, request)
    }

    /// Fetch with `params` and `secrets`
    #[must_use]
    pub fn fetch(scratch: ScratchDir, params: Params, secrets: BTreeMap<String, Value>) -> Self {
        let request = InvocationRequest::Fetch(FetchRequest {
            basedir: String::new(),
            output_filename: OUTPUT_FILENAME.to_string(),
            params,
            secrets,
            last_fetch_result: None,
            input_table_filename: None,
        });
        Self::new(scratch, request)
    }

    /// Migrate stored `params` to the module's current schema
    #[must_use]
    pub fn migrate_params(scratch: ScratchDir, params: RawParams) -> Self {
        Self::new(
            scratch,
            InvocationRequest::MigrateParams(MigrateParamsRequest { params }),
        )
    }

    /// Call kind
    #[inline]
    #[must_use]
    pub fn call_kind(&self) -> CallKind {
        self.request.call_kind()
    }

    /// Scratch directory
    #[inline]
    #[must_use]
    pub fn scratch(&self) -> &ScratchDir {
        &self.scratch
    }

    /// Wire request
    #[inline]
    #[must_use]
    pub fn request(&self) -> &InvocationRequest {
        &self.request
    }

    /// Mutable wire request, for optional fields
    ///
    /// `basedir` is reset to the scratch directory before sending.
    #[inline]
    pub fn request_mut(&mut self) -> &mut InvocationRequest {
        &mut self.request
    }

    /// Split into the directory and the request, `basedir` re-pinned
    #[must_use]
    pub fn into_parts(self) -> (ScratchDir, InvocationRequest) {
        let Self { scratch, request } = Self::new(self.scratch, self.request);
        (scratch, request)
    }
}
