//! One invocation, start to finish, inside the worker
//!
//! The request's kind tag picks the handler. Every failure becomes a
//! [`WorkerFailure`]; nothing the module does unwinds out of [`execute`].

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use modbox_package::compile_module;
use modbox_table::{read_table, write_table, Table, TableError};
use modbox_wire::{
    params_to_json, resolve_in, CallKind, CodeUnit, FailureKind, FetchRequest, FetchResult, InvocationOutput,
    InvocationRequest, InvocationResponse, MigrateParamsRequest, MigrateParamsResult, RawParams, RenderRequest,
    RenderResult, TabInfo, WorkerFailure, WorkerInvocation,
};
use rhai::{Dynamic, Engine, FuncArgs, Scope, AST};
use serde::Serialize;
use tracing::debug;

use crate::returns::{params_return, table_return};
use crate::script_table::ScriptTable;

type Outcome<T> = Result<T, WorkerFailure>;

/// Run `invocation` against `engine`
///
/// Compiles the code, checks the entry point, calls it, and writes any
/// output table into the request's `basedir`.
#[must_use]
pub fn execute(engine: &Engine, invocation: &WorkerInvocation) -> InvocationResponse {
    let WorkerInvocation { code, request } = invocation;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| dispatch(engine, code, request))).unwrap_or_else(|payload| {
        Err(WorkerFailure::new(
            FailureKind::ModuleError,
            format!("module panicked: {}", panic_message(payload.as_ref())),
        ))
    });
    match outcome {
        Ok(output) => InvocationResponse::ok(output),
        Err(failure) => {
            debug!(module = %code.module_id, %failure, "invocation failed");
            InvocationResponse::Failed(failure)
        }
    }
}

fn dispatch(engine: &Engine, code: &CodeUnit, request: &InvocationRequest) -> Outcome<InvocationOutput> {
    request.validate_filenames().map_err(|e| failure(FailureKind::BadRequest, e))?;
    let (ast, entry_points) = compile_module(engine, &code.source).map_err(|e| failure(FailureKind::CompileError, e))?;

    let kind = request.call_kind();
    if !entry_points.has(kind) {
        return Err(failure(
            FailureKind::MissingEntryPoint,
            format!("module {} defines no {kind}() function", code.module_id),
        ));
    }

    let call = Call {
        engine,
        ast: &ast,
        module_id: &code.module_id,
    };
    match request {
        InvocationRequest::Render(render) => call.render(render).map(InvocationOutput::Render),
        InvocationRequest::Fetch(fetch) => call.fetch(fetch).map(InvocationOutput::Fetch),
        InvocationRequest::MigrateParams(migrate) => call.migrate_params(migrate).map(InvocationOutput::MigrateParams),
    }
}

struct Call<'a> {
    engine: &'a Engine,
    ast: &'a AST,
    module_id: &'a str,
}

impl Call<'_> {
    fn render(&self, request: &RenderRequest) -> Outcome<RenderResult> {
        let basedir = Path::new(&request.basedir);
        let table = load_table(basedir, &request.input_filename)?;
        let params = to_script(&params_to_json(&request.params))?;

        let mut input_tabs = rhai::Map::new();
        for (slug, output) in &request.input_tabs {
            let mut entry = rhai::Map::new();
            entry.insert("tab".into(), tab_map(&output.tab));
            entry.insert("table".into(), Dynamic::from(load_table(basedir, &output.table_filename)?));
            input_tabs.insert(slug.as_str().into(), Dynamic::from_map(entry));
        }

        let mut ctx = rhai::Map::new();
        ctx.insert("basedir".into(), request.basedir.clone().into());
        ctx.insert("output_filename".into(), request.output_filename.clone().into());
        ctx.insert("tab".into(), tab_map(&request.tab));
        ctx.insert("input_tabs".into(), Dynamic::from_map(input_tabs));
        ctx.insert("fetch_result".into(), optional(request.fetch_result.as_ref())?);

        let value = self.call(CallKind::Render, (Dynamic::from(table), params, Dynamic::from_map(ctx)))?;
        let result = table_return(value, self.module_id, true).map_err(invalid_return)?;
        write_output(basedir, &request.output_filename, &result.table)?;
        Ok(RenderResult {
            table_filename: request.output_filename.clone(),
            errors: result.errors,
            json: result.json,
        })
    }

    fn fetch(&self, request: &FetchRequest) -> Outcome<FetchResult> {
        let basedir = Path::new(&request.basedir);
        let params = to_script(&params_to_json(&request.params))?;
        let secrets = to_script(&request.secrets)?;

        let mut ctx = rhai::Map::new();
        ctx.insert("basedir".into(), request.basedir.clone().into());
        ctx.insert("output_filename".into(), request.output_filename.clone().into());
        ctx.insert("last_fetch_result".into(), optional(request.last_fetch_result.as_ref())?);
        ctx.insert(
            "input_table_filename".into(),
            request
                .input_table_filename
                .clone()
                .map_or(Dynamic::UNIT, Dynamic::from),
        );

        let value = self.call(CallKind::Fetch, (params, secrets, Dynamic::from_map(ctx)))?;
        let result = table_return(value, self.module_id, false).map_err(invalid_return)?;
        write_output(basedir, &request.output_filename, &result.table)?;
        Ok(FetchResult {
            filename: request.output_filename.clone(),
            errors: result.errors,
        })
    }

    fn migrate_params(&self, request: &MigrateParamsRequest) -> Outcome<MigrateParamsResult> {
        let params = to_script(request.params.as_value())?;
        let value = self.call(CallKind::MigrateParams, (params,))?;
        let params = params_return(&value).map_err(invalid_return)?;
        Ok(MigrateParamsResult {
            params: RawParams::new(params),
        })
    }

    fn call(&self, kind: CallKind, args: impl FuncArgs) -> Outcome<Dynamic> {
        self.engine
            .call_fn::<Dynamic>(&mut Scope::new(), self.ast, kind.entry_point(), args)
            .map_err(|e| failure(FailureKind::ModuleError, e))
    }
}

fn tab_map(tab: &TabInfo) -> Dynamic {
    let mut map = rhai::Map::new();
    map.insert("slug".into(), tab.slug.clone().into());
    map.insert("name".into(), tab.name.clone().into());
    Dynamic::from_map(map)
}

fn load_table(basedir: &Path, name: &str) -> Outcome<ScriptTable> {
    let path = resolve_in(basedir, name).map_err(|e| failure(FailureKind::BadRequest, e))?;
    read_table(&path)
        .map(ScriptTable::from)
        .map_err(|e| failure(FailureKind::BadRequest, format!("input table {name:?}: {e}")))
}

fn write_output(basedir: &Path, name: &str, table: &Table) -> Outcome<()> {
    let path = resolve_in(basedir, name).map_err(|e| failure(FailureKind::BadRequest, e))?;
    write_table(&path, table).map_err(|e| match e {
        TableError::Io(e) => failure(FailureKind::ModuleError, format!("cannot write {name:?}: {e}")),
        other => invalid_return(other.to_string()),
    })
}

fn to_script<T: Serialize + ?Sized>(value: &T) -> Outcome<Dynamic> {
    rhai::serde::to_dynamic(value).map_err(|e| failure(FailureKind::BadRequest, e))
}

fn optional<T: Serialize>(value: Option<&T>) -> Outcome<Dynamic> {
    value.map_or(Ok(Dynamic::UNIT), to_script)
}

fn failure(kind: FailureKind, message: impl ToString) -> WorkerFailure {
    WorkerFailure::new(kind, message.to_string())
}

fn invalid_return(message: String) -> WorkerFailure {
    WorkerFailure::new(FailureKind::InvalidReturn, message)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
