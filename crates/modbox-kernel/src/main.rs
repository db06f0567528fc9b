//! `modbox` command-line entry point

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use modbox_kernel::{
    init_tracing, Invocation, InvocationResponse, Kernel, KernelConfig, LogConfig, LogFormat,
};
use modbox_package::PackageLoader;
use modbox_pool::{control_from_inherited_fd, run_broker, SandboxPolicy};
use modbox_runtime::ModuleRuntime;
use modbox_table::{read_table, write_table, Table, TableValidator};
use modbox_wire::{CallKind, ParamValue, Params, RawParams, TabInfo};
use serde_json::{json, Value};

const INPUT_FILENAME: &str = "input.arrow";

fn cli() -> Command {
    let config_arg = Arg::new("config")
        .long("config")
        .value_parser(value_parser!(PathBuf))
        .help("Kernel configuration file (TOML)");

    Command::new("modbox")
        .version(modbox_kernel::VERSION)
        .about("Sandboxed execution kernel for table-transform modules")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("forkserver")
                .about("Run the worker broker (started by the kernel)")
                .hide(true)
                .arg(
                    Arg::new("policy")
                        .long("policy")
                        .required(true)
                        .help("Sandbox policy as JSON"),
                ),
        )
        .subcommand(
            Command::new("certify")
                .about("Validate an Arrow IPC file as a module output table")
                .arg(
                    Arg::new("file")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Table file to check"),
                )
                .arg(config_arg.clone()),
        )
        .subcommand(
            Command::new("check-package")
                .about("Load and compile a module package")
                .arg(
                    Arg::new("root")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Package root directory"),
                )
                .arg(Arg::new("module").required(true).help("Module id"))
                .arg(Arg::new("version").required(true).help("Module version")),
        )
        .subcommand(
            Command::new("invoke")
                .about("Run one module call and print the certified result")
                .arg(config_arg)
                .arg(
                    Arg::new("root")
                        .long("root")
                        .value_parser(value_parser!(PathBuf))
                        .help("Package root directory (overrides config)"),
                )
                .arg(Arg::new("module").long("module").required(true).help("Module id"))
                .arg(Arg::new("version").long("version").required(true).help("Module version"))
                .arg(
                    Arg::new("kind")
                        .long("kind")
                        .default_value("render")
                        .value_parser(["render", "fetch", "migrate-params"])
                        .help("Entry point to call"),
                )
                .arg(
                    Arg::new("input")
                        .long("input")
                        .value_parser(value_parser!(PathBuf))
                        .help("Input table (Arrow IPC file) for render"),
                )
                .arg(
                    Arg::new("params")
                        .long("params")
                        .default_value("{}")
                        .help("Parameters as a JSON object"),
                )
                .arg(
                    Arg::new("timeout-ms")
                        .long("timeout-ms")
                        .default_value("30000")
                        .value_parser(value_parser!(u64))
                        .help("Invocation deadline in milliseconds"),
                )
                .arg(
                    Arg::new("output")
                        .long("output")
                        .value_parser(value_parser!(PathBuf))
                        .help("Write the output table here"),
                )
                .arg(
                    Arg::new("json-logs")
                        .long("json-logs")
                        .action(ArgAction::SetTrue)
                        .help("Log as JSON lines"),
                ),
        )
}

// The broker forks, so it must not start a Tokio runtime. Every other
// subcommand builds one itself.
fn main() -> Result<()> {
    let matches = cli().get_matches();
    match matches.subcommand() {
        Some(("forkserver", args)) => forkserver(args),
        Some(("certify", args)) => certify(args),
        Some(("check-package", args)) => runtime()?.block_on(check_package(args)),
        Some(("invoke", args)) => runtime()?.block_on(invoke(args)),
        _ => unreachable!("subcommand_required"),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("cannot start async runtime")
}

fn load_config(args: &ArgMatches) -> Result<KernelConfig> {
    match args.get_one::<PathBuf>("config") {
        Some(path) => Ok(KernelConfig::load(path)?),
        None => Ok(KernelConfig::new()),
    }
}

fn forkserver(args: &ArgMatches) -> Result<()> {
    init_tracing(&LogConfig::default());
    let Some(text) = args.get_one::<String>("policy") else {
        bail!("missing --policy");
    };
    let policy: SandboxPolicy = serde_json::from_str(text).context("invalid --policy")?;
    let control = control_from_inherited_fd()?;
    let runtime = ModuleRuntime::new();
    run_broker(control, policy, &runtime)?;
    Ok(())
}

fn certify(args: &ArgMatches) -> Result<()> {
    let config = load_config(args)?;
    init_tracing(&config.log);
    let Some(path) = args.get_one::<PathBuf>("file") else {
        bail!("missing file");
    };
    let certified = TableValidator::new(config.table).certify(path)?;
    let summary = json!({
        "rows": certified.table.num_rows(),
        "columns": certified.table.columns(),
        "warnings": certified.warnings,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn check_package(args: &ArgMatches) -> Result<()> {
    init_tracing(&LogConfig::default());
    let (Some(root), Some(id), Some(version)) = (
        args.get_one::<PathBuf>("root"),
        args.get_one::<String>("module"),
        args.get_one::<String>("version"),
    ) else {
        bail!("missing arguments");
    };
    let mut config = KernelConfig::new().with_package_root(root);
    config.packages.cache_capacity = 1;
    let loader = PackageLoader::new(&config.packages);
    let package = loader.load(id, version).await?;
    let entry_points = package.entry_points();
    let summary = json!({
        "id": package.id(),
        "version": package.version(),
        "content_hash": package.content_hash(),
        "uses_data": package.spec().uses_data(),
        "entry_points": {
            "render": entry_points.render,
            "fetch": entry_points.fetch,
            "migrate_params": entry_points.migrate_params,
        },
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn invoke(args: &ArgMatches) -> Result<()> {
    let mut config = load_config(args)?;
    if let Some(root) = args.get_one::<PathBuf>("root") {
        config = config.with_package_root(root);
    }
    if args.get_flag("json-logs") {
        config.log.format = LogFormat::Json;
    }
    init_tracing(&config.log);

    let (Some(id), Some(version), Some(kind), Some(params), Some(timeout_ms)) = (
        args.get_one::<String>("module"),
        args.get_one::<String>("version"),
        args.get_one::<String>("kind"),
        args.get_one::<String>("params"),
        args.get_one::<u64>("timeout-ms"),
    ) else {
        bail!("missing arguments");
    };
    let kind = match kind.as_str() {
        "fetch" => CallKind::Fetch,
        "migrate-params" => CallKind::MigrateParams,
        _ => CallKind::Render,
    };
    let params: Value = serde_json::from_str(params).context("--params is not JSON")?;

    let kernel = Kernel::start(config)?;
    let scratch = kernel.scratch_dir()?;
    let invocation = match kind {
        CallKind::Render => {
            let input = match args.get_one::<PathBuf>("input") {
                Some(path) => read_table(path).with_context(|| format!("cannot read {}", path.display()))?,
                None => Table::empty(),
            };
            scratch.write_table(INPUT_FILENAME, &input)?;
            let tab = TabInfo {
                slug: "tab-1".to_string(),
                name: "Tab 1".to_string(),
            };
            Invocation::render(scratch, INPUT_FILENAME, params_from_json(&params)?, tab)
        }
        CallKind::Fetch => Invocation::fetch(scratch, params_from_json(&params)?, BTreeMap::new()),
        CallKind::MigrateParams => Invocation::migrate_params(scratch, RawParams::new(params)),
    };

    let result = kernel
        .invoke_module(id, version, invocation, Duration::from_millis(*timeout_ms))
        .await;
    kernel.shutdown()?;
    let response = result?;
    print_response(&response, args.get_one::<PathBuf>("output").map(PathBuf::as_path))
}

fn print_response(response: &InvocationResponse, output: Option<&Path>) -> Result<()> {
    let (table, summary) = match response {
        InvocationResponse::Render(outcome) => (
            Some(&outcome.table),
            json!({
                "kind": "render",
                "rows": outcome.table.num_rows(),
                "columns": outcome.table.columns(),
                "errors": outcome.errors,
                "json": outcome.json,
                "warnings": outcome.warnings,
            }),
        ),
        InvocationResponse::Fetch(outcome) => (
            Some(&outcome.table),
            json!({
                "kind": "fetch",
                "rows": outcome.table.num_rows(),
                "columns": outcome.table.columns(),
                "errors": outcome.errors,
                "warnings": outcome.warnings,
            }),
        ),
        InvocationResponse::MigrateParams(params) => (
            None,
            json!({
                "kind": "migrate_params",
                "params": params,
            }),
        ),
    };
    match (table, output) {
        (Some(table), Some(path)) => {
            write_table(path, table).with_context(|| format!("cannot write {}", path.display()))?;
        }
        (None, Some(path)) => tracing::warn!(path = %path.display(), "no output table; --output ignored"),
        _ => {}
    }
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Untyped JSON to wire parameters
///
/// Strings stay strings; callers with a module spec at hand should type
/// column, tab and filename references themselves.
fn params_from_json(value: &Value) -> Result<Params> {
    let Value::Object(map) = value else {
        bail!("--params must be a JSON object");
    };
    Ok(map.iter().map(|(k, v)| (k.clone(), param_value(v))).collect())
}

fn param_value(value: &Value) -> ParamValue {
    match value {
        Value::Null => ParamValue::Null,
        Value::Bool(b) => ParamValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => ParamValue::Integer(i),
            None => ParamValue::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => ParamValue::String(s.clone()),
        Value::Array(items) => ParamValue::List(items.iter().map(param_value).collect()),
        Value::Object(map) => ParamValue::Map(map.iter().map(|(k, v)| (k.clone(), param_value(v))).collect()),
    }
}
