//! Testing utilities for the modbox workspace
//!
//! Table fixtures, package archives, and a catalog of module scripts that
//! exercise each way an invocation can end.

#![allow(missing_docs)]

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{ArrayRef, Int64Array, StringArray};
use modbox_table::{Column, ColumnType, Table};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Multiplies every value of column `A` by two
pub const DOUBLE: &str = r#"
fn render(table, params, ctx) {
    let doubled = table.column("A").map(|v| v * 2);
    table.set_column("A", doubled);
    table
}
"#;

/// Returns its input untouched
pub const IDENTITY: &str = "fn render(table, params, ctx) { table }";

/// Raises an unhandled error
pub const CRASH: &str = r#"
fn render(table, params, ctx) {
    throw "module crashed on purpose";
}
"#;

/// Sleeps for `params.ms` milliseconds
pub const SLEEP: &str = "fn render(table, params, ctx) { sleep_ms(params.ms); table }";

/// Never returns
pub const SPIN: &str = "fn render(table, params, ctx) { loop { } }";

/// Writes to `params.target`, wherever that is
pub const ESCAPE: &str = r#"
fn render(table, params, ctx) {
    write_text(params.target, "escaped");
    table
}
"#;

/// Returns the worker's `/proc/self/status` as a one-cell text table
pub const PROC_STATUS: &str = r#"
fn render(table, params, ctx) {
    let status = read_text("/proc/self/status");
    let t = new_table();
    t.set_column("status", [status]);
    t
}
"#;

/// Succeeds and writes a zero-byte output
pub const ZERO_BYTE: &str = "fn render(table, params, ctx) { () }";

/// Reports a plain-text and a structured error
pub const MODULE_ERROR: &str = r#"
fn render(table, params, ctx) {
    #{
        errors: [
            "column A must be text",
            #{
                id: "convert.needed",
                arguments: #{ column: "A" },
                quick_fixes: [#{
                    button_text: #{ id: "convert.button" },
                    action: #{ type: "prepend_step", module_slug: "converttexttonumber",
                               partial_params: #{ colnames: ["A"] } }
                }]
            }
        ]
    }
}
"#;

/// Claims success but writes a table whose format string is unsafe
pub const INVALID_OUTPUT: &str = r#"
fn render(table, params, ctx) {
    table.set_number_format("A", "{0}");
    table
}
"#;

/// Renames `multiplier` to `factor`
pub const MIGRATE: &str = r#"
fn render(table, params, ctx) { table }

fn migrate_params(params) {
    if "multiplier" in params {
        params.factor = params.multiplier;
        params.remove("multiplier");
    }
    params
}
"#;

/// Fetches a fixed three-row table; render passes the fetched table through
pub const FETCH: &str = r#"
fn fetch(params, secrets, ctx) {
    let t = new_table();
    t.set_column("n", [1, 2, 3]);
    #{ table: t, errors: if secrets.contains("token") { [] } else { ["no token"] } }
}

fn render(table, params, ctx) {
    if ctx.fetch_result == () {
        return "nothing fetched yet";
    }
    read_table(ctx.basedir + "/" + ctx.fetch_result.filename)
}
"#;

/// A minimal module spec for `id`
#[must_use]
pub fn module_spec_yaml(id: &str, loads_data: bool) -> String {
    format!(
        "id_name: {id}\nname: {id}\ncategory: {category}\nloads_data: {loads_data}\nparameters: []\n",
        category = if loads_data { "Add data" } else { "Clean" },
    )
}

/// Zip archive of text entries
#[must_use]
pub fn zip_text(entries: &[(&str, &str)]) -> Vec<u8> {
    let entries: Vec<(&str, &[u8])> = entries.iter().map(|(name, text)| (*name, text.as_bytes())).collect();
    zip_bytes(&entries)
}

/// Zip archive of binary entries
#[must_use]
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, bytes) in entries {
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(bytes).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Write `{root}/{id}/{id}.{version}.zip` holding `spec` and `code`
pub fn write_package(root: &Path, id: &str, version: &str, spec: &str, code: &str) -> PathBuf {
    let dir = root.join(id);
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{id}.{version}.zip"));
    let spec_name = format!("{id}.yaml");
    let code_name = format!("{id}.rhai");
    std::fs::write(&path, zip_text(&[(&spec_name, spec), (&code_name, code)])).unwrap();
    path
}

/// One Int64 number column
#[must_use]
pub fn number_table(name: &str, values: &[i64]) -> Table {
    let array: ArrayRef = Arc::new(Int64Array::from(values.to_vec()));
    Table::try_new(vec![Column::new(name, ColumnType::number())], vec![array]).unwrap()
}

/// One Utf8 text column
#[must_use]
pub fn text_table(name: &str, values: &[Option<&str>]) -> Table {
    let array: ArrayRef = Arc::new(StringArray::from(values.to_vec()));
    Table::try_new(vec![Column::new(name, ColumnType::Text)], vec![array]).unwrap()
}
