//! Script engine and host API
//!
//! Built once in the zygote; every worker inherits it through fork. Module
//! output to `print` and `debug` goes to stderr, the log channel, so the
//! response channel carries nothing but the response frame.

use std::path::Path;
use std::time::Duration;

use modbox_package::configure_parser;
use rhai::{Dynamic, Engine, EvalAltResult, ImmutableString};

use crate::script_table::ScriptTable;

type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

/// Longest single `sleep_ms` accepted
const MAX_SLEEP_MS: i64 = 24 * 60 * 60 * 1000;

/// Engine with the module host API registered
#[must_use]
pub fn module_engine() -> Engine {
    let mut engine = Engine::new();
    configure_parser(&mut engine);

    engine.on_print(|text| eprintln!("{text}"));
    engine.on_debug(|text, source, position| match source {
        Some(source) => eprintln!("[debug] {source} @ {position}: {text}"),
        None => eprintln!("[debug] {position}: {text}"),
    });

    register_table(&mut engine);
    register_files(&mut engine);
    engine
}

fn register_table(engine: &mut Engine) {
    engine
        .register_type_with_name::<ScriptTable>("Table")
        .register_fn("new_table", ScriptTable::default)
        .register_fn("num_rows", |t: &mut ScriptTable| i64::try_from(t.num_rows()).unwrap_or(i64::MAX))
        .register_fn("column_names", |t: &mut ScriptTable| -> rhai::Array {
            t.column_names().into_iter().map(Dynamic::from).collect()
        })
        .register_fn("column", |t: &mut ScriptTable, name: &str| t.column_values(name))
        .register_fn("column_type", |t: &mut ScriptTable, name: &str| t.column_type(name))
        .register_fn("number_format", |t: &mut ScriptTable, name: &str| t.number_format(name))
        .register_fn("set_column", |t: &mut ScriptTable, name: &str, values: rhai::Array| {
            t.set_column(name, &values)
        })
        .register_fn(
            "set_timestamp_column",
            |t: &mut ScriptTable, name: &str, values: rhai::Array| t.set_timestamp_column(name, &values),
        )
        .register_fn(
            "set_date_column",
            |t: &mut ScriptTable, name: &str, values: rhai::Array, unit: &str| t.set_date_column(name, &values, unit),
        )
        .register_fn("set_number_format", |t: &mut ScriptTable, name: &str, format: &str| {
            t.set_number_format(name, format)
        })
        .register_fn("remove_column", |t: &mut ScriptTable, name: &str| t.remove_column(name))
        .register_fn("rename_column", |t: &mut ScriptTable, from: &str, to: &str| t.rename_column(from, to));
}

fn register_files(engine: &mut Engine) {
    engine
        .register_fn("read_text", |path: &str| -> ScriptResult<String> {
            std::fs::read_to_string(path).map_err(|e| format!("read_text({path:?}): {e}").into())
        })
        .register_fn("write_text", |path: &str, text: ImmutableString| -> ScriptResult<()> {
            std::fs::write(path, text.as_bytes()).map_err(|e| format!("write_text({path:?}): {e}").into())
        })
        .register_fn("read_table", |path: &str| -> ScriptResult<ScriptTable> {
            modbox_table::read_table(Path::new(path))
                .map(ScriptTable::from)
                .map_err(|e| format!("read_table({path:?}): {e}").into())
        })
        .register_fn("sleep_ms", |ms: i64| -> ScriptResult<()> {
            let ms = u64::try_from(ms.clamp(0, MAX_SLEEP_MS)).unwrap_or_default();
            std::thread::sleep(Duration::from_millis(ms));
            Ok(())
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn table_api_from_script() {
        let engine = module_engine();
        let names: rhai::Array = engine
            .eval(
                r#"
                let t = new_table();
                t.set_column("A", [1, 2, 3]);
                t.set_column("B", ["x", (), "z"]);
                t.rename_column("B", "C");
                t.column_names()
                "#,
            )
            .unwrap();
        let names: Vec<String> = names.into_iter().map(|n| n.into_string().unwrap()).collect();
        assert_eq!(names, vec!["A", "C"]);
    }

    #[test]
    fn table_errors_are_script_errors() {
        let engine = module_engine();
        let err = engine.eval::<Dynamic>(r#"let t = new_table(); t.column("nope")"#).unwrap_err();
        assert!(err.to_string().contains("no column named"), "{err}");
    }

    #[test]
    fn files_relative_to_cwd_or_absolute() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        let engine = module_engine();
        let script = format!(r#"write_text("{0}", "hello"); read_text("{0}")"#, path.display());
        let text: String = engine.eval(&script).unwrap();
        assert_eq!(text, "hello");
        assert!(engine.eval::<Dynamic>(r#"read_text("/definitely/not/here")"#).is_err());
    }
}
