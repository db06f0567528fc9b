//! Compile without running
//!
//! `Engine::compile` parses a script into an AST and evaluates nothing, so a
//! hostile package is rejected before any of its statements execute. The
//! worker uses the same checks when it recompiles the code in-process.

use modbox_wire::CallKind;
use rhai::{Engine, AST};

use crate::error::CompileError;

/// Entry points a module may define, with their required arity
pub const ENTRY_POINTS: [(CallKind, usize); 3] =
    [(CallKind::Render, 3), (CallKind::Fetch, 3), (CallKind::MigrateParams, 1)];

/// Deepest expression nesting accepted at global level
const MAX_EXPR_DEPTH: usize = 128;

/// Deepest expression nesting accepted inside functions
const MAX_FN_EXPR_DEPTH: usize = 64;

/// Which entry points a script defines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryPoints {
    /// `render(table, params, ctx)`
    pub render: bool,
    /// `fetch(params, secrets, ctx)`
    pub fetch: bool,
    /// `migrate_params(params)`
    pub migrate_params: bool,
}

impl EntryPoints {
    /// Check for the entry point serving `kind`
    #[must_use]
    pub fn has(&self, kind: CallKind) -> bool {
        match kind {
            CallKind::Render => self.render,
            CallKind::Fetch => self.fetch,
            CallKind::MigrateParams => self.migrate_params,
        }
    }

    fn mark(&mut self, kind: CallKind) {
        match kind {
            CallKind::Render => self.render = true,
            CallKind::Fetch => self.fetch = true,
            CallKind::MigrateParams => self.migrate_params = true,
        }
    }
}

/// Engine used for load-time compilation
///
/// Carries no host functions; compiling never needs them.
#[must_use]
pub fn compile_engine() -> Engine {
    let mut engine = Engine::new_raw();
    configure_parser(&mut engine);
    engine
}

/// Apply the parser limits every modbox engine shares
pub fn configure_parser(engine: &mut Engine) {
    engine.set_max_expr_depths(MAX_EXPR_DEPTH, MAX_FN_EXPR_DEPTH);
}

/// Parse `source` and check its entry points
///
/// # Errors
///
/// Returns a positioned [`CompileError`] for syntax errors, and an
/// unpositioned one when an entry point has the wrong arity or neither
/// `render` nor `fetch` is defined.
pub fn compile_module(engine: &Engine, source: &str) -> Result<(AST, EntryPoints), CompileError> {
    let ast = engine.compile(source).map_err(|e| {
        let position = e.position();
        CompileError {
            line: position.line(),
            column: position.position(),
            message: e.err_type().to_string(),
        }
    })?;

    let mut found = EntryPoints::default();
    for function in ast.iter_functions() {
        let Some((kind, arity)) = ENTRY_POINTS.iter().find(|(kind, _)| kind.entry_point() == function.name) else {
            continue;
        };
        if function.params.len() != *arity {
            return Err(CompileError::unpositioned(format!(
                "{}() must take {arity} parameters, not {}",
                function.name,
                function.params.len()
            )));
        }
        found.mark(*kind);
    }

    if !found.render && !found.fetch {
        return Err(CompileError::unpositioned("module defines neither render() nor fetch()"));
    }
    Ok((ast, found))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn compile(source: &str) -> Result<EntryPoints, CompileError> {
        compile_module(&compile_engine(), source).map(|(_, entry_points)| entry_points)
    }

    #[test]
    fn finds_entry_points() {
        let found = compile("fn render(table, params, ctx) { table }\nfn migrate_params(p) { p }").unwrap();
        assert_eq!(
            found,
            EntryPoints {
                render: true,
                fetch: false,
                migrate_params: true
            }
        );
        assert!(found.has(CallKind::MigrateParams));
        assert!(!found.has(CallKind::Fetch));
    }

    #[test]
    fn syntax_errors_are_positioned() {
        let err = compile("fn render(table, params, ctx) {\n    let x = ;\n}").unwrap_err();
        assert_eq!(err.line, Some(2));
        assert!(err.column.is_some());
        assert!(!err.message.is_empty());
    }

    #[test]
    fn wrong_arity_is_rejected() {
        let err = compile("fn render(table) { table }").unwrap_err();
        assert_eq!(err.message, "render() must take 3 parameters, not 1");
        assert_eq!(err.line, None);
    }

    #[test]
    fn needs_render_or_fetch() {
        let err = compile("fn migrate_params(p) { p }").unwrap_err();
        assert!(err.message.contains("neither"), "{}", err.message);
    }

    #[test]
    fn compiling_runs_nothing() {
        // A top-level statement that would fail if evaluated.
        let found = compile("throw \"ran at load\";\nfn fetch(params, secrets, ctx) { () }").unwrap();
        assert!(found.fetch);
    }
}
