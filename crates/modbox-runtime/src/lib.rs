//! modbox Module Runtime
//!
//! What runs inside a worker. [`ModuleRuntime`] is the zygote the
//! forkserver builds once and clones per invocation:
//! - [`host`]: the script engine and the host API modules call
//! - [`script_table`]: the `Table` type scripts see
//! - [`dispatch`]: compile, call the requested entry point, write output
//! - [`returns`]: the shapes an entry point may return

#![warn(unreachable_pub)]

pub mod dispatch;
pub mod host;
pub mod returns;
pub mod script_table;
pub mod zygote;

pub use dispatch::execute;
pub use host::module_engine;
pub use returns::{params_return, table_return, TableReturn};
pub use script_table::ScriptTable;
pub use zygote::{ModuleRuntime, RESPONSE_WRITE_FAILED_EXIT_CODE};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
