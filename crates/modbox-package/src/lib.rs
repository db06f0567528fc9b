//! modbox Module Package Loader
//!
//! Turns `(id, version)` into a [`ModulePackage`]:
//! 1. read `{root}/{id}/{id}.{version}.zip`
//! 2. extract one spec and one script ([`read_archive`])
//! 3. parse the spec, check it against the embedded schema, then check its
//!    cross-references ([`ModuleSpec::parse`])
//! 4. compile the script without running it ([`compile_module`])
//!
//! Loaded packages are cached per `(id, version)`, except `develop`.

#![warn(unreachable_pub)]

pub mod archive;
pub mod compile;
pub mod error;
pub mod loader;
pub mod package;
pub mod schema;
pub mod spec;

pub use archive::{read_archive, ArchiveContents, MAX_CODE_BYTES, MAX_SPEC_BYTES};
pub use compile::{compile_engine, compile_module, configure_parser, EntryPoints, ENTRY_POINTS};
pub use error::{CompileError, LoadError};
pub use loader::{archive_path, validate_name, LoaderConfig, PackageLoader};
pub use package::{ModulePackage, DEVELOP_VERSION};
pub use schema::MODULE_SPEC_SCHEMA;
pub use spec::{Deprecation, MenuOption, ModuleSpec, ParamSpec, ParamType, VisibleIf};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
