//! Loaded module package

use std::fmt;

use modbox_wire::{CallKind, CodeUnit};
use rhai::{Engine, AST};
use tracing::debug;

use crate::archive::read_archive;
use crate::compile::{compile_module, EntryPoints};
use crate::error::{CompileError, LoadError};
use crate::spec::ModuleSpec;

/// Mutable version that bypasses every cache
pub const DEVELOP_VERSION: &str = "develop";

/// Spec plus compiled-but-not-run code of one `(id, version)`
#[derive(Clone)]
pub struct ModulePackage {
    id: String,
    version: String,
    spec: ModuleSpec,
    source: String,
    ast: AST,
    entry_points: EntryPoints,
    content_hash: String,
}

impl fmt::Debug for ModulePackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModulePackage")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("entry_points", &self.entry_points)
            .field("content_hash", &self.content_hash)
            .finish_non_exhaustive()
    }
}

impl ModulePackage {
    /// Unpack, validate and compile archive bytes
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::Archive`], [`LoadError::Spec`] or
    /// [`LoadError::Compile`]; nothing in the archive is executed.
    pub fn from_archive(engine: &Engine, id: &str, version: &str, bytes: &[u8]) -> Result<Self, LoadError> {
        let content_hash = blake3::hash(bytes).to_hex().to_string();
        let contents = read_archive(bytes, id)?;
        let spec = ModuleSpec::parse(&contents.spec, id)?;
        let (ast, entry_points) = compile_module(engine, &contents.code)?;
        if spec.loads_data && !entry_points.fetch {
            return Err(CompileError::unpositioned("module declares loads_data but defines no fetch()").into());
        }
        debug!(id, version, hash = %&content_hash[..16], ?entry_points, "package compiled");
        Ok(Self {
            id: id.to_string(),
            version: version.to_string(),
            spec,
            source: contents.code,
            ast,
            entry_points,
            content_hash,
        })
    }

    /// Module id
    #[inline]
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Module version
    #[inline]
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Parsed spec
    #[inline]
    #[must_use]
    pub fn spec(&self) -> &ModuleSpec {
        &self.spec
    }

    /// Script source
    #[inline]
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Compiled script
    #[inline]
    #[must_use]
    pub fn ast(&self) -> &AST {
        &self.ast
    }

    /// Entry points the script defines
    #[inline]
    #[must_use]
    pub fn entry_points(&self) -> EntryPoints {
        self.entry_points
    }

    /// Check for the entry point serving `kind`
    #[inline]
    #[must_use]
    pub fn has_entry_point(&self, kind: CallKind) -> bool {
        self.entry_points.has(kind)
    }

    /// blake3 of the archive bytes, hex
    #[inline]
    #[must_use]
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Check for the mutable development version
    #[inline]
    #[must_use]
    pub fn is_develop(&self) -> bool {
        self.version == DEVELOP_VERSION
    }

    /// Code as shipped to a worker
    #[must_use]
    pub fn code_unit(&self) -> CodeUnit {
        CodeUnit {
            module_id: self.id.clone(),
            version: self.version.clone(),
            source: self.source.clone(),
        }
    }
}
