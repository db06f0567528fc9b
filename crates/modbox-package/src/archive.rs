//! Package archive layout
//!
//! A package is a zip holding exactly one spec (`{id}.yaml`, `.yml` or
//! `.json`) and exactly one script (`*.rhai`) at its top level. Entries in
//! subdirectories, directories themselves, and files named `test_*` are
//! ignored.

use std::io::{Cursor, Read};

use zip::ZipArchive;

use crate::error::LoadError;

/// Largest spec file accepted
pub const MAX_SPEC_BYTES: u64 = 1024 * 1024;

/// Largest code file accepted
pub const MAX_CODE_BYTES: u64 = 4 * 1024 * 1024;

const SPEC_EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];
const CODE_EXTENSION: &str = "rhai";

/// Spec and code extracted from an archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveContents {
    /// Spec file name
    pub spec_name: String,
    /// Spec file bytes
    pub spec: Vec<u8>,
    /// Code file name
    pub code_name: String,
    /// Code text
    pub code: String,
}

enum Role {
    Spec,
    Code,
}

fn classify(name: &str) -> Option<Role> {
    if name.contains('/') || name.starts_with("test_") {
        return None;
    }
    let (_, extension) = name.rsplit_once('.')?;
    if extension == CODE_EXTENSION {
        Some(Role::Code)
    } else if SPEC_EXTENSIONS.contains(&extension) {
        Some(Role::Spec)
    } else {
        None
    }
}

/// Extract the spec and code of package `id` from zip bytes
///
/// # Errors
///
/// Returns [`LoadError::Archive`] when the bytes are not a zip, a file is
/// missing, duplicated, misnamed or oversized, or the code is not UTF-8.
pub fn read_archive(bytes: &[u8], id: &str) -> Result<ArchiveContents, LoadError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let mut spec: Option<(String, Vec<u8>)> = None;
    let mut code: Option<(String, Vec<u8>)> = None;

    for index in 0..archive.len() {
        let entry = archive.by_index(index)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let (slot, limit, what) = match classify(&name) {
            Some(Role::Spec) => (&mut spec, MAX_SPEC_BYTES, "spec"),
            Some(Role::Code) => (&mut code, MAX_CODE_BYTES, "code"),
            None => continue,
        };
        if let Some((first, _)) = slot {
            return Err(LoadError::Archive(format!("multiple {what} files: {first} and {name}")));
        }
        if entry.size() > limit {
            return Err(LoadError::Archive(format!("{name} is larger than {limit} bytes")));
        }
        // The declared size can lie; never read past the limit.
        let mut content = Vec::new();
        entry
            .take(limit + 1)
            .read_to_end(&mut content)
            .map_err(|e| LoadError::Archive(format!("{name}: {e}")))?;
        if content.len() as u64 > limit {
            return Err(LoadError::Archive(format!("{name} is larger than {limit} bytes")));
        }
        *slot = Some((name, content));
    }

    let (spec_name, spec) = spec.ok_or_else(|| LoadError::Archive("missing spec file (.yaml, .yml or .json)".into()))?;
    let (code_name, code) = code.ok_or_else(|| LoadError::Archive("missing code file (.rhai)".into()))?;

    let stem = spec_name.rsplit_once('.').map_or(spec_name.as_str(), |(stem, _)| stem);
    if stem != id {
        return Err(LoadError::Archive(format!("spec file {spec_name} must be named after module {id}")));
    }
    let code = String::from_utf8(code).map_err(|_| LoadError::Archive(format!("{code_name} is not UTF-8")))?;

    Ok(ArchiveContents {
        spec_name,
        spec,
        code_name,
        code,
    })
}
