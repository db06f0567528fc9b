//! modbox Kernel
//!
//! Runs untrusted, versioned table-transform modules on behalf of a host.
//! Each call gets a fresh sandboxed worker forked from a pre-warmed broker,
//! a private scratch directory, a hard deadline, and a certified result:
//! - [`Kernel`]: start, invoke, shut down
//! - [`Invocation`]: one request bound to its [`ScratchDir`]
//! - [`InvocationResponse`]: certified render, fetch or migration output
//! - [`InvokeError`]: every way a call can fail, none fatal to the host
//! - [`KernelConfig`]: limits, sandbox, buffers, logging
//!
//! ```no_run
//! use std::time::Duration;
//! use modbox_kernel::{Invocation, Kernel, KernelConfig};
//! use modbox_wire::{Params, TabInfo};
//!
//! # async fn demo(table: modbox_table::Table) -> Result<(), Box<dyn std::error::Error>> {
//! let kernel = Kernel::start(KernelConfig::new().with_package_root("/srv/modules"))?;
//! let scratch = kernel.scratch_dir()?;
//! scratch.write_table("input.arrow", &table)?;
//! let tab = TabInfo { slug: "tab-1".into(), name: "Tab 1".into() };
//! let invocation = Invocation::render(scratch, "input.arrow", Params::new(), tab);
//! let response = kernel
//!     .invoke_module("double", "1f2e3d", invocation, Duration::from_secs(30))
//!     .await?;
//! # drop(response);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod config;
pub mod error;
pub mod invocation;
pub mod kernel;
pub mod logging;
pub mod response;
pub mod scratch;

pub use config::{KernelConfig, LimitsConfig, SandboxConfig};
pub use error::{ConfigError, InvokeError};
pub use invocation::{Invocation, OUTPUT_FILENAME};
pub use kernel::Kernel;
pub use logging::{init_tracing, LogConfig, LogFormat};
pub use response::{FetchOutcome, InvocationResponse, RenderOutcome};
pub use scratch::{ScratchDir, ScratchError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
