//! modbox Wire Schema
//!
//! Fixed, versioned messages exchanged between the orchestrator and a
//! sandboxed worker:
//! - `WorkerInvocation`: module code plus one render, fetch or
//!   parameter-migration request
//! - `InvocationResponse`: a tagged success value or a worker failure
//! - localizable module errors with quick fixes
//! - length-prefixed frames carrying JSON payloads
//!
//! Tables never travel inline. Messages name files inside the invocation's
//! scratch directory, and every such name passes [`validate_filename`].

#![warn(unreachable_pub)]

pub mod error;
pub mod filename;
pub mod frame;
pub mod i18n;
pub mod message;
pub mod params;

pub use error::WireError;
pub use filename::{resolve_in, validate_filename, MAX_FILENAME_BYTES};
pub use frame::{
    decode_frame, encode_frame, read_frame, write_frame, FrameKind, FRAME_HEADER_BYTES,
    FRAME_MAX_PAYLOAD_BYTES, PROTOCOL_VERSION,
};
pub use i18n::{
    I18nArgument, I18nMessage, I18nSource, QuickFix, QuickFixAction, RenderError,
    PLAIN_TEXT_MESSAGE_ID,
};
pub use message::{
    CallKind, CodeUnit, FailureKind, FetchRequest, FetchResult, InvocationOutput,
    InvocationRequest, InvocationResponse, MigrateParamsRequest, MigrateParamsResult,
    RenderRequest, RenderResult, TabInfo, TabOutput, WorkerFailure, WorkerInvocation,
};
pub use params::{params_to_json, ParamValue, Params, RawParams};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
