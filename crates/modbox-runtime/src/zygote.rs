//! The zygote the forkserver clones
//!
//! Built once in the broker, so engine setup and host function registration
//! are paid for once. A forked child reads one `WorkerInvocation` frame from
//! stdin, writes one `InvocationResponse` frame to stdout, and exits.

use std::io::{Read, Write};

use modbox_pool::Zygote;
use modbox_wire::{
    read_frame, write_frame, FailureKind, FrameKind, InvocationResponse, WireError, WorkerFailure, WorkerInvocation,
};
use rhai::Engine;
use tracing::{debug, error};

use crate::dispatch::execute;
use crate::host::module_engine;

/// Exit code of a worker that could not write its response
pub const RESPONSE_WRITE_FAILED_EXIT_CODE: i32 = 1;

/// Pre-built script engine plus the worker request loop
pub struct ModuleRuntime {
    engine: Engine,
}

impl std::fmt::Debug for ModuleRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRuntime").finish_non_exhaustive()
    }
}

impl Default for ModuleRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleRuntime {
    /// Build the engine and register the host API
    #[must_use]
    pub fn new() -> Self {
        Self {
            engine: module_engine(),
        }
    }

    /// The engine every invocation runs on
    #[inline]
    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Run one decoded invocation in this process
    #[must_use]
    pub fn execute(&self, invocation: &WorkerInvocation) -> InvocationResponse {
        execute(&self.engine, invocation)
    }

    /// Read one invocation frame from `input` and answer it on `output`
    ///
    /// A frame that does not decode is answered with a `bad_request`
    /// failure.
    ///
    /// # Errors
    ///
    /// Fails only when the response cannot be written.
    pub fn serve<R: Read, W: Write>(&self, input: &mut R, output: &mut W) -> Result<InvocationResponse, WireError> {
        let response = match read_frame::<_, WorkerInvocation>(input, FrameKind::WorkerInvocation) {
            Ok(invocation) => {
                debug!(
                    module = %invocation.code.module_id,
                    version = %invocation.code.version,
                    kind = %invocation.request.call_kind(),
                    "invocation received"
                );
                self.execute(&invocation)
            }
            Err(e) => InvocationResponse::Failed(WorkerFailure::new(
                FailureKind::BadRequest,
                format!("cannot read invocation: {e}"),
            )),
        };
        write_frame(output, FrameKind::InvocationResponse, &response)?;
        Ok(response)
    }
}

impl Zygote for ModuleRuntime {
    fn run_worker(&self) -> i32 {
        let stdin = std::io::stdin();
        let stdout = std::io::stdout();
        match self.serve(&mut stdin.lock(), &mut stdout.lock()) {
            Ok(_) => 0,
            Err(e) => {
                error!(error = %e, "cannot write response");
                RESPONSE_WRITE_FAILED_EXIT_CODE
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modbox_wire::{decode_frame, encode_frame, CodeUnit, InvocationRequest, MigrateParamsRequest, RawParams};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn migrate_invocation(source: &str) -> WorkerInvocation {
        WorkerInvocation {
            code: CodeUnit {
                module_id: "migrate".into(),
                version: "abc".into(),
                source: source.into(),
            },
            request: InvocationRequest::MigrateParams(MigrateParamsRequest {
                params: RawParams::new(json!({"factor": 1})),
            }),
        }
    }

    #[test]
    fn serves_one_frame() {
        let runtime = ModuleRuntime::new();
        let frame = encode_frame(
            FrameKind::WorkerInvocation,
            &migrate_invocation("fn render(t, p, c) { t }\nfn migrate_params(p) { p.factor = p.factor * 10; p }"),
        )
        .unwrap();

        let mut output = Vec::new();
        let response = runtime.serve(&mut frame.as_slice(), &mut output).unwrap();
        assert!(response.is_ok());

        let decoded: InvocationResponse = decode_frame(&output, FrameKind::InvocationResponse).unwrap();
        assert_eq!(decoded, response);
        let InvocationResponse::Ok {
            output: modbox_wire::InvocationOutput::MigrateParams(result),
        } = decoded
        else {
            panic!("expected migrate_params output");
        };
        assert_eq!(result.params.as_value(), &json!({"factor": 10}));
    }

    #[test]
    fn garbage_input_is_a_bad_request() {
        let runtime = ModuleRuntime::new();
        let mut output = Vec::new();
        let response = runtime.serve(&mut &b"\x00\x00\x00\x02\x00\x01\x00\x01{}"[..], &mut output).unwrap();
        let InvocationResponse::Failed(failure) = response else {
            panic!("expected failure");
        };
        assert_eq!(failure.error_kind, FailureKind::BadRequest);
        assert!(!output.is_empty());
    }

    #[test]
    fn unwritable_output_is_an_error() {
        struct Closed;
        impl Write for Closed {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(std::io::ErrorKind::BrokenPipe.into())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        let runtime = ModuleRuntime::new();
        let frame = encode_frame(FrameKind::WorkerInvocation, &migrate_invocation("fn render(t, p, c) { t }")).unwrap();
        assert!(runtime.serve(&mut frame.as_slice(), &mut Closed).is_err());
    }
}
