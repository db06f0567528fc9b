//! End-to-end invocations through a real broker and real workers
//!
//! The `modbox` binary built alongside these tests serves as the broker.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use arrow::util::display::array_value_to_string;

use modbox_kernel::{Invocation, InvocationResponse, InvokeError, Kernel, KernelConfig};
use modbox_pool::{Confinement, WorkerExit, SANDBOX_FAILURE_EXIT_CODE};
use nix::sys::signal::Signal;
use nix::unistd::Uid;
use modbox_table::{Table, ValidationError};
use modbox_test_utils::{
    module_spec_yaml, number_table, write_package, CRASH, DOUBLE, ESCAPE, FETCH, IDENTITY, INVALID_OUTPUT, MIGRATE,
    MODULE_ERROR, PROC_STATUS, SLEEP, SPIN, ZERO_BYTE,
};
use modbox_wire::{ParamValue, Params, RawParams, TabInfo, PLAIN_TEXT_MESSAGE_ID};
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

const VERSION: &str = "abc123";
const TIMEOUT: Duration = Duration::from_secs(30);

struct Harness {
    kernel: Kernel,
    packages: TempDir,
    scratch_root: TempDir,
}

impl Harness {
    fn start(confinement: Confinement) -> Self {
        Self::with_config(|config| config.with_confinement(confinement))
    }

    fn with_config(configure: impl FnOnce(KernelConfig) -> KernelConfig) -> Self {
        let packages = tempfile::tempdir().unwrap();
        let scratch_root = tempfile::tempdir().unwrap();
        let config = configure(
            KernelConfig::new()
                .with_forkserver_program(env!("CARGO_BIN_EXE_modbox"))
                .with_package_root(packages.path())
                .with_scratch_root(scratch_root.path()),
        );
        Self {
            kernel: Kernel::start(config).unwrap(),
            packages,
            scratch_root,
        }
    }

    fn publish(&self, id: &str, code: &str) {
        write_package(self.packages.path(), id, VERSION, &module_spec_yaml(id, false), code);
    }

    fn render_invocation(&self, input: &Table, params: Params) -> Invocation {
        let scratch = self.kernel.scratch_dir().unwrap();
        scratch.write_table("input.arrow", input).unwrap();
        let tab = TabInfo {
            slug: "tab-1".into(),
            name: "Tab 1".into(),
        };
        Invocation::render(scratch, "input.arrow", params, tab)
    }

    async fn render(&self, id: &str, input: &Table, params: Params, timeout: Duration) -> Result<InvocationResponse, InvokeError> {
        let invocation = self.render_invocation(input, params);
        self.kernel.invoke_module(id, VERSION, invocation, timeout).await
    }

    fn scratch_entries(&self) -> usize {
        std::fs::read_dir(self.scratch_root.path()).unwrap().count()
    }
}

fn params(entries: &[(&str, ParamValue)]) -> Params {
    entries.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn double_renders_in_a_worker() {
    let harness = Harness::start(Confinement::BestEffort);
    harness.publish("double", DOUBLE);

    let outcome = harness
        .render("double", &number_table("A", &[1, 2, 3]), Params::new(), TIMEOUT)
        .await
        .unwrap()
        .into_render()
        .unwrap();

    assert_eq!(outcome.table, number_table("A", &[2, 4, 6]));
    assert!(outcome.errors.is_empty());
    assert!(outcome.warnings.is_empty());
    assert_eq!(harness.scratch_entries(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn identity_round_trips_the_input() {
    let harness = Harness::start(Confinement::BestEffort);
    harness.publish("identity", IDENTITY);
    let input = number_table("A", &[7, -1, 0]);

    let outcome = harness
        .render("identity", &input, Params::new(), TIMEOUT)
        .await
        .unwrap()
        .into_render()
        .unwrap();
    assert_eq!(outcome.table, input);
}

#[tokio::test(flavor = "multi_thread")]
async fn zero_byte_output_is_an_empty_table() {
    let harness = Harness::start(Confinement::BestEffort);
    harness.publish("nothing", ZERO_BYTE);

    let outcome = harness
        .render("nothing", &number_table("A", &[1]), Params::new(), TIMEOUT)
        .await
        .unwrap()
        .into_render()
        .unwrap();
    assert_eq!(outcome.table, Table::empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn crash_is_reported_and_cleaned_up() {
    let harness = Harness::start(Confinement::BestEffort);
    harness.publish("crash", CRASH);

    let err = harness
        .render("crash", &number_table("A", &[1]), Params::new(), TIMEOUT)
        .await
        .unwrap_err();
    let InvokeError::ModuleExited { diagnostic, .. } = &err else {
        panic!("expected ModuleExited, got {err:?}");
    };
    assert!(diagnostic.contains("module crashed on purpose"), "{diagnostic}");
    assert!(err.is_module_fault());
    assert_eq!(harness.scratch_entries(), 0);
    assert!(harness.kernel.is_healthy());
}

#[tokio::test(flavor = "multi_thread")]
async fn endless_loop_times_out() {
    let harness = Harness::start(Confinement::BestEffort);
    harness.publish("spin", SPIN);
    let timeout = Duration::from_millis(500);

    let started = Instant::now();
    let err = harness
        .render("spin", &number_table("A", &[1]), Params::new(), timeout)
        .await
        .unwrap_err();

    let InvokeError::ModuleTimeout { timeout: t, pid, .. } = err else {
        panic!("expected ModuleTimeout, got {err:?}");
    };
    assert_eq!(t, timeout);
    assert!(started.elapsed() < timeout + Duration::from_secs(5));
    assert!(!Path::new(&format!("/proc/{pid}")).exists(), "worker {pid} still in the process table");
    assert_eq!(harness.scratch_entries(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn cpu_limit_kills_the_worker() {
    let harness = Harness::with_config(|config| config.with_cpu_seconds(1));
    harness.publish("spin", SPIN);

    let err = harness
        .render("spin", &number_table("A", &[1]), Params::new(), TIMEOUT)
        .await
        .unwrap_err();
    let InvokeError::ModuleExited {
        exit: Some(WorkerExit::Signaled(signal)),
        diagnostic,
    } = &err
    else {
        panic!("expected a signal death, got {err:?}");
    };
    assert!(
        [Signal::SIGXCPU as i32, Signal::SIGKILL as i32].contains(signal),
        "{diagnostic}"
    );
    assert!(diagnostic.starts_with("killed by"), "{diagnostic}");
    assert!(err.is_module_fault());
    assert_eq!(harness.scratch_entries(), 0);
    assert!(harness.kernel.is_healthy());
}

#[tokio::test(flavor = "multi_thread")]
async fn workers_run_unprivileged() {
    let harness = Harness::start(Confinement::Disabled);
    harness.publish("whoami", PROC_STATUS);

    let outcome = harness
        .render("whoami", &number_table("A", &[1]), Params::new(), TIMEOUT)
        .await
        .unwrap()
        .into_render()
        .unwrap();
    let (_, array) = outcome.table.column("status").unwrap();
    let status = array_value_to_string(array, 0).unwrap();
    let field = |name: &str| {
        status
            .lines()
            .find_map(|line| line.strip_prefix(name))
            .map(str::trim)
            .unwrap_or_else(|| panic!("no {name} in {status}"))
            .to_string()
    };

    let uids: Vec<u32> = field("Uid:").split_whitespace().map(|id| id.parse().unwrap()).collect();
    assert!(uids.iter().all(|uid| *uid != 0), "{uids:?}");
    if Uid::effective().is_root() {
        assert!(uids.iter().all(|uid| *uid == 65534), "{uids:?}");
    }
    assert_eq!(u64::from_str_radix(&field("CapEff:"), 16).unwrap(), 0);
    assert_eq!(u64::from_str_radix(&field("CapPrm:"), 16).unwrap(), 0);
    assert_eq!(field("NoNewPrivs:"), "1");
    assert_eq!(field("Seccomp:"), "2");
}

#[tokio::test(flavor = "multi_thread")]
async fn timeout_is_capped_by_config() {
    let packages = tempfile::tempdir().unwrap();
    let scratch_root = tempfile::tempdir().unwrap();
    let config = KernelConfig::new()
        .with_forkserver_program(env!("CARGO_BIN_EXE_modbox"))
        .with_package_root(packages.path())
        .with_scratch_root(scratch_root.path())
        .with_max_timeout(Duration::from_millis(300));
    let kernel = Kernel::start(config).unwrap();
    write_package(packages.path(), "sleep", VERSION, &module_spec_yaml("sleep", false), SLEEP);

    let scratch = kernel.scratch_dir().unwrap();
    scratch.write_table("input.arrow", &number_table("A", &[1])).unwrap();
    let tab = TabInfo {
        slug: "tab-1".into(),
        name: "Tab 1".into(),
    };
    let invocation = Invocation::render(scratch, "input.arrow", params(&[("ms", ParamValue::Integer(10_000))]), tab);
    let err = kernel
        .invoke_module("sleep", VERSION, invocation, Duration::from_secs(60))
        .await
        .unwrap_err();
    assert!(
        matches!(err, InvokeError::ModuleTimeout { timeout, .. } if timeout == Duration::from_millis(300)),
        "{err:?}"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn short_sleep_finishes_before_the_deadline() {
    let harness = Harness::start(Confinement::BestEffort);
    harness.publish("sleep", SLEEP);

    let response = harness
        .render(
            "sleep",
            &number_table("A", &[1]),
            params(&[("ms", ParamValue::Integer(50))]),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
    assert!(response.into_render().is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn workers_cannot_write_outside_scratch() {
    let harness = Harness::start(Confinement::Required);
    harness.publish("escape", ESCAPE);
    let outside = tempfile::tempdir().unwrap();
    let target = outside.path().join("escaped.txt");

    let result = harness
        .render(
            "escape",
            &number_table("A", &[1]),
            params(&[("target", ParamValue::String(target.display().to_string()))]),
            TIMEOUT,
        )
        .await;

    match result {
        Err(InvokeError::ModuleExited {
            exit: Some(WorkerExit::Exited(SANDBOX_FAILURE_EXIT_CODE)),
            diagnostic,
        }) => panic!("required confinement could not be set up: {diagnostic}"),
        Err(InvokeError::ModuleExited { diagnostic, .. }) => {
            assert!(diagnostic.contains("write_text"), "{diagnostic}");
        }
        other => panic!("expected the write to be refused, got {other:?}"),
    }
    assert!(!target.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_invocations_are_isolated() {
    let harness = Harness::start(Confinement::BestEffort);
    harness.publish("double", DOUBLE);

    let calls = (0..8_i64).map(|i| {
        let input = number_table("A", &[i, i + 1]);
        let invocation = harness.render_invocation(&input, Params::new());
        harness.kernel.invoke_module("double", VERSION, invocation, TIMEOUT)
    });
    let results = futures::future::join_all(calls).await;

    for (i, result) in (0..8_i64).zip(results) {
        let outcome = result.unwrap().into_render().unwrap();
        assert_eq!(outcome.table, number_table("A", &[2 * i, 2 * i + 2]));
    }
    assert_eq!(harness.scratch_entries(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn module_errors_are_returned_with_the_table() {
    let harness = Harness::start(Confinement::BestEffort);
    harness.publish("complain", MODULE_ERROR);

    let outcome = harness
        .render("complain", &number_table("A", &[1]), Params::new(), TIMEOUT)
        .await
        .unwrap()
        .into_render()
        .unwrap();

    assert_eq!(outcome.table, Table::empty());
    assert_eq!(outcome.errors.len(), 2);
    assert_eq!(outcome.errors[0].message.id, PLAIN_TEXT_MESSAGE_ID);
    assert_eq!(outcome.errors[1].message.id, "convert.needed");
    assert_eq!(outcome.errors[1].quick_fixes.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn unsafe_output_fails_validation() {
    let harness = Harness::start(Confinement::BestEffort);
    harness.publish("badformat", INVALID_OUTPUT);

    let err = harness
        .render("badformat", &number_table("A", &[1]), Params::new(), TIMEOUT)
        .await
        .unwrap_err();
    assert!(
        matches!(err, InvokeError::Validation(ValidationError::UnsafeMetadata { .. })),
        "{err:?}"
    );
    assert!(err.is_module_fault());
}

#[tokio::test(flavor = "multi_thread")]
async fn migrate_params_runs_in_a_worker() {
    let harness = Harness::start(Confinement::BestEffort);
    harness.publish("migrate", MIGRATE);

    let scratch = harness.kernel.scratch_dir().unwrap();
    let invocation = Invocation::migrate_params(scratch, RawParams::new(json!({"multiplier": 3})));
    let params = harness
        .kernel
        .invoke_module("migrate", VERSION, invocation, TIMEOUT)
        .await
        .unwrap()
        .into_params()
        .unwrap();
    assert_eq!(params, RawParams::new(json!({"factor": 3})));
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_migrate_params_passes_params_through() {
    let harness = Harness::start(Confinement::BestEffort);
    harness.publish("identity", IDENTITY);

    let stored = RawParams::new(json!({"anything": [1, 2]}));
    let scratch = harness.kernel.scratch_dir().unwrap();
    let invocation = Invocation::migrate_params(scratch, stored.clone());
    let params = harness
        .kernel
        .invoke_module("identity", VERSION, invocation, TIMEOUT)
        .await
        .unwrap()
        .into_params()
        .unwrap();
    assert_eq!(params, stored);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_entry_point_is_a_module_fault() {
    let harness = Harness::start(Confinement::BestEffort);
    harness.publish("identity", IDENTITY);

    let scratch = harness.kernel.scratch_dir().unwrap();
    let invocation = Invocation::fetch(scratch, Params::new(), BTreeMap::new());
    let err = harness
        .kernel
        .invoke_module("identity", VERSION, invocation, TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, InvokeError::ModuleExited { exit: None, .. }), "{err:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn fetch_produces_a_certified_table() {
    let harness = Harness::start(Confinement::BestEffort);
    harness.publish("fetcher", FETCH);

    let scratch = harness.kernel.scratch_dir().unwrap();
    let secrets = BTreeMap::from([("token".to_string(), json!("s3cret"))]);
    let outcome = harness
        .kernel
        .invoke_module("fetcher", VERSION, Invocation::fetch(scratch, Params::new(), secrets), TIMEOUT)
        .await
        .unwrap()
        .into_fetch()
        .unwrap();
    assert_eq!(outcome.table, number_table("n", &[1, 2, 3]));
    assert!(outcome.errors.is_empty());

    let scratch = harness.kernel.scratch_dir().unwrap();
    let outcome = harness
        .kernel
        .invoke_module("fetcher", VERSION, Invocation::fetch(scratch, Params::new(), BTreeMap::new()), TIMEOUT)
        .await
        .unwrap()
        .into_fetch()
        .unwrap();
    assert_eq!(outcome.errors.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn broken_packages_fail_fast() {
    let harness = Harness::start(Confinement::BestEffort);
    let archive = write_package(
        harness.packages.path(),
        "broken",
        VERSION,
        &module_spec_yaml("broken", false),
        "fn render(table, params, ctx) { table",
    );

    let err = harness
        .render("broken", &number_table("A", &[1]), Params::new(), TIMEOUT)
        .await
        .unwrap_err();
    assert!(err.is_package_broken(), "{err:?}");

    // Remembered without touching the archive again
    std::fs::remove_file(archive).unwrap();
    let err = harness
        .render("broken", &number_table("A", &[1]), Params::new(), TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, InvokeError::ModuleBroken(_)), "{err:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_package_is_not_broken() {
    let harness = Harness::start(Confinement::BestEffort);

    let err = harness
        .render("nosuchmodule", &number_table("A", &[1]), Params::new(), TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, InvokeError::Load(_)), "{err:?}");
    assert!(!err.is_package_broken());
}

#[tokio::test(flavor = "multi_thread")]
async fn shut_down_kernel_refuses_work() {
    let harness = Harness::start(Confinement::BestEffort);
    harness.publish("identity", IDENTITY);
    harness.kernel.shutdown().unwrap();
    assert!(!harness.kernel.is_healthy());

    let err = harness
        .render("identity", &number_table("A", &[1]), Params::new(), TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, InvokeError::ShutDown), "{err:?}");
}
