//! Worker sandbox
//!
//! Runs in a freshly forked child, before any module code. Order:
//! 1. parent-death signal and process name
//! 2. resource limits, then `chdir` into the scratch directory
//! 3. `no_new_privs`, then Landlock confinement
//! 4. capability bounding, ambient and inheritable sets cleared
//! 5. identity drop, then the remaining capability sets cleared; a worker
//!    still holding uid 0 stops here
//! 6. the syscall filter, last, so the steps above are not subject to it
//!
//! A failure at any step ends the child with [`SANDBOX_FAILURE_EXIT_CODE`].

use std::collections::BTreeMap;
use std::ffi::CString;
use std::path::Path;

use caps::CapSet;
use landlock::{
    Access, AccessFs, PathBeneath, PathFd, Ruleset, RulesetAttr, RulesetCreatedAttr, RulesetStatus, ABI,
};
use nix::libc;
use nix::sys::prctl;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::Signal;
use nix::unistd::{getppid, getresuid, setgroups, setresgid, setresuid, Gid, Pid, Uid};
use seccompiler::{apply_filter, BpfProgram, SeccompAction, SeccompFilter, TargetArch};

use crate::error::PoolError;
use crate::policy::{Confinement, Credentials, ResourceLimits, SandboxPolicy};

/// Exit code of a worker whose sandbox could not be set up
pub const SANDBOX_FAILURE_EXIT_CODE: i32 = 125;

/// Landlock ABI requested; older kernels get what they support
const LANDLOCK_ABI: ABI = ABI::V2;

/// Syscalls that kill the worker on sight
///
/// Sockets cover network access: a worker inherits none, so it cannot
/// reach the network without creating one.
const DENIED_SYSCALLS: &[libc::c_long] = &[
    // network
    libc::SYS_socket,
    libc::SYS_socketpair,
    libc::SYS_connect,
    libc::SYS_bind,
    libc::SYS_listen,
    libc::SYS_accept,
    libc::SYS_accept4,
    // new programs and namespaces
    libc::SYS_execve,
    libc::SYS_execveat,
    libc::SYS_unshare,
    libc::SYS_setns,
    libc::SYS_mount,
    libc::SYS_umount2,
    libc::SYS_pivot_root,
    libc::SYS_chroot,
    // other processes
    libc::SYS_ptrace,
    libc::SYS_process_vm_readv,
    libc::SYS_process_vm_writev,
    // kernel surface
    libc::SYS_bpf,
    libc::SYS_perf_event_open,
    libc::SYS_userfaultfd,
    libc::SYS_io_uring_setup,
    libc::SYS_keyctl,
    libc::SYS_add_key,
    libc::SYS_request_key,
    libc::SYS_personality,
    // host administration
    libc::SYS_init_module,
    libc::SYS_finit_module,
    libc::SYS_delete_module,
    libc::SYS_kexec_load,
    libc::SYS_reboot,
    libc::SYS_swapon,
    libc::SYS_swapoff,
    libc::SYS_acct,
];

/// Confine the calling process according to `policy`
///
/// `broker` is the pid that forked us; if it is already gone the child
/// refuses to continue, since the death signal would never arrive.
///
/// # Errors
///
/// Returns [`PoolError::Sandbox`] naming the step that failed.
pub fn enter_sandbox(
    policy: &SandboxPolicy,
    process_name: &str,
    scratch_dir: &Path,
    broker: Pid,
) -> Result<(), PoolError> {
    prctl::set_pdeathsig(Signal::SIGKILL).map_err(failed("set parent-death signal"))?;
    if getppid() != broker {
        return Err(PoolError::Sandbox("broker exited during fork".into()));
    }
    set_process_name(process_name)?;
    apply_limits(&policy.limits)?;
    std::env::set_current_dir(scratch_dir).map_err(failed("enter scratch directory"))?;
    prctl::set_no_new_privs().map_err(failed("set no_new_privs"))?;
    confine(policy.confinement, scratch_dir)?;
    let filter = syscall_filter()?;
    drop_inheritable_capabilities()?;
    if let Some(credentials) = policy.run_as {
        switch_identity(credentials)?;
    }
    drop_remaining_capabilities()?;
    refuse_root()?;
    apply_filter(&filter).map_err(failed("install syscall filter"))
}

fn set_process_name(name: &str) -> Result<(), PoolError> {
    let name: String = name.chars().filter(|c| *c != '\0').collect();
    let name = CString::new(name).map_err(failed("encode process name"))?;
    prctl::set_name(&name).map_err(failed("set process name"))
}

fn apply_limits(limits: &ResourceLimits) -> Result<(), PoolError> {
    let table = [
        (Resource::RLIMIT_CPU, limits.cpu_seconds, "cpu"),
        (Resource::RLIMIT_AS, limits.memory_bytes, "address space"),
        (Resource::RLIMIT_NOFILE, limits.open_files, "open files"),
        (Resource::RLIMIT_NPROC, limits.processes, "processes"),
        (Resource::RLIMIT_FSIZE, limits.file_size_bytes, "file size"),
        (Resource::RLIMIT_CORE, 0, "core size"),
    ];
    for (resource, value, name) in table {
        setrlimit(resource, value, value)
            .map_err(|e| PoolError::Sandbox(format!("setrlimit {name}: {e}")))?;
    }
    Ok(())
}

fn confine(mode: Confinement, scratch_dir: &Path) -> Result<(), PoolError> {
    if mode == Confinement::Disabled {
        return Ok(());
    }

    let access = AccessFs::from_all(LANDLOCK_ABI);
    let status = Ruleset::default()
        .handle_access(access)
        .and_then(|ruleset| ruleset.create())
        .map_err(failed("create landlock ruleset"))?
        .add_rule(PathBeneath::new(
            PathFd::new(scratch_dir).map_err(failed("open scratch directory"))?,
            access,
        ))
        .and_then(|ruleset| ruleset.restrict_self())
        .map_err(failed("apply landlock ruleset"))?;

    match (status.ruleset, mode) {
        (RulesetStatus::NotEnforced, Confinement::Required) => Err(PoolError::Sandbox(
            "filesystem confinement required but not supported by this kernel".into(),
        )),
        (RulesetStatus::NotEnforced, _) => {
            eprintln!("modbox: filesystem confinement unavailable; continuing unconfined");
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Build the BPF program for [`DENIED_SYSCALLS`]
///
/// # Errors
///
/// Fails on an architecture the filter compiler does not know.
pub fn syscall_filter() -> Result<BpfProgram, PoolError> {
    let arch: TargetArch = std::env::consts::ARCH
        .try_into()
        .map_err(failed("syscall filter architecture"))?;
    let rules = DENIED_SYSCALLS.iter().map(|nr| (i64::from(*nr), Vec::new())).collect::<BTreeMap<_, _>>();
    let filter = SeccompFilter::new(rules, SeccompAction::Allow, SeccompAction::KillProcess, arch)
        .map_err(failed("build syscall filter"))?;
    BpfProgram::try_from(filter).map_err(failed("compile syscall filter"))
}

/// Shrink the bounding set while we may, and clear what survives exec or uid changes
fn drop_inheritable_capabilities() -> Result<(), PoolError> {
    let can_bound = caps::has_cap(None, CapSet::Effective, caps::Capability::CAP_SETPCAP)
        .map_err(failed("read capabilities"))?;
    if can_bound {
        for cap in caps::runtime::thread_all_supported() {
            caps::drop(None, CapSet::Bounding, cap).map_err(failed("drop bounding capability"))?;
        }
    }
    caps::clear(None, CapSet::Ambient).map_err(failed("clear ambient capabilities"))?;
    caps::clear(None, CapSet::Inheritable).map_err(failed("clear inheritable capabilities"))
}

fn switch_identity(credentials: Credentials) -> Result<(), PoolError> {
    let gid = Gid::from_raw(credentials.gid);
    let uid = Uid::from_raw(credentials.uid);
    setgroups(&[gid]).map_err(failed("setgroups"))?;
    setresgid(gid, gid, gid).map_err(failed("setresgid"))?;
    setresuid(uid, uid, uid).map_err(failed("setresuid"))?;
    Ok(())
}

fn drop_remaining_capabilities() -> Result<(), PoolError> {
    caps::clear(None, CapSet::Effective).map_err(failed("clear effective capabilities"))?;
    caps::clear(None, CapSet::Permitted).map_err(failed("clear permitted capabilities"))
}

fn refuse_root() -> Result<(), PoolError> {
    let ids = getresuid().map_err(failed("getresuid"))?;
    if [ids.real, ids.effective, ids.saved].iter().any(|uid| uid.is_root()) {
        return Err(PoolError::Sandbox("worker would run as root; configure run_as".into()));
    }
    Ok(())
}

fn failed<E: std::fmt::Display>(step: &'static str) -> impl Fn(E) -> PoolError {
    move |e| PoolError::Sandbox(format!("{step}: {e}"))
}
