//! CommandRunner: the only code in this crate allowed to
//! invoke the external `lvm`-family tools, and the sole holder of the
//! bounded-concurrency semaphore (at most `MAX_COMMANDS` external
//! processes in flight at once).
//!
//! vdsm uses a `threading.BoundedSemaphore` for the same purpose
//! (lvm.py:68, `_lvminfo_lock`'s sibling `_sem`). The standard library
//! has no bounded semaphore, so this builds a small one out of plain
//! `Mutex`/`Condvar` primitives rather than pulling in a dedicated crate.

use crate::collaborators::LvmCommandExecutor;
use crate::devices::DeviceResolver;
use crate::error::LvmCommandError;
use std::sync::{Arc, Condvar, Mutex};

/// A counting semaphore bounding how many `lvm` subprocesses may run
/// concurrently. Acquiring blocks the calling thread, never the async
/// runtime this crate doesn't have.
struct CommandSlots {
    available: Mutex<u32>,
    released: Condvar,
}

impl CommandSlots {
    fn new(max: u32) -> Self {
        CommandSlots {
            available: Mutex::new(max),
            released: Condvar::new(),
        }
    }

    fn acquire(&self) -> SlotGuard<'_> {
        let mut available = self.available.lock().unwrap();
        while *available == 0 {
            available = self.released.wait(available).unwrap();
        }
        *available -= 1;
        SlotGuard { slots: self }
    }
}

struct SlotGuard<'a> {
    slots: &'a CommandSlots,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        *self.slots.available.lock().unwrap() += 1;
        self.slots.released.notify_one();
    }
}

/// Default concurrent `lvm` subprocess ceiling.
pub const DEFAULT_MAX_COMMANDS: u32 = 10;

pub struct CommandRunner {
    executor: Arc<dyn LvmCommandExecutor>,
    devices: Arc<DeviceResolver>,
    slots: CommandSlots,
    use_polld: bool,
}

impl CommandRunner {
    pub fn new(
        executor: Arc<dyn LvmCommandExecutor>,
        devices: Arc<DeviceResolver>,
        max_commands: u32,
        use_polld: bool,
    ) -> Self {
        CommandRunner {
            executor,
            devices,
            slots: CommandSlots::new(max_commands),
            use_polld,
        }
    }

    /// Runs `argv` restricted to the current device filter.
    /// `expect_output` marks calls where an empty result is itself
    /// suspicious (report commands) as opposed to normal (mutating
    /// commands, which return no report lines on success).
    ///
    /// On failure, or on empty output when output was expected, the device
    /// resolver is invalidated and re-queried; the command is retried
    /// exactly once if the refreshed device set differs from the first
    /// attempt, or if this runner's `use_polld` is already `false`.
    /// Otherwise the first error is propagated as-is.
    pub fn run(&self, argv: Vec<String>, expect_output: bool) -> Result<Vec<String>, LvmCommandError> {
        self.run_with_polld(argv, expect_output, self.use_polld)
    }

    /// Like [`Self::run`] but overrides `use_polld` for this one call,
    /// regardless of what this runner was constructed with — used by
    /// `pvmove`, which interacts badly with the background-polling variant
    /// of the toolchain.
    pub fn run_no_polld(&self, argv: Vec<String>, expect_output: bool) -> Result<Vec<String>, LvmCommandError> {
        self.run_with_polld(argv, expect_output, false)
    }

    fn run_with_polld(
        &self,
        argv: Vec<String>,
        expect_output: bool,
        use_polld: bool,
    ) -> Result<Vec<String>, LvmCommandError> {
        let _permit = self.slots.acquire();
        let first_devices = self.devices.current();
        let first_result = self.executor.run(&argv, &first_devices, use_polld);
        let suspicious = match &first_result {
            Err(_) => true,
            Ok(lines) => expect_output && lines.is_empty(),
        };
        if !suspicious {
            return first_result;
        }

        self.devices.invalidate();
        let second_devices = self.devices.current();
        if second_devices != first_devices || !use_polld {
            if let Err(ref e) = first_result {
                log::warn!("lvm command {:?} failed, retrying after device filter refresh: {e}", argv);
            }
            return self.executor.run(&argv, &second_devices, use_polld);
        }
        first_result
    }
}

/// Free functions building argv for the mutating `lvm` subcommands. Kept
/// as plain functions rather than a trait, built inline with
/// `vec!["lvcreate", ...]` the way the rest of this crate constructs
/// argv, and centralized here only to avoid repeating the option
/// ordering in half a dozen places in `mutation.rs`.
pub mod argv {
    pub fn lvcreate(vg: &str, lv: &str, extents: u64, tags: &[String], mirrors: u32) -> Vec<String> {
        let mut cmd = vec![
            "lvcreate".to_string(),
            "--autobackup".to_string(),
            "n".to_string(),
            "--contiguous".to_string(),
            "n".to_string(),
            "--extents".to_string(),
            extents.to_string(),
        ];
        if mirrors > 0 {
            cmd.push("--mirrors".to_string());
            cmd.push(mirrors.to_string());
        }
        for tag in tags {
            cmd.push("--addtag".to_string());
            cmd.push(tag.clone());
        }
        cmd.push("--name".to_string());
        cmd.push(lv.to_string());
        cmd.push(vg.to_string());
        cmd
    }

    pub fn lvchange_availability(vg: &str, lv: &str, available: bool) -> Vec<String> {
        vec![
            "lvchange".to_string(),
            "--autobackup".to_string(),
            "n".to_string(),
            if available { "--activate" } else { "--deactivate" }.to_string(),
            "y".to_string(),
            format!("{vg}/{lv}"),
        ]
    }

    pub fn lvchange_permission(vg: &str, lv: &str, writeable: bool) -> Vec<String> {
        vec![
            "lvchange".to_string(),
            "--autobackup".to_string(),
            "n".to_string(),
            "--permission".to_string(),
            if writeable { "rw" } else { "r" }.to_string(),
            format!("{vg}/{lv}"),
        ]
    }

    pub fn vgchange_availability(vg: &str, available: bool) -> Vec<String> {
        vec![
            "vgchange".to_string(),
            "--available".to_string(),
            if available { "y" } else { "n" }.to_string(),
            vg.to_string(),
        ]
    }

    pub fn lvchange_availability_many(vg: &str, lvs: &[String], available: bool) -> Vec<String> {
        let mut cmd = vec![
            "lvchange".to_string(),
            "--autobackup".to_string(),
            "n".to_string(),
            if available { "--activate" } else { "--deactivate" }.to_string(),
            "y".to_string(),
        ];
        for lv in lvs {
            cmd.push(format!("{vg}/{lv}"));
        }
        cmd
    }

    pub fn lvchange_refresh(vg: &str, lvs: &[String]) -> Vec<String> {
        let mut cmd = vec!["lvchange".to_string(), "--refresh".to_string()];
        for lv in lvs {
            cmd.push(format!("{vg}/{lv}"));
        }
        cmd
    }

    pub fn lvextend(vg: &str, lv: &str, extents: u64) -> Vec<String> {
        vec![
            "lvextend".to_string(),
            "--autobackup".to_string(),
            "n".to_string(),
            "--extents".to_string(),
            extents.to_string(),
            format!("{vg}/{lv}"),
        ]
    }

    pub fn lvreduce(vg: &str, lv: &str, extents: u64) -> Vec<String> {
        vec![
            "lvreduce".to_string(),
            "--autobackup".to_string(),
            "n".to_string(),
            "--force".to_string(),
            "--extents".to_string(),
            extents.to_string(),
            format!("{vg}/{lv}"),
        ]
    }

    pub fn lvremove(vg: &str, lvs: &[String]) -> Vec<String> {
        let mut cmd = vec![
            "lvremove".to_string(),
            "--autobackup".to_string(),
            "n".to_string(),
            "--force".to_string(),
        ];
        for lv in lvs {
            cmd.push(format!("{vg}/{lv}"));
        }
        cmd
    }

    /// Fully qualified PV name as passed to `pvcreate`/`vgcreate`, e.g.
    /// vdsm's `_fqpvname` which leaves already-absolute paths alone
    /// (lvm.py:963-967).
    pub fn fqpvname(dev: &str) -> String {
        if dev.starts_with('/') {
            dev.to_string()
        } else {
            format!("/dev/{dev}")
        }
    }

    pub fn pvcreate(devices: &[String], test: bool) -> Vec<String> {
        let mut cmd = vec!["pvcreate".to_string(), "--metadatasize".to_string(), "128m".to_string()];
        if test {
            cmd.push("--test".to_string());
        }
        cmd.extend(devices.iter().map(|d| fqpvname(d)));
        cmd
    }

    pub fn vgcreate(vg: &str, devices: &[String]) -> Vec<String> {
        let mut cmd = vec![
            "vgcreate".to_string(),
            "--autobackup".to_string(),
            "n".to_string(),
            vg.to_string(),
        ];
        cmd.extend(devices.iter().map(|d| fqpvname(d)));
        cmd
    }

    pub fn vgextend(vg: &str, devices: &[String]) -> Vec<String> {
        let mut cmd = vec!["vgextend".to_string(), "--autobackup".to_string(), "n".to_string(), vg.to_string()];
        cmd.extend(devices.iter().map(|d| fqpvname(d)));
        cmd
    }

    pub fn vgreduce(vg: &str, devices: &[String]) -> Vec<String> {
        let mut cmd = vec!["vgreduce".to_string(), "--autobackup".to_string(), "n".to_string(), vg.to_string()];
        cmd.extend(devices.iter().map(|d| fqpvname(d)));
        cmd
    }

    pub fn vgremove(vg: &str) -> Vec<String> {
        vec!["vgremove".to_string(), vg.to_string()]
    }

    pub fn vgck(vg: &str) -> Vec<String> {
        vec!["vgck".to_string(), vg.to_string()]
    }

    pub fn vgchange_tags(vg: &str, add: &[String], delete: &[String]) -> Vec<String> {
        let mut cmd = vec!["vgchange".to_string(), "--autobackup".to_string(), "n".to_string()];
        for tag in add {
            cmd.push("--addtag".to_string());
            cmd.push(tag.clone());
        }
        for tag in delete {
            cmd.push("--deltag".to_string());
            cmd.push(tag.clone());
        }
        cmd.push(vg.to_string());
        cmd
    }

    pub fn lvchange_tags(vg: &str, lv: &str, add: &[String], delete: &[String]) -> Vec<String> {
        let mut cmd = vec!["lvchange".to_string(), "--autobackup".to_string(), "n".to_string()];
        for tag in add {
            cmd.push("--addtag".to_string());
            cmd.push(tag.clone());
        }
        for tag in delete {
            cmd.push("--deltag".to_string());
            cmd.push(tag.clone());
        }
        cmd.push(format!("{vg}/{lv}"));
        cmd
    }

    pub fn pvresize(pv: &str) -> Vec<String> {
        vec!["pvresize".to_string(), pv.to_string()]
    }

    pub fn pvmove(src: &str, dst: Option<&str>) -> Vec<String> {
        let mut cmd = vec!["pvmove".to_string(), src.to_string()];
        if let Some(dst) = dst {
            cmd.push(dst.to_string());
        }
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::{FakeDeviceEnumerator, FakeExecutor};

    fn runner(executor: Arc<FakeExecutor>) -> CommandRunner {
        let devices = Arc::new(DeviceResolver::new(Arc::new(FakeDeviceEnumerator::default())));
        CommandRunner::new(executor, devices, 4, true)
    }

    #[test]
    fn run_passes_through_successful_output() {
        let executor = Arc::new(FakeExecutor::new());
        executor.push_ok(vec!["line one".into()]);
        let runner = runner(executor);

        let out = runner.run(vec!["pvs".to_string()], true).unwrap();
        assert_eq!(out, vec!["line one".to_string()]);
    }

    #[test]
    fn run_retries_once_when_device_set_changes_after_failure() {
        let executor = Arc::new(FakeExecutor::new());
        executor.push_err(LvmCommandError {
            cmd: vec!["vgs".into()],
            rc: 5,
            stdout: vec![],
            stderr: "Volume group \"x\" not found".into(),
        });
        executor.push_ok(vec!["recovered".into()]);

        let enumerator = Arc::new(FakeDeviceEnumerator::default());
        enumerator.push_sequence(vec!["/dev/mapper/mpatha".to_string()]);
        enumerator.push_sequence(vec!["/dev/mapper/mpathb".to_string()]);
        let devices = Arc::new(DeviceResolver::new(enumerator));
        let runner = CommandRunner::new(executor.clone(), devices, 4, true);

        let out = runner.run(vec!["vgs".to_string()], true).unwrap();
        assert_eq!(out, vec!["recovered".to_string()]);
        assert_eq!(executor.call_count(), 2);
    }

    #[test]
    fn run_does_not_retry_when_device_set_is_unchanged() {
        let executor = Arc::new(FakeExecutor::new());
        executor.push_err(LvmCommandError {
            cmd: vec!["lvcreate".into()],
            rc: 5,
            stdout: vec![],
            stderr: "Insufficient free extents".into(),
        });
        let runner = runner(executor.clone());

        assert!(runner.run(vec!["lvcreate".to_string()], true).is_err());
        assert_eq!(executor.call_count(), 1);
    }

    #[test]
    fn run_no_polld_retries_even_with_unchanged_device_set() {
        let executor = Arc::new(FakeExecutor::new());
        executor.push_err(LvmCommandError {
            cmd: vec!["pvmove".into()],
            rc: 5,
            stdout: vec![],
            stderr: "device busy".into(),
        });
        executor.push_ok(vec!["recovered".into()]);
        let runner = runner(executor.clone());

        let out = runner.run_no_polld(vec!["pvmove".to_string()], true).unwrap();
        assert_eq!(out, vec!["recovered".to_string()]);
        assert_eq!(executor.call_count(), 2);
    }

    #[test]
    fn run_treats_empty_output_as_suspicious_only_when_expected() {
        let executor = Arc::new(FakeExecutor::new());
        executor.push_ok(vec![]);
        let runner = runner(executor.clone());

        assert_eq!(runner.run(vec!["lvcreate".to_string()], false).unwrap(), Vec::<String>::new());
        assert_eq!(executor.call_count(), 1);
    }

    #[test]
    fn fqpvname_leaves_absolute_paths_alone() {
        assert_eq!(argv::fqpvname("/dev/sda1"), "/dev/sda1");
        assert_eq!(argv::fqpvname("sda1"), "/dev/sda1");
    }

    #[test]
    fn lvcreate_argv_includes_tags_and_mirrors() {
        let cmd = argv::lvcreate("vg0", "lv0", 100, &["tagA".to_string()], 1);
        assert!(cmd.contains(&"--mirrors".to_string()));
        assert!(cmd.contains(&"--addtag".to_string()));
        assert!(cmd.contains(&"tagA".to_string()));
        assert_eq!(cmd.last(), Some(&"vg0".to_string()));
    }
}
