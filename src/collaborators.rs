//! Narrow traits for the systems this crate treats as external
//! collaborators: multipath device enumeration, process accounting,
//! device-mapper administration, block-size probing and device
//! ownership. Each has a production implementation that shells out the
//! way `utils::exec`/`exec_bool` do, and — in tests — a fake driven by
//! canned responses.

use crate::error::{CacheError, LvmCommandError};
use std::process::Command;

/// Enumerates the multipath device paths this host currently manages.
/// Backing collaborator for [`crate::devices::DeviceResolver`].
pub trait MultipathDeviceEnumerator: Send + Sync {
    fn current_device_paths(&self) -> Result<Vec<String>, CacheError>;
}

/// One process holding a path open, as reported by `lsof`-style tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcInfo {
    pub pid: u32,
    pub name: String,
}

/// Looks up which processes currently have a device path open. Used to
/// report *why* a deactivate failed with "in use" (vdsm's
/// `_lvs_proc_info`, lvm.py:1122-1128).
pub trait ProcessInfoLookup: Send + Sync {
    fn proc_info(&self, device_path: &str) -> Vec<ProcInfo>;
}

/// Device-mapper administration used to clean up mappings left behind by
/// a VG deactivation that failed because storage became unreachable
/// (vdsm's `_removeVgMapping`, lvm.py:1065-1082).
pub trait DeviceMapperAdmin: Send + Sync {
    fn list_mapped_devices(&self) -> Result<Vec<String>, CacheError>;
    fn remove_mapping(&self, name: &str) -> Result<(), CacheError>;
    fn remove_mappings_holding(&self, device: &str) -> Result<(), CacheError>;
}

/// Logical and physical sector sizes of a block device, used by the
/// block-size compatibility checks in `createVG`/`extendVG`/`pvresize`
/// (vdsm's `_getpvblksize`, lvm.py:1423-1425).
pub trait BlockSizeProbe: Send + Sync {
    fn block_sizes(&self, device: &str) -> Result<(u64, u64), CacheError>;
}

/// Changes ownership of a device node after LV activation (vdsm's
/// `createLV` chown dance, lvm.py:1491-1502).
pub trait OwnershipAdmin: Send + Sync {
    fn chown(&self, path: &str, user: &str, group: &str) -> Result<(), CacheError>;
}

/// Tests whether an LV's device-node link exists, the ground truth
/// `activateLVs`/`deactivateLVs` partition active/inactive LVs on
/// (vdsm's `_isLVActive`, `os.path.exists(lvPath(vg, lv))`,
/// lvm.py:1712-1717) rather than on whatever the cache currently holds.
pub trait LvDeviceNodeProbe: Send + Sync {
    fn exists(&self, path: &str) -> bool;
}

/// The single boundary [`crate::command::CommandRunner`] talks to: run an
/// `lvm`-family command restricted to a device filter and return its
/// output lines, or fail with a [`LvmCommandError`].
pub trait LvmCommandExecutor: Send + Sync {
    fn run(
        &self,
        argv: &[String],
        devices: &[String],
        use_polld: bool,
    ) -> Result<Vec<String>, LvmCommandError>;
}

/// Production executor: shells out via [`std::process::Command`], the
/// same way `utils::exec_raw` does.
pub struct SystemLvmExecutor {
    /// Name appended to the toolchain's polld-disabling flag, set when a
    /// command must run with `use_polld=false` (e.g. `pvmove`, which
    /// interacts badly with `lvmpolld`: lvm.py:1219).
    pub polld_disable_flag: String,
}

impl Default for SystemLvmExecutor {
    fn default() -> Self {
        SystemLvmExecutor {
            polld_disable_flag: "--config".to_string() + " global{use_lvmpolld=0}",
        }
    }
}

impl LvmCommandExecutor for SystemLvmExecutor {
    fn run(
        &self,
        argv: &[String],
        devices: &[String],
        use_polld: bool,
    ) -> Result<Vec<String>, LvmCommandError> {
        let Some((bin, args)) = argv.split_first() else {
            return Err(LvmCommandError {
                cmd: argv.to_vec(),
                rc: -1,
                stdout: vec![],
                stderr: "empty command".to_string(),
            });
        };

        let mut full_args: Vec<String> = args.to_vec();
        if !devices.is_empty() {
            full_args.push("--devices".to_string());
            full_args.push(devices.join(","));
        }
        if !use_polld {
            full_args.push(self.polld_disable_flag.clone());
        }

        log::trace!("exec {} {}", bin, full_args.join(" "));
        let output = Command::new(bin)
            .args(&full_args)
            .output()
            .map_err(|e| LvmCommandError {
                cmd: argv.to_vec(),
                rc: -1,
                stdout: vec![],
                stderr: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let lines: Vec<String> = stdout
            .lines()
            .map(|l| l.to_string())
            .filter(|l| !l.is_empty())
            .collect();

        if !output.status.success() {
            return Err(LvmCommandError {
                cmd: argv.to_vec(),
                rc: output.status.code().unwrap_or(-1),
                stdout: lines,
                stderr: stderr.to_string(),
            });
        }

        Ok(lines)
    }
}

fn run_bool(cmd: &str, args: &[&str]) -> Result<bool, CacheError> {
    Command::new(cmd)
        .args(args)
        .output()
        .map(|o| o.status.success())
        .map_err(|e| CacheError::inaccessible_phys_dev_from(cmd.to_string(), LvmCommandError {
            cmd: vec![cmd.to_string()],
            rc: -1,
            stdout: vec![],
            stderr: e.to_string(),
        }))
}

fn run_lines(cmd: &str, args: &[&str]) -> Result<Vec<String>, CacheError> {
    let output = Command::new(cmd)
        .args(args)
        .output()
        .map_err(|e| CacheError::inaccessible_phys_dev_from(cmd.to_string(), LvmCommandError {
            cmd: vec![cmd.to_string()],
            rc: -1,
            stdout: vec![],
            stderr: e.to_string(),
        }))?;
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|l| l.to_string())
        .filter(|l| !l.is_empty())
        .collect())
}

/// Enumerates multipath devices via `dmsetup ls --target multipath`, the
/// same tool vdsm's `devicemapper` module wraps.
#[derive(Default)]
pub struct SystemMultipathEnumerator;

impl MultipathDeviceEnumerator for SystemMultipathEnumerator {
    fn current_device_paths(&self) -> Result<Vec<String>, CacheError> {
        let lines = run_lines("dmsetup", &["ls", "--target", "multipath"])?;
        Ok(lines
            .into_iter()
            .filter_map(|l| l.split_whitespace().next().map(|n| format!("/dev/mapper/{n}")))
            .collect())
    }
}

/// Looks up a path's holders via `lsof`, same tool vdsm's `_lvs_proc_info`
/// wraps.
#[derive(Default)]
pub struct SystemProcessInfoLookup;

impl ProcessInfoLookup for SystemProcessInfoLookup {
    fn proc_info(&self, device_path: &str) -> Vec<ProcInfo> {
        let lines = match run_lines("lsof", &["-Fpc", device_path]) {
            Ok(l) => l,
            Err(_) => return Vec::new(),
        };
        let mut infos = Vec::new();
        let mut pid: Option<u32> = None;
        for line in lines {
            match line.split_at(1) {
                ("p", rest) => pid = rest.parse().ok(),
                ("c", rest) => {
                    if let Some(p) = pid {
                        infos.push(ProcInfo { pid: p, name: rest.to_string() });
                    }
                }
                _ => {}
            }
        }
        infos
    }
}

/// Administers device-mapper mappings via `dmsetup`, used to clean up a
/// VG's leftover mappings after a failed deactivate.
#[derive(Default)]
pub struct SystemDeviceMapperAdmin;

impl DeviceMapperAdmin for SystemDeviceMapperAdmin {
    fn list_mapped_devices(&self) -> Result<Vec<String>, CacheError> {
        let lines = run_lines("dmsetup", &["ls"])?;
        Ok(lines
            .into_iter()
            .filter_map(|l| l.split_whitespace().next().map(|n| n.to_string()))
            .collect())
    }

    fn remove_mapping(&self, name: &str) -> Result<(), CacheError> {
        run_bool("dmsetup", &["remove", "--force", name]).map(|_| ())
    }

    fn remove_mappings_holding(&self, device: &str) -> Result<(), CacheError> {
        run_bool("dmsetup", &["remove", "--force", device]).map(|_| ())
    }
}

/// Probes logical/physical sector sizes via `blockdev`.
#[derive(Default)]
pub struct SystemBlockSizeProbe;

impl BlockSizeProbe for SystemBlockSizeProbe {
    fn block_sizes(&self, device: &str) -> Result<(u64, u64), CacheError> {
        let logical = run_lines("blockdev", &["--getss", device])?;
        let physical = run_lines("blockdev", &["--getpbsz", device])?;
        let parse = |lines: Vec<String>| -> Result<u64, CacheError> {
            lines
                .first()
                .and_then(|l| l.trim().parse().ok())
                .ok_or_else(|| CacheError::inaccessible_phys_dev(device.to_string()))
        };
        Ok((parse(logical)?, parse(physical)?))
    }
}

/// Changes device node ownership via the `chown` binary rather than an
/// extra ownership-management crate.
#[derive(Default)]
pub struct SystemOwnershipAdmin;

impl OwnershipAdmin for SystemOwnershipAdmin {
    fn chown(&self, path: &str, user: &str, group: &str) -> Result<(), CacheError> {
        let spec = format!("{user}:{group}");
        if run_bool("chown", &[&spec, path])? {
            Ok(())
        } else {
            Err(CacheError::inaccessible_phys_dev(path.to_string()))
        }
    }
}

/// Probes `/dev/<vg>/<lv>` directly via [`std::path::Path::exists`].
#[derive(Default)]
pub struct SystemLvDeviceNodeProbe;

impl LvDeviceNodeProbe for SystemLvDeviceNodeProbe {
    fn exists(&self, path: &str) -> bool {
        std::path::Path::new(path).exists()
    }
}

#[cfg(test)]
pub mod fakes {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// A scripted [`LvmCommandExecutor`]: each call to `run` pops the next
    /// queued response, regardless of the argv passed in. Good enough for
    /// exercising `CommandRunner`'s retry policy and the cache's reload
    /// paths without a live `lvm` binary.
    #[derive(Default)]
    pub struct FakeExecutor {
        responses: Mutex<VecDeque<Result<Vec<String>, LvmCommandError>>>,
        pub calls: Mutex<Vec<(Vec<String>, Vec<String>, bool)>>,
    }

    impl FakeExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_ok(&self, lines: Vec<String>) {
            self.responses.lock().unwrap().push_back(Ok(lines));
        }

        pub fn push_err(&self, err: LvmCommandError) {
            self.responses.lock().unwrap().push_back(Err(err));
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl LvmCommandExecutor for FakeExecutor {
        fn run(
            &self,
            argv: &[String],
            devices: &[String],
            use_polld: bool,
        ) -> Result<Vec<String>, LvmCommandError> {
            self.calls
                .lock()
                .unwrap()
                .push((argv.to_vec(), devices.to_vec(), use_polld));
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(vec![]))
        }
    }

    #[derive(Default)]
    pub struct FakeDeviceEnumerator {
        pub paths: Mutex<Vec<String>>,
        pub calls: Mutex<u32>,
        /// Responses returned in order before falling back to `paths`.
        /// Lets tests exercise "the device set changed between the two
        /// calls `CommandRunner` makes around an `invalidate()`".
        sequence: Mutex<VecDeque<Vec<String>>>,
    }

    impl FakeDeviceEnumerator {
        pub fn push_sequence(&self, paths: Vec<String>) {
            self.sequence.lock().unwrap().push_back(paths);
        }
    }

    impl MultipathDeviceEnumerator for FakeDeviceEnumerator {
        fn current_device_paths(&self) -> Result<Vec<String>, CacheError> {
            *self.calls.lock().unwrap() += 1;
            if let Some(next) = self.sequence.lock().unwrap().pop_front() {
                return Ok(next);
            }
            Ok(self.paths.lock().unwrap().clone())
        }
    }

    #[derive(Default)]
    pub struct FakeProcessInfoLookup {
        pub users: Mutex<Vec<ProcInfo>>,
    }

    impl ProcessInfoLookup for FakeProcessInfoLookup {
        fn proc_info(&self, _device_path: &str) -> Vec<ProcInfo> {
            self.users.lock().unwrap().clone()
        }
    }

    #[derive(Default)]
    pub struct FakeDeviceMapperAdmin {
        pub mappings: Mutex<Vec<String>>,
        pub removed: Mutex<Vec<String>>,
    }

    impl DeviceMapperAdmin for FakeDeviceMapperAdmin {
        fn list_mapped_devices(&self) -> Result<Vec<String>, CacheError> {
            Ok(self.mappings.lock().unwrap().clone())
        }

        fn remove_mapping(&self, name: &str) -> Result<(), CacheError> {
            self.removed.lock().unwrap().push(name.to_string());
            Ok(())
        }

        fn remove_mappings_holding(&self, device: &str) -> Result<(), CacheError> {
            self.removed.lock().unwrap().push(device.to_string());
            Ok(())
        }
    }

    pub struct FakeBlockSizeProbe {
        pub sizes: (u64, u64),
    }

    impl BlockSizeProbe for FakeBlockSizeProbe {
        fn block_sizes(&self, _device: &str) -> Result<(u64, u64), CacheError> {
            Ok(self.sizes)
        }
    }

    #[derive(Default)]
    pub struct FakeOwnershipAdmin {
        pub calls: Mutex<Vec<(String, String, String)>>,
    }

    impl OwnershipAdmin for FakeOwnershipAdmin {
        fn chown(&self, path: &str, user: &str, group: &str) -> Result<(), CacheError> {
            self.calls
                .lock()
                .unwrap()
                .push((path.to_string(), user.to_string(), group.to_string()));
            Ok(())
        }
    }

    /// A scripted [`LvDeviceNodeProbe`]: `exists` answers `true` for
    /// exactly the paths pre-seeded into `present`.
    #[derive(Default)]
    pub struct FakeLvDeviceNodeProbe {
        pub present: Mutex<std::collections::HashSet<String>>,
    }

    impl FakeLvDeviceNodeProbe {
        pub fn with_present(paths: impl IntoIterator<Item = String>) -> Self {
            FakeLvDeviceNodeProbe { present: Mutex::new(paths.into_iter().collect()) }
        }
    }

    impl LvDeviceNodeProbe for FakeLvDeviceNodeProbe {
        fn exists(&self, path: &str) -> bool {
            self.present.lock().unwrap().contains(path)
        }
    }
}
