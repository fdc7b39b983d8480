//! pid -> application name lookup over the OS process table.

use super::{RunningApp, RunningApps};
use crate::process::IconRef;
use sysinfo::{Pid, ProcessesToUpdate, System};

/// [`RunningApps`] backed by `sysinfo`.
pub struct SysinfoApps {
    system: System,
}

impl SysinfoApps {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoApps {
    fn default() -> Self {
        Self::new()
    }
}

impl RunningApps for SysinfoApps {
    fn refresh(&mut self) {
        self.system.refresh_processes(ProcessesToUpdate::All, true);
    }

    fn lookup(&self, pid: u32) -> Option<RunningApp> {
        let process = self.system.process(Pid::from_u32(pid))?;
        let name = process.name().to_string_lossy().to_string();
        if name.is_empty() {
            return None;
        }
        let icon = process
            .exe()
            .map(|path| IconRef::Path(path.to_path_buf()))
            .unwrap_or(IconRef::Generic);
        Some(RunningApp { name, icon })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_own_process_after_refresh() {
        let mut apps = SysinfoApps::new();
        apps.refresh();
        let me = apps.lookup(std::process::id()).expect("own pid is listed");
        assert!(!me.name.is_empty());
    }

    #[test]
    fn unknown_pid_has_no_app() {
        let apps = SysinfoApps::new();
        assert!(apps.lookup(u32::MAX - 1).is_none());
    }
}
