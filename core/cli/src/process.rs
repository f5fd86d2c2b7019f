//! Liveness of the editor process the CLI is waiting on.

use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, System};

// sysinfo start times have second resolution.
const START_TIME_TOLERANCE_SECS: u64 = 2;

/// The editor process as it was when the wait began. Identified by pid plus
/// start time so a recycled pid does not look alive.
#[derive(Debug)]
pub struct HostProcess {
    pid: u32,
    start_time: Option<u64>,
}

impl HostProcess {
    pub fn capture(pid: u32) -> Self {
        let start_time = inspect(pid).map(|(start, _)| start);
        Self { pid, start_time }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        let Some((start, status)) = inspect(self.pid) else {
            return false;
        };
        if matches!(status, ProcessStatus::Zombie | ProcessStatus::Dead) {
            return false;
        }
        match self.start_time {
            Some(expected) => start.abs_diff(expected) <= START_TIME_TOLERANCE_SECS,
            None => true,
        }
    }
}

fn inspect(pid: u32) -> Option<(u64, ProcessStatus)> {
    let mut sys = System::new();
    let sys_pid = Pid::from(pid as usize);
    if !sys.refresh_process_specifics(sys_pid, ProcessRefreshKind::new()) {
        return None;
    }
    sys.process(sys_pid)
        .map(|process| (process.start_time(), process.status()))
}
