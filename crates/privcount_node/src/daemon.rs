//! PID-file lifecycle management for a backgrounded node process (operator
//! surface, §9.3). A node is started in the foreground by default; `start`
//! re-execs the current binary with `--foreground` and records its PID so
//! `stop`/`status` can find it later.

use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use sysinfo::{Pid, System};
use tracing::info;

use crate::config::privcount_data_dir;

pub struct DaemonManager;

impl DaemonManager {
    pub fn pid_file(role: &str) -> PathBuf {
        privcount_data_dir().join(format!("{role}.pid"))
    }

    pub fn start(role: &str, config_path: &str) -> Result<(), String> {
        let pid_file = Self::pid_file(role);

        if let Ok(content) = fs::read_to_string(&pid_file) {
            if let Ok(pid_val) = content.trim().parse::<usize>() {
                let system = System::new_all();
                if system.process(Pid::from(pid_val)).is_some() {
                    return Err(format!("{role} daemon already running with PID {pid_val}"));
                }
            }
        }

        let exe = std::env::current_exe().map_err(|e| e.to_string())?;
        let child = Command::new(exe)
            .arg(role)
            .arg("--config")
            .arg(config_path)
            .arg("--foreground")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| format!("failed to spawn {role} daemon: {e}"))?;

        fs::write(&pid_file, child.id().to_string())
            .map_err(|e| format!("failed to write PID file: {e}"))?;
        info!(role, pid = child.id(), "node daemon started");
        Ok(())
    }

    pub fn stop(role: &str) -> Result<(), String> {
        let pid_file = Self::pid_file(role);
        let content = fs::read_to_string(&pid_file)
            .map_err(|_| format!("no active {role} daemon found (missing PID file)"))?;
        let pid_val: usize = content
            .trim()
            .parse()
            .map_err(|_| "invalid PID file content".to_string())?;

        let system = System::new_all();
        if let Some(process) = system.process(Pid::from(pid_val)) {
            process.kill();
            let _ = fs::remove_file(&pid_file);
            info!(role, pid = pid_val, "node daemon stopped");
            Ok(())
        } else {
            let _ = fs::remove_file(&pid_file);
            Err(format!("process {pid_val} not found, removed stale PID file"))
        }
    }

    /// `(running, pid)` for this role's daemon.
    pub fn status(role: &str) -> (bool, Option<u32>) {
        let pid_file = Self::pid_file(role);
        match fs::read_to_string(pid_file) {
            Ok(content) => match content.trim().parse::<u32>() {
                Ok(pid_val) => {
                    let system = System::new_all();
                    let running = system.process(Pid::from(pid_val as usize)).is_some();
                    (running, running.then_some(pid_val))
                }
                Err(_) => (false, None),
            },
            Err(_) => (false, None),
        }
    }
}
