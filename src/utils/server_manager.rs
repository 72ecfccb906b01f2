use std::fs;
use std::path::PathBuf;

use super::logger::Logger;

/// Get the path to the PID file
/// Always use /var/run/weft/weft.pid - one agent, one location
fn get_pid_file_path() -> PathBuf {
    PathBuf::from("/var/run/weft/weft.pid")
}

/// Write PID to file
pub fn write_pid_file(pid: u32) -> Result<(), String> {
    let pid_file = get_pid_file_path();

    // Create parent directory if needed
    if let Some(parent) = pid_file.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create PID directory: {}", e))?;
    }

    fs::write(&pid_file, pid.to_string())
        .map_err(|e| format!("Failed to write PID file: {}", e))?;

    Logger::debug(&format!("Wrote PID {} to {:?}", pid, pid_file));
    Ok(())
}

/// Read PID from file
pub fn read_pid_file() -> Option<i32> {
    let pid_file = get_pid_file_path();

    if !pid_file.exists() {
        return None;
    }

    let content = fs::read_to_string(&pid_file).ok()?;
    content.trim().parse::<i32>().ok()
}

/// Remove PID file
pub fn remove_pid_file() {
    let pid_file = get_pid_file_path();
    if pid_file.exists() {
        fs::remove_file(&pid_file).ok();
        Logger::debug(&format!("Removed PID file: {:?}", pid_file));
    }
}

/// Check whether a previously-recorded daemon process is still alive
pub fn daemon_running() -> Option<i32> {
    let pid = read_pid_file()?;
    // Signal 0 probes existence without delivering anything
    let alive = unsafe { libc::kill(pid, 0) == 0 };
    if alive {
        Some(pid)
    } else {
        None
    }
}

/// Ask a running daemon to shut down
pub fn stop_daemon() -> Result<i32, String> {
    let pid = daemon_running().ok_or_else(|| "no running daemon found".to_string())?;
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        return Err(format!("failed to signal daemon (pid {})", pid));
    }
    Ok(pid)
}
