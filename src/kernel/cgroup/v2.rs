//! Cgroup v2 accounting and enforcement for one sandboxed process
//!
//! Each process gets its own leaf under the configured base. CPU time comes
//! from cpu.stat and covers every descendant, OOM kills from memory.events.

use crate::config::types::{ControlError, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Cgroup v2 hierarchy root for procbox instances
pub struct CgroupV2 {
    base_path: PathBuf,
}

impl CgroupV2 {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Unified hierarchy mounted and our base usable
    pub fn is_available(&self) -> bool {
        if !Path::new("/sys/fs/cgroup/cgroup.controllers").exists() {
            return false;
        }
        fs::create_dir_all(&self.base_path).is_ok()
    }

    /// Create the leaf cgroup for `instance_id`
    pub fn create(&self, instance_id: &str) -> Result<CgroupInstance> {
        let path = self.base_path.join(instance_id);

        fs::create_dir_all(&path)
            .map_err(|e| ControlError::Cgroup(format!("Failed to create cgroup: {}", e)))?;

        // whole group dies together on OOM
        let oom_group_path = path.join("memory.oom.group");
        if oom_group_path.exists() {
            if let Err(e) = fs::write(&oom_group_path, "1") {
                log::warn!("Failed to set memory.oom.group: {}", e);
            }
        }

        Ok(CgroupInstance { path })
    }
}

/// One leaf cgroup
#[derive(Debug)]
pub struct CgroupInstance {
    path: PathBuf,
}

impl CgroupInstance {
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, file: &str, value: &str) -> Result<()> {
        fs::write(self.path.join(file), value)
            .map_err(|e| ControlError::Cgroup(format!("Failed to write {}: {}", file, e)))
    }

    pub fn attach_process(&self, pid: u32) -> Result<()> {
        self.write("cgroup.procs", &pid.to_string())
    }

    pub fn set_memory_max(&self, limit_bytes: u64) -> Result<()> {
        self.write("memory.max", &limit_bytes.to_string())
    }

    /// usage_usec from cpu.stat
    pub fn cpu_usage_usec(&self) -> Result<u64> {
        let content = fs::read_to_string(self.path.join("cpu.stat"))
            .map_err(|e| ControlError::Cgroup(format!("Failed to read cpu.stat: {}", e)))?;
        parse_cpu_stat(&content)
            .ok_or_else(|| ControlError::Cgroup("cpu.stat has no usage_usec".to_string()))
    }

    /// oom_kill counter from memory.events
    pub fn oom_kill_count(&self) -> u64 {
        fs::read_to_string(self.path.join("memory.events"))
            .ok()
            .and_then(|content| parse_event_counter(&content, "oom_kill"))
            .unwrap_or(0)
    }

    /// Kill every process in the cgroup (kernel 5.14+)
    pub fn kill_all(&self) -> Result<()> {
        self.write("cgroup.kill", "1")
    }

    pub fn remove(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_dir(&self.path)
                .map_err(|e| ControlError::Cgroup(format!("Failed to remove cgroup: {}", e)))?;
        }
        Ok(())
    }
}

fn parse_cpu_stat(content: &str) -> Option<u64> {
    parse_event_counter(content, "usage_usec")
}

fn parse_event_counter(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() == 2 && parts[0] == key {
            parts[1].parse::<u64>().ok()
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_stat() {
        let content = "usage_usec 123456\nuser_usec 100000\nsystem_usec 23456\n";
        assert_eq!(parse_cpu_stat(content), Some(123456));
        assert_eq!(parse_cpu_stat("user_usec 5\n"), None);
    }

    #[test]
    fn test_parse_memory_events() {
        let content = "low 0\nhigh 0\nmax 3\noom 1\noom_kill 1\n";
        assert_eq!(parse_event_counter(content, "oom_kill"), Some(1));
        assert_eq!(parse_event_counter(content, "oom_group_kill"), None);
    }

    #[test]
    fn test_instance_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        let cgroups = CgroupV2::new(dir.path());
        let instance = cgroups.create("abc").unwrap();

        instance.set_memory_max(4096).unwrap();
        assert_eq!(
            fs::read_to_string(instance.path().join("memory.max")).unwrap(),
            "4096"
        );

        fs::write(instance.path().join("cpu.stat"), "usage_usec 77\n").unwrap();
        assert_eq!(instance.cpu_usage_usec().unwrap(), 77);
        assert_eq!(instance.oom_kill_count(), 0);
    }
}
