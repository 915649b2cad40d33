//! Per-process readings from /proc
//!
//! Used when no cgroup is attached. Memory figures come from the Vm* lines
//! of /proc/<pid>/status. CPU time and the resident size limits are checked
//! against come from whole process groups, found by walking /proc/*/stat.

use crate::config::types::{ControlError, Result};
use std::fs;

/// Memory figures in bytes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStatus {
    /// VmRSS
    pub rss: u64,
    /// VmHWM, resident high-water mark since start or last clear_refs
    pub hwm: u64,
    /// VmSize
    pub size: u64,
    /// VmPeak
    pub peak: u64,
}

pub fn clock_ticks() -> u64 {
    // SAFETY: sysconf has no preconditions and touches no memory of ours
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as u64
    } else {
        100
    }
}

/// Usage summed over every live member of a process group
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupUsage {
    /// Own time of each member plus the time of children they reaped
    pub cpu_us: u64,
    /// Sum of member resident sizes in bytes
    pub rss: u64,
    pub members: usize,
}

/// Fields of one /proc/<pid>/stat line the group walk needs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct StatFields {
    pgrp: u32,
    /// utime + stime + cutime + cstime
    ticks: u64,
    rss_pages: u64,
}

fn parse_stat_fields(content: &str) -> Option<StatFields> {
    let rest = &content[content.rfind(')')? + 1..];
    let parts: Vec<&str> = rest.split_whitespace().collect();
    // parts[2] is field 5 (pgrp), parts[21] field 24 (rss)
    let field = |i: usize| parts.get(i).and_then(|v| v.parse::<i64>().ok());
    let ticks = [11, 12, 13, 14]
        .iter()
        .map(|&i| field(i).map(|v| v.max(0) as u64))
        .sum::<Option<u64>>()?;
    Some(StatFields {
        pgrp: u32::try_from(field(2)?).ok()?,
        ticks,
        rss_pages: field(21)?.max(0) as u64,
    })
}

fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions and touches no memory of ours
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

/// Walk /proc for members of process group `pgid`.
///
/// Members exiting mid-walk are skipped. Time of members already reaped by
/// another member is carried in that member's cutime/cstime.
pub fn group_usage(pgid: u32) -> Result<GroupUsage> {
    let entries = fs::read_dir("/proc")
        .map_err(|e| ControlError::Process(format!("Failed to list /proc: {}", e)))?;

    let mut ticks = 0u64;
    let mut pages = 0u64;
    let mut members = 0usize;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(content) = fs::read_to_string(format!("/proc/{}/stat", pid)) else {
            continue;
        };
        match parse_stat_fields(&content) {
            Some(fields) if fields.pgrp == pgid => {
                ticks += fields.ticks;
                pages += fields.rss_pages;
                members += 1;
            }
            _ => {}
        }
    }

    Ok(GroupUsage {
        cpu_us: ticks * 1_000_000 / clock_ticks(),
        rss: pages * page_size(),
        members,
    })
}

pub fn memory_status(pid: u32) -> Result<MemoryStatus> {
    let status_path = format!("/proc/{}/status", pid);
    let content = fs::read_to_string(&status_path)
        .map_err(|e| ControlError::Process(format!("Failed to read {}: {}", status_path, e)))?;
    Ok(parse_status(&content))
}

fn parse_status(content: &str) -> MemoryStatus {
    let mut status = MemoryStatus::default();
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let kib = value
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let bytes = kib * 1024;
        match key {
            "VmRSS" => status.rss = bytes,
            "VmHWM" => status.hwm = bytes,
            "VmSize" => status.size = bytes,
            "VmPeak" => status.peak = bytes,
            _ => {}
        }
    }
    status
}

/// Reset VmHWM to the current RSS
pub fn reset_peak_rss(pid: u32) -> Result<()> {
    fs::write(format!("/proc/{}/clear_refs", pid), "5")
        .map_err(|e| ControlError::Process(format!("Failed to reset peak RSS: {}", e)))
}
