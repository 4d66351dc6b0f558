use std::fs;

use anyhow::{Context, Result};

const ONLINE_CPUS_PATH: &str = "/sys/devices/system/cpu/online";

/// Returns the ids of the online CPUs. Sysfs reports them as a comma list
/// of single ids and inclusive ranges, e.g. `0-3,5,8-11`.
pub fn get_online_cpus() -> Result<Vec<u32>> {
    let ranges = fs::read_to_string(ONLINE_CPUS_PATH)
        .with_context(|| format!("read {ONLINE_CPUS_PATH}"))?;
    parse_cpu_ranges(ranges.trim())
}

fn parse_cpu_ranges(ranges: &str) -> Result<Vec<u32>> {
    let mut cpus = Vec::new();
    for part in ranges.split(',') {
        match part.split_once('-') {
            None => {
                let cpu = part
                    .trim()
                    .parse()
                    .with_context(|| format!("cpu id {part:?}"))?;
                cpus.push(cpu);
            }
            Some((start, end)) => {
                let start: u32 = start
                    .trim()
                    .parse()
                    .with_context(|| format!("range start {start:?}"))?;
                let end: u32 = end
                    .trim()
                    .parse()
                    .with_context(|| format!("range end {end:?}"))?;
                cpus.extend(start..=end);
            }
        }
    }
    Ok(cpus)
}
