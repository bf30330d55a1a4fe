//! Cache topology as reported by the OS, for cross-checking measured curves.
//!
//! Linux exposes one directory per cache under `cpu<N>/cache/index<i>`; the first missing index
//! ends the list. Nothing in the measurement path reads this.
use crate::error::Result;
use crate::{format_size, parse_size};
use std::fs;
use std::io;
use std::path::Path;
use tabled::settings::Style;

pub const SYSFS_CPU_ROOT: &str = "/sys/devices/system/cpu";

/// One cache as described by the OS.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheLevel {
    pub level: u32,
    /// `Data`, `Instruction` or `Unified`
    pub kind: String,
    pub size_bytes: Option<usize>,
    pub line_size: Option<usize>,
    pub associativity: Option<usize>,
}

/// Caches visible to logical `cpu` on this machine.
pub fn cache_levels(cpu: usize) -> Result<Vec<CacheLevel>> {
    cache_levels_from(Path::new(SYSFS_CPU_ROOT), cpu)
}

/// Caches visible to logical `cpu` under an alternate sysfs-style `root`.
pub fn cache_levels_from(root: &Path, cpu: usize) -> Result<Vec<CacheLevel>> {
    let cache_dir = root.join(format!("cpu{cpu}")).join("cache");
    let mut levels = Vec::new();

    for index in 0.. {
        let dir = cache_dir.join(format!("index{index}"));
        let Some(level) = read_entry(&dir, "level")? else {
            break;
        };
        let Ok(level) = level.parse() else {
            log::warn!("unparseable cache level {level:?} in {}", dir.display());
            break;
        };

        let number = |name: &str| -> Result<Option<usize>> {
            Ok(read_entry(&dir, name)?.and_then(|text| parse_size(&text).ok()))
        };
        levels.push(CacheLevel {
            level,
            kind: read_entry(&dir, "type")?.unwrap_or_else(|| "Unknown".to_string()),
            size_bytes: number("size")?,
            line_size: number("coherency_line_size")?,
            associativity: number("ways_of_associativity")?,
        });
    }
    Ok(levels)
}

/// Trimmed file contents, `None` if the entry doesn't exist.
fn read_entry(dir: &Path, name: &str) -> Result<Option<String>> {
    match fs::read_to_string(dir.join(name)) {
        Ok(text) => Ok(Some(text.trim().to_string())),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Render the page size and cache list as a table.
pub fn render(levels: &[CacheLevel], page_size: usize) -> String {
    let unknown = || "-".to_string();
    let mut builder = tabled::builder::Builder::new();
    builder.push_record(["Level", "Type", "Size", "Line Size", "Associativity"]);
    for cache in levels {
        builder.push_record([
            format!("L{}", cache.level),
            cache.kind.clone(),
            cache
                .size_bytes
                .map(|bytes| format_size(bytes as u64))
                .unwrap_or_else(unknown),
            cache
                .line_size
                .map(|bytes| format!("{bytes} B"))
                .unwrap_or_else(unknown),
            cache
                .associativity
                .map(|ways| ways.to_string())
                .unwrap_or_else(unknown),
        ]);
    }
    let mut table = builder.build();
    table.with(Style::rounded());
    format!(
        "Page size: {} ({page_size} bytes)\n{table}",
        format_size(page_size as u64)
    )
}
