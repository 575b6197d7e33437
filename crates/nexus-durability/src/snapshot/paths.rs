//! On-disk locations of per-graph durability files

use crate::Result;
use crate::error::IoResultExt;
use std::path::{Path, PathBuf};

/// File name of the binary superblock
pub fn graphstate_file_name(name: &str) -> String {
    format!("{}.graphstate.dat", name)
}

/// `<dir>/<name>.graphstate.dat`
pub fn graphstate_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(graphstate_file_name(name))
}

/// `<dir>/<name>.graphstate.adoc`
pub fn report_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.graphstate.adoc", name))
}

/// `<dir>/property/virtual/<name>.0.dat`
pub fn vprop_path(dir: &Path, name: &str) -> PathBuf {
    dir.join("property")
        .join("virtual")
        .join(format!("{}.0.dat", name))
}

/// `<dir>.<ts>`, or `<dir>.<ts>.<n>` for `n > 0`
pub fn aside_dir(dir: &Path, ts: u64, n: u32) -> PathBuf {
    let mut name = dir.as_os_str().to_os_string();
    if n == 0 {
        name.push(format!(".{}", ts));
    } else {
        name.push(format!(".{}.{}", ts, n));
    }
    PathBuf::from(name)
}

/// First aside name for `ts` that does not exist yet
pub fn free_aside_dir(dir: &Path, ts: u64) -> PathBuf {
    let mut n = 0;
    loop {
        let candidate = aside_dir(dir, ts, n);
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

fn parse_aside_suffix(suffix: &str) -> Option<(u64, u32)> {
    let mut parts = suffix.split('.');
    let ts = parts.next()?.parse().ok()?;
    let n = match parts.next() {
        Some(n) => n.parse().ok()?,
        None => 0,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((ts, n))
}

/// Aside directories of `dir`, oldest first
pub fn list_asides(dir: &Path) -> Result<Vec<PathBuf>> {
    let (Some(parent), Some(base)) = (dir.parent(), dir.file_name()) else {
        return Ok(Vec::new());
    };
    let parent = if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    };
    if !parent.is_dir() {
        return Ok(Vec::new());
    }
    let prefix = format!("{}.", base.to_string_lossy());
    let mut found = Vec::new();
    for entry in std::fs::read_dir(parent).fs_context("read_dir", parent)? {
        let entry = entry.fs_context("read_dir", parent)?;
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        let Some(suffix) = file_name.strip_prefix(&prefix) else {
            continue;
        };
        if let Some(key) = parse_aside_suffix(suffix) {
            if entry.path().is_dir() {
                found.push((key, entry.path()));
            }
        }
    }
    found.sort_by_key(|(key, _)| *key);
    Ok(found.into_iter().map(|(_, path)| path).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestContext;

    #[test]
    fn test_layout() {
        let dir = Path::new("/data/people");
        assert_eq!(
            graphstate_path(dir, "people"),
            PathBuf::from("/data/people/people.graphstate.dat")
        );
        assert_eq!(
            vprop_path(dir, "people"),
            PathBuf::from("/data/people/property/virtual/people.0.dat")
        );
        assert_eq!(aside_dir(dir, 17, 0), PathBuf::from("/data/people.17"));
        assert_eq!(aside_dir(dir, 17, 2), PathBuf::from("/data/people.17.2"));
    }

    #[test]
    fn test_list_asides_sorted() {
        let ctx = TestContext::new();
        let dir = ctx.path().join("g");
        std::fs::create_dir_all(&dir).unwrap();
        for name in ["g.200", "g.100", "g.100.1", "g.notes", "gx.50"] {
            std::fs::create_dir_all(ctx.path().join(name)).unwrap();
        }
        let asides = list_asides(&dir).unwrap();
        let names: Vec<_> = asides
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["g.100", "g.100.1", "g.200"]);

        assert_eq!(free_aside_dir(&dir, 100), ctx.path().join("g.100.2"));
        assert_eq!(free_aside_dir(&dir, 300), ctx.path().join("g.300"));
    }
}
