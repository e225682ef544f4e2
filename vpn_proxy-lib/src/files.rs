use regex::Regex;
use thiserror::Error;

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Outcome of an idempotent operation against OS state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Change {
    Changed,
    Unchanged,
}

impl Change {
    pub fn changed(self) -> bool {
        self == Change::Changed
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error on `{path}`: {source}")]
    Io { path: PathBuf, source: io::Error },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> Error + '_ {
    move |source| Error::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write `data` to `path` only if the current content differs.
pub fn ensure_file(path: &Path, data: &str, label: &str) -> Result<Change, Error> {
    match fs::read_to_string(path) {
        Ok(existing) if existing == data => {
            tracing::debug!(file = %path.display(), "{label} is up to date");
            Ok(Change::Unchanged)
        }
        Ok(_) => {
            tracing::warn!(file = %path.display(), "{label} contents don't match, overwriting");
            fs::write(path, data).map_err(io_err(path))?;
            Ok(Change::Changed)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::info!(file = %path.display(), "writing {label}");
            fs::write(path, data).map_err(io_err(path))?;
            Ok(Change::Changed)
        }
        Err(e) => Err(io_err(path)(e)),
    }
}

/// [`ensure_file`] for secret material: mode 0600 regardless of umask.
pub fn ensure_private_file(path: &Path, data: &str, label: &str) -> Result<Change, Error> {
    let change = ensure_file(path, data, label)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(io_err(path))?;
    Ok(change)
}

/// Unlink `path` if present.
pub fn remove_file(path: &Path, label: &str) -> Result<Change, Error> {
    match fs::remove_file(path) {
        Ok(()) => {
            tracing::info!(file = %path.display(), "removed {label}");
            Ok(Change::Changed)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(file = %path.display(), "{label} already removed");
            Ok(Change::Unchanged)
        }
        Err(e) => Err(io_err(path)(e)),
    }
}

// the table file format: "<index><whitespace><name>"
static RTABLE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\s+(\S+)\s*$").expect("static regex"));

fn read_lines(path: &Path) -> Result<Vec<String>, Error> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content.lines().map(str::to_string).collect()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(io_err(path)(e)),
    }
}

fn write_lines(path: &Path, lines: &[String]) -> Result<(), Error> {
    let mut content = lines.join("\n");
    content.push('\n');
    fs::write(path, content).map_err(io_err(path))
}

/// Register a routing table name under `index`, evicting any line that
/// claims either the index or the name.
pub fn add_rtable(path: &Path, index: i64, rtable: &str) -> Result<Change, Error> {
    let mut lines = Vec::new();
    let mut conflicts = Vec::new();
    for line in read_lines(path)? {
        if let Some(caps) = RTABLE_LINE.captures(&line) {
            let (found_index, found_name) = (&caps[1], &caps[2]);
            if found_index == index.to_string() || found_name == rtable {
                conflicts.push((found_index.to_string(), found_name.to_string()));
                continue;
            }
        }
        lines.push(line);
    }

    if conflicts.len() == 1 && conflicts[0] == (index.to_string(), rtable.to_string()) {
        tracing::debug!(%rtable, "routing table already created");
        return Ok(Change::Unchanged);
    }
    if conflicts.is_empty() {
        tracing::info!(%rtable, %index, "creating routing table");
    } else {
        tracing::warn!(%rtable, ?conflicts, "creating routing table, removing conflicting lines");
    }
    lines.push(format!("{index}\t{rtable}"));
    write_lines(path, &lines)?;
    Ok(Change::Changed)
}

/// Remove the `index`/`rtable` line; other lines stay untouched.
pub fn del_rtable(path: &Path, index: i64, rtable: &str) -> Result<Change, Error> {
    let before = read_lines(path)?;
    let lines: Vec<String> = before
        .iter()
        .filter(|line| {
            !RTABLE_LINE
                .captures(line)
                .is_some_and(|caps| &caps[1] == index.to_string() && &caps[2] == rtable)
        })
        .cloned()
        .collect();
    if lines.len() == before.len() {
        tracing::debug!(%rtable, "routing table already removed");
        return Ok(Change::Unchanged);
    }
    tracing::info!(%rtable, "removing routing table");
    write_lines(path, &lines)?;
    Ok(Change::Changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STOCK: &str = "#\n# reserved values\n#\n255\tlocal\n254\tmain\n253\tdefault\n0\tunspec\n";

    fn rt_tables(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("rt_tables");
        fs::write(&path, STOCK).expect("write fixture");
        path
    }

    #[test]
    fn ensure_file_writes_once_then_reports_unchanged() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tun1.conf");
        assert_eq!(ensure_file(&path, "dev tun1", "conf file")?, Change::Changed);
        assert_eq!(ensure_file(&path, "dev tun1", "conf file")?, Change::Unchanged);
        assert_eq!(ensure_file(&path, "dev tun2", "conf file")?, Change::Changed);
        assert_eq!(fs::read_to_string(&path)?, "dev tun2");
        Ok(())
    }

    #[test]
    fn private_file_gets_0600() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tun1.key");
        ensure_private_file(&path, "secret", "key file")?;
        let mode = fs::metadata(&path)?.permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        Ok(())
    }

    #[test]
    fn remove_file_is_idempotent() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tun1.key");
        fs::write(&path, "secret")?;
        assert_eq!(remove_file(&path, "key file")?, Change::Changed);
        assert_eq!(remove_file(&path, "key file")?, Change::Unchanged);
        Ok(())
    }

    #[test]
    fn add_rtable_appends_and_preserves_other_lines() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = rt_tables(&dir);
        assert_eq!(add_rtable(&path, 1, "rt_vpn-proxy-tun1")?, Change::Changed);
        let content = fs::read_to_string(&path)?;
        assert!(content.contains("255\tlocal"));
        assert!(content.contains("# reserved values"));
        assert!(content.ends_with("1\trt_vpn-proxy-tun1\n"));
        Ok(())
    }

    #[test]
    fn add_rtable_exact_match_is_unchanged() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = rt_tables(&dir);
        add_rtable(&path, 1, "rt_vpn-proxy-tun1")?;
        let before = fs::read_to_string(&path)?;
        assert_eq!(add_rtable(&path, 1, "rt_vpn-proxy-tun1")?, Change::Unchanged);
        assert_eq!(fs::read_to_string(&path)?, before);
        Ok(())
    }

    #[test]
    fn add_rtable_evicts_conflicting_index_and_name() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = rt_tables(&dir);
        add_rtable(&path, 1, "rt_old")?;
        add_rtable(&path, 7, "rt_vpn-proxy-tun1")?;
        // claims index 1 and the name of table 7: both lines must go
        assert_eq!(add_rtable(&path, 1, "rt_vpn-proxy-tun1")?, Change::Changed);
        let content = fs::read_to_string(&path)?;
        assert!(!content.contains("rt_old"));
        assert!(!content.contains("7\trt_vpn-proxy-tun1"));
        assert!(content.contains("1\trt_vpn-proxy-tun1"));
        Ok(())
    }

    #[test]
    fn del_rtable_removes_only_the_exact_pair() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = rt_tables(&dir);
        add_rtable(&path, 1, "rt_vpn-proxy-tun1")?;
        add_rtable(&path, 2, "rt_vpn-proxy-tun2")?;
        assert_eq!(del_rtable(&path, 1, "rt_vpn-proxy-tun1")?, Change::Changed);
        assert_eq!(del_rtable(&path, 1, "rt_vpn-proxy-tun1")?, Change::Unchanged);
        let content = fs::read_to_string(&path)?;
        assert!(!content.contains("rt_vpn-proxy-tun1\n"));
        assert!(content.contains("2\trt_vpn-proxy-tun2"));
        assert!(content.contains("254\tmain"));
        Ok(())
    }
}
