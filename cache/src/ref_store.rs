//! Ref-file bookkeeping shared by the Artifact Cache (§4.9) and Source Cache (§4.10): both key
//! their persisted protos by an externally-produced ref string treated as a relative path under a
//! cache root.
//!
//! Grounded on `_basecache.py`'s `_list_refs_mtimes`/`_remove_ref`.

use std::path::{Path, PathBuf};

/// The on-disk location for `ref_name` under `root`.
pub(crate) fn ref_path(root: &Path, ref_name: &str) -> PathBuf {
    root.join(ref_name)
}

/// Lists every ref under `root`, in ascending mtime order (oldest first — LRU order, §4.9 P5),
/// optionally filtered to those whose path (relative to `root`) matches `glob_expr`.
pub(crate) fn list_refs_by_mtime(root: &Path, glob_expr: Option<&str>) -> std::io::Result<Vec<String>> {
    let pattern = glob_expr.map(glob::Pattern::new).transpose().map_err(|e| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("invalid glob {glob_expr:?}: {e}"))
    })?;

    let mut refs = Vec::new();
    if !root.is_dir() {
        return Ok(refs);
    }
    for entry in walkdir::WalkDir::new(root).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let relative_str = relative.to_string_lossy().into_owned();
        if let Some(pattern) = &pattern {
            if !pattern.matches(&relative_str) {
                continue;
            }
        }
        let mtime = entry.metadata()?.modified()?;
        refs.push((mtime, relative_str));
    }
    sort_refs_by_mtime_then_name(&mut refs);
    Ok(refs.into_iter().map(|(_, r)| r).collect())
}

/// `list_refs_by_mtime`'s ordering (§8 P5: "sorted non-descending by mtime; ties break by name
/// lexicographically"), split out so the tie-break can be tested without depending on the
/// filesystem's mtime granularity.
fn sort_refs_by_mtime_then_name(refs: &mut [(std::time::SystemTime, String)]) {
    refs.sort_by(|(mtime_a, name_a), (mtime_b, name_b)| mtime_a.cmp(mtime_b).then_with(|| name_a.cmp(name_b)));
}

/// Deletes the file at `root.join(leaf)`, then removes any now-empty parent directories up to
/// (not including) `root` (§4.9 `_remove_ref`'s "pruning away directories which can be removed").
pub(crate) fn prune_empty_parents(path: &Path, root: &Path) {
    let mut dir = path.parent();
    while let Some(d) = dir {
        if d == root || !d.starts_with(root) {
            break;
        }
        match std::fs::remove_dir(d) {
            Ok(()) => dir = d.parent(),
            Err(_) => break,
        }
    }
}

/// Deduplicates a ref list while preserving order (§4.9: strong and weak key may coincide).
pub(crate) fn dedupe_refs(refs: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    refs.iter().filter(|r| seen.insert(r.as_str())).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_refs_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"1").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        std::fs::write(dir.path().join("b"), b"2").unwrap();

        let refs = list_refs_by_mtime(dir.path(), None).unwrap();
        assert_eq!(refs, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn breaks_mtime_ties_lexicographically() {
        let same_time = std::time::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        let mut refs = vec![
            (same_time, "c".to_string()),
            (same_time, "a".to_string()),
            (same_time, "b".to_string()),
        ];

        sort_refs_by_mtime_then_name(&mut refs);

        let names: Vec<String> = refs.into_iter().map(|(_, name)| name).collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }

    #[test]
    fn filters_by_glob() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("proj")).unwrap();
        std::fs::write(dir.path().join("proj").join("a"), b"1").unwrap();
        std::fs::write(dir.path().join("other"), b"2").unwrap();

        let refs = list_refs_by_mtime(dir.path(), Some("proj/*")).unwrap();
        assert_eq!(refs, vec!["proj/a".to_string()]);
    }

    #[test]
    fn prunes_empty_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("x").join("y");
        std::fs::create_dir_all(&nested).unwrap();
        let file = nested.join("ref");
        std::fs::write(&file, b"1").unwrap();

        std::fs::remove_file(&file).unwrap();
        prune_empty_parents(&file, dir.path());

        assert!(!dir.path().join("x").exists());
    }

    #[test]
    fn dedupes_preserving_order() {
        let refs = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        assert_eq!(dedupe_refs(&refs), vec!["a".to_string(), "b".to_string()]);
    }
}
