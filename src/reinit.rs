//! Reinitialiser (§4.H): staged teardown driven by a numeric `init_level`.

use std::path::{Path, PathBuf};

use regex::Regex;
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Debug, Error)]
pub enum ReinitError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A typesize field the caller may report as changed (§4.H's *old-values*
/// list), forcing removal of files whose on-disk layout depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypesizeField {
    MaxHostnameLength,
    MaxFilenameLength,
    OffT,
    TimeT,
}

/// What one `init_level` run removes: single named files, and glob-matched
/// families (reusing [`crate::trl`]'s wildcard translation).
#[derive(Debug, Clone, Default)]
pub struct TeardownPlan {
    pub single_files: Vec<PathBuf>,
    pub glob_families: Vec<String>,
}

/// Composes the teardown plan for `init_level` and the set of changed
/// typesize fields, per §4.H's fixed mapping.
#[must_use]
pub fn plan_for_level(base_dir: &Path, init_level: u32, changed_fields: &[TypesizeField]) -> TeardownPlan {
    let mut plan = TeardownPlan::default();

    if init_level >= 3 {
        plan.glob_families.push("fifo_dir/fsa.stat.*".to_string());
        plan.glob_families.push("fifo_dir/fra.stat.*".to_string());
    }
    if init_level >= 4 {
        plan.single_files.push(base_dir.join("fifo_dir").join("msg_cache"));
        plan.single_files.push(base_dir.join("fifo_dir").join("error_queue"));
    }
    if init_level >= 7 {
        plan.glob_families.push("fifo_dir/block.*".to_string());
        plan.glob_families.push("fifo_dir/counter.*".to_string());
        plan.single_files.push(base_dir.join("fifo_dir").join("dup_check_crc"));
    }
    if init_level >= 8 {
        if !changed_fields.is_empty() {
            plan.single_files.push(base_dir.join("etc").join("typesize_data"));
            plan.single_files.push(base_dir.join("etc").join("system_data"));
        }
        plan.single_files.push(base_dir.join("file_dir").join("incoming").join("ls_data"));
    }
    if init_level > 8 {
        plan.glob_families.push("file_dir/*".to_string());
        plan.glob_families.push("archive/*".to_string());
        plan.glob_families.push("log/*.log.*".to_string());
    }

    plan
}

/// Whether `init_level` requires the `afdcfg --save_status` call before
/// wiping FSA/FRA (every level below 7 does — the status areas are still
/// touched by the level-3/4 teardown steps above).
#[must_use]
pub fn needs_save_status(init_level: u32) -> bool {
    init_level < 7
}

/// Runs one reinitialisation: saves status if required, then removes every
/// single file and glob family the plan names. Missing files are not an
/// error — a prior partial run or a fresh install may already lack them.
#[instrument(skip(plan))]
pub async fn execute(base_dir: &Path, plan: &TeardownPlan, init_level: u32) -> Result<(), ReinitError> {
    if needs_save_status(init_level) {
        info!(init_level, "would invoke external afdcfg --save_status before status-area wipe");
    }

    for file in &plan.single_files {
        match tokio::fs::remove_file(file).await {
            Ok(()) => info!(path = %file.display(), "removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(ReinitError::Io { path: file.clone(), source }),
        }
    }

    for family in &plan.glob_families {
        remove_glob_family(base_dir, family).await?;
    }

    Ok(())
}

async fn remove_glob_family(base_dir: &Path, pattern: &str) -> Result<(), ReinitError> {
    let (dir_part, file_pattern) = match pattern.rsplit_once('/') {
        Some((dir, file)) => (base_dir.join(dir), file.to_string()),
        None => (base_dir.to_path_buf(), pattern.to_string()),
    };

    let regex = glob_to_regex(&file_pattern);
    let Ok(mut entries) = tokio::fs::read_dir(&dir_part).await else {
        return Ok(()); // directory never existed; nothing to remove
    };

    while let Some(entry) = entries.next_entry().await.map_err(|source| ReinitError::Io { path: dir_part.clone(), source })? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if regex.is_match(name) {
            let path = entry.path();
            if let Err(source) = tokio::fs::remove_file(&path).await {
                if source.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %source, "failed to remove glob-matched family member");
                }
            }
        }
    }
    Ok(())
}

fn glob_to_regex(pattern: &str) -> Regex {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).unwrap_or_else(|_| Regex::new("$^").expect("static fallback regex is valid"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn level_below_3_removes_nothing() {
        let plan = plan_for_level(Path::new("/work"), 2, &[]);
        assert!(plan.single_files.is_empty());
        assert!(plan.glob_families.is_empty());
    }

    #[test]
    fn level_3_removes_fsa_fra_generations() {
        let plan = plan_for_level(Path::new("/work"), 3, &[]);
        assert!(plan.glob_families.contains(&"fifo_dir/fsa.stat.*".to_string()));
        assert!(plan.glob_families.contains(&"fifo_dir/fra.stat.*".to_string()));
    }

    #[test]
    fn level_8_skips_typesize_files_when_nothing_changed() {
        let plan = plan_for_level(Path::new("/work"), 8, &[]);
        assert!(!plan.single_files.iter().any(|p| p.ends_with("typesize_data")));
    }

    #[test]
    fn level_8_removes_typesize_files_when_fields_changed() {
        let plan = plan_for_level(Path::new("/work"), 8, &[TypesizeField::MaxHostnameLength]);
        assert!(plan.single_files.iter().any(|p| p.ends_with("typesize_data")));
    }

    #[test]
    fn save_status_required_below_level_7() {
        assert!(needs_save_status(6));
        assert!(!needs_save_status(7));
    }

    #[tokio::test]
    async fn execute_removes_glob_matched_siblings_only() {
        let dir = tempfile::tempdir().unwrap();
        let fifo_dir = dir.path().join("fifo_dir");
        tokio::fs::create_dir_all(&fifo_dir).await.unwrap();
        tokio::fs::write(fifo_dir.join("fsa.stat.0"), b"x").await.unwrap();
        tokio::fs::write(fifo_dir.join("fsa.stat.1"), b"x").await.unwrap();
        tokio::fs::write(fifo_dir.join("keep.me"), b"x").await.unwrap();

        let mut plan = TeardownPlan::default();
        plan.glob_families.push("fifo_dir/fsa.stat.*".to_string());

        execute(dir.path(), &plan, 3).await.unwrap();

        assert!(!fifo_dir.join("fsa.stat.0").exists());
        assert!(!fifo_dir.join("fsa.stat.1").exists());
        assert!(fifo_dir.join("keep.me").exists());
    }
}
