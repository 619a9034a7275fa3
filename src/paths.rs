use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use homedir::my_home;

/// Files the pipeline reads and writes under the base directory.
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub base_path: PathBuf,
    pub cleaned_path: PathBuf,
    pub embeddings_path: PathBuf,
    pub embeddings_meta_path: PathBuf,
    pub failed_path: PathBuf,
    pub index_dir: PathBuf,
}

impl DataPaths {
    pub fn new(base_path: &Path) -> Self {
        Self {
            base_path: base_path.to_path_buf(),
            cleaned_path: base_path.join("cleaned.jsonl"),
            embeddings_path: base_path.join("embeddings.jsonl"),
            embeddings_meta_path: base_path.join("embeddings.meta.json"),
            failed_path: base_path.join("failed_ids.json"),
            index_dir: base_path.join("index"),
        }
    }

    /// Resolve the base directory (`--base-path`, then `CDE_BASE_PATH`, then
    /// `~/.local/share/cde-search`) and make sure it exists.
    pub fn resolve(base_path: Option<PathBuf>) -> Result<Self> {
        let base_path = match base_path {
            Some(path) => path,
            None => Self::default_base_path()?,
        };

        std::fs::create_dir_all(&base_path).with_context(|| {
            format!("Failed to create base directory {}", base_path.display())
        })?;

        Ok(Self::new(&base_path))
    }

    fn default_base_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("CDE_BASE_PATH") {
            return Ok(PathBuf::from(path));
        }

        let home = my_home()
            .map_err(|err| anyhow::anyhow!("Could not determine home directory: {err:?}"))?
            .context("Home directory path is empty")?;
        Ok(home.join(".local/share/cde-search"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_paths_layout() {
        let paths = DataPaths::new(Path::new("/test/base"));

        assert_eq!(paths.cleaned_path, PathBuf::from("/test/base/cleaned.jsonl"));
        assert_eq!(paths.embeddings_path, PathBuf::from("/test/base/embeddings.jsonl"));
        assert_eq!(
            paths.embeddings_meta_path,
            PathBuf::from("/test/base/embeddings.meta.json")
        );
        assert_eq!(paths.failed_path, PathBuf::from("/test/base/failed_ids.json"));
        assert_eq!(paths.index_dir, PathBuf::from("/test/base/index"));
    }

    #[test]
    fn test_resolve_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("data");

        let paths = DataPaths::resolve(Some(base.clone())).unwrap();

        assert!(base.is_dir());
        assert_eq!(paths.base_path, base);
    }
}
