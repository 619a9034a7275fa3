
use std::path::Path;

use crate::config::Config;
use crate::paths::DataPaths;

pub(crate) const TEST_MODEL: &str = "test-model";

/// Config tuned for tests: small batches, near-zero rate limit interval.
pub(crate) fn test_config(batch_size: usize) -> Config {
    let mut config = Config::default();
    config.input.id_column = Some("CDE ID".to_string());
    config.embedding.model = TEST_MODEL.to_string();
    config.embedding.batch_size = batch_size;
    config.embedding.requests_per_minute = 60_000;
    config
}

pub(crate) fn write_csv(dir: &Path, rows: &[(&str, &str)]) -> std::path::PathBuf {
    let path = dir.join("cde.csv");
    let mut writer = csv::Writer::from_path(&path).unwrap();
    writer.write_record(["CDE ID", "Question Texts", "Other"]).unwrap();
    for (id, text) in rows {
        writer.write_record([*id, *text, "x"]).unwrap();
    }
    writer.flush().unwrap();
    path
}

pub(crate) fn test_paths(dir: &Path) -> DataPaths {
    let base = dir.join("data");
    std::fs::create_dir_all(&base).unwrap();
    DataPaths::new(&base)
}
