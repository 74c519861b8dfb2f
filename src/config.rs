//! Pipeline configuration: directories, dated input selection, worker pool size.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

pub const DEFAULT_INPUT_PREFIX: &str = "openaq_pm25_IN_";
pub const DEFAULT_INPUT_EXTENSION: &str = ".csv";

/// Picks the newest input among files named `<prefix><anything><extension>`.
///
/// Inputs carry their generation date in the name (`openaq_pm25_IN_2025-01-31.csv`),
/// so the lexicographically greatest match is the most recent one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatedFileSelector {
    pub prefix: String,
    pub extension: String,
}

impl Default for DatedFileSelector {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_INPUT_PREFIX.to_string(),
            extension: DEFAULT_INPUT_EXTENSION.to_string(),
        }
    }
}

impl DatedFileSelector {
    pub fn new(prefix: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            extension: extension.into(),
        }
    }

    pub fn matches(&self, file_name: &str) -> bool {
        file_name.len() > self.prefix.len() + self.extension.len()
            && file_name.starts_with(&self.prefix)
            && file_name.ends_with(&self.extension)
    }

    pub fn pattern(&self) -> String {
        format!("{}*{}", self.prefix, self.extension)
    }

    pub fn latest_of<I, S>(&self, names: I) -> Option<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .filter(|name| self.matches(name.as_ref()))
            .map(|name| name.as_ref().to_string())
            .max()
    }

    /// Returns `Ok(None)` when the directory is missing or holds no match.
    pub fn select_latest(&self, dir: &Path) -> io::Result<Option<PathBuf>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }

        let latest = self.latest_of(&names);
        debug!(
            component = "config",
            event = "config.input.scan",
            dir = %dir.display(),
            pattern = %self.pattern(),
            candidates = names.len(),
            selected = ?latest
        );
        Ok(latest.map(|name| dir.join(name)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub health_dir: PathBuf,
    pub selector: DatedFileSelector,
    /// `None` runs on rayon's global pool.
    pub workers: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("data/openaq"),
            output_dir: PathBuf::from("outputs/tables"),
            health_dir: PathBuf::from("data/who"),
            selector: DatedFileSelector::default(),
            workers: None,
        }
    }
}

pub fn pipeline_config_from_env() -> PipelineConfig {
    pipeline_config_from_lookup(env_value)
}

/// Builds the config from `AQH_*` keys; `lookup` returns trimmed, non-empty
/// values only.
pub fn pipeline_config_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> PipelineConfig {
    let mut config = PipelineConfig::default();

    if let Some(dir) = lookup("AQH_DATA_DIR") {
        config.input_dir = PathBuf::from(dir);
    }
    if let Some(dir) = lookup("AQH_OUTPUT_DIR") {
        config.output_dir = PathBuf::from(dir);
    }
    if let Some(dir) = lookup("AQH_HEALTH_DIR") {
        config.health_dir = PathBuf::from(dir);
    }
    if let Some(prefix) = lookup("AQH_INPUT_PREFIX") {
        config.selector.prefix = prefix;
    }
    config.workers = lookup("AQH_WORKERS")
        .and_then(|raw| raw.parse::<usize>().ok())
        .filter(|&workers| workers > 0);

    config
}

/// Process environment lookup shared by every `*_from_env` reader.
pub(crate) fn env_value(key: &str) -> Option<String> {
    let raw = env::var(key).ok()?;
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn latest_of_picks_lexicographic_max_among_matches() {
        let selector = DatedFileSelector::default();
        let names = [
            "openaq_pm25_IN_2025-01-09.csv",
            "openaq_pm25_IN_2025-01-31.csv",
            "openaq_pm25_IN_2025-01-10.csv",
            "openaq_pm25_US_2025-12-31.csv",
            "openaq_pm25_IN_2026-01-01.txt",
            "openaq_pm25_IN_.csv",
        ];

        assert_eq!(
            selector.latest_of(names),
            Some("openaq_pm25_IN_2025-01-31.csv".to_string())
        );
    }

    #[test]
    fn latest_of_is_none_without_matches() {
        let selector = DatedFileSelector::default();
        assert_eq!(selector.latest_of(["notes.md", "trend_Delhi.csv"]), None);
    }

    #[test]
    fn select_latest_ignores_directories_and_tolerates_missing_dir() {
        let temp = tempdir().unwrap();
        let selector = DatedFileSelector::default();

        assert_eq!(
            selector.select_latest(&temp.path().join("absent")).unwrap(),
            None
        );

        fs::create_dir(temp.path().join("openaq_pm25_IN_2099-01-01.csv")).unwrap();
        fs::write(temp.path().join("openaq_pm25_IN_2025-03-01.csv"), "city\n").unwrap();

        let selected = selector.select_latest(temp.path()).unwrap();
        assert_eq!(
            selected,
            Some(temp.path().join("openaq_pm25_IN_2025-03-01.csv"))
        );
    }

    #[test]
    fn overrides_directories_prefix_and_workers() {
        let cfg = pipeline_config_from_lookup(lookup_from(&[
            ("AQH_DATA_DIR", "/tmp/in"),
            ("AQH_OUTPUT_DIR", "/tmp/out"),
            ("AQH_INPUT_PREFIX", "openaq_pm25_US_"),
            ("AQH_WORKERS", "3"),
        ]));

        assert_eq!(cfg.input_dir, PathBuf::from("/tmp/in"));
        assert_eq!(cfg.output_dir, PathBuf::from("/tmp/out"));
        assert_eq!(cfg.health_dir, PathBuf::from("data/who"));
        assert_eq!(cfg.selector.prefix, "openaq_pm25_US_");
        assert_eq!(cfg.workers, Some(3));
    }

    #[test]
    fn unusable_worker_counts_fall_back_to_global_pool() {
        for raw in ["zero", "0", "-2"] {
            let cfg = pipeline_config_from_lookup(lookup_from(&[("AQH_WORKERS", raw)]));
            assert_eq!(cfg, PipelineConfig::default(), "{raw}");
        }
    }
}
