//! Configuration loading: parses `aggregator.toml` (or an override path)
//! for the key filter and gather cadence settings a run can tune without
//! touching the calling script. Unknown fields are ignored so the file can
//! evolve without the binary needing a matching update first.

use std::{fs, path::PathBuf};

use anyhow::Result;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Deserialize, Clone)]
pub struct FilterConfig {
    /// If non-empty, only these keys (by exact match or `/`-prefix) are
    /// kept; everything else is dropped before it reaches the buffer.
    #[serde(default)]
    pub keys_to_save: Vec<String>,
    /// Keys to drop even when `keys_to_save` would otherwise keep them.
    #[serde(default)]
    pub keys_to_drop: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            keys_to_save: Vec::new(),
            keys_to_drop: Vec::new(),
        }
    }
}

impl FilterConfig {
    /// Whether `key` survives this filter. An empty `keys_to_save` keeps
    /// everything not explicitly dropped; a non-empty one keeps only keys
    /// matching one of its entries (exact match or ancestor path).
    pub fn keep(&self, key: &str) -> bool {
        if self.keys_to_drop.iter().any(|d| d == key) {
            return false;
        }
        if self.keys_to_save.is_empty() {
            return true;
        }
        self.keys_to_save
            .iter()
            .any(|k| k == key || key.starts_with(&format!("{k}/")))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatherConfig {
    /// How many locally-buffered events accumulate before a round is
    /// triggered automatically. A caller driving `gather()` manually can
    /// ignore this; the demo binary uses it as its default cadence.
    #[serde(default = "GatherConfig::default_interval_events")]
    pub interval_events: u32,
}

impl GatherConfig {
    const fn default_interval_events() -> u32 {
        100
    }
}

impl Default for GatherConfig {
    fn default() -> Self {
        GatherConfig {
            interval_events: Self::default_interval_events(),
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ConfigFile {
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub gather: GatherConfig,
}

#[derive(Debug, Clone, Default)]
pub struct AggregatorConfig {
    pub raw: Option<String>,
    pub file: ConfigFile,
}

impl AggregatorConfig {
    pub fn keep_key(&self, key: &str) -> bool {
        self.file.filter.keep(key)
    }

    pub fn interval_events(&self) -> u32 {
        self.file.gather.interval_events
    }
}

/// Best-effort config path: prefer a local `aggregator.toml`, then the
/// platform config dir, falling back to the bare local filename.
pub fn discover() -> PathBuf {
    let local = PathBuf::from("aggregator.toml");
    if local.exists() {
        return local;
    }
    if let Some(dir) = dirs::config_dir() {
        return dir.join("aggregator").join("aggregator.toml");
    }
    local
}

pub fn load_from(path: Option<PathBuf>) -> Result<AggregatorConfig> {
    let path = path.unwrap_or_else(discover);
    if let Ok(content) = fs::read_to_string(&path) {
        match toml::from_str::<ConfigFile>(&content) {
            Ok(file) => {
                info!(target: "aggregator::config", path = %path.display(), "loaded config");
                Ok(AggregatorConfig {
                    raw: Some(content),
                    file,
                })
            }
            Err(e) => {
                info!(
                    target: "aggregator::config",
                    path = %path.display(),
                    error = %e,
                    "config parse failed, falling back to defaults"
                );
                Ok(AggregatorConfig::default())
            }
        }
    } else {
        Ok(AggregatorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex, MutexGuard};
    use tracing::Level;
    use tracing::subscriber::with_default;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct BufferWriter {
        inner: Arc<Mutex<Vec<u8>>>,
    }

    impl BufferWriter {
        fn new() -> (Self, Arc<Mutex<Vec<u8>>>) {
            let buf = Arc::new(Mutex::new(Vec::new()));
            (Self { inner: buf.clone() }, buf)
        }
    }

    struct LockedWriter<'a> {
        guard: MutexGuard<'a, Vec<u8>>,
    }

    impl<'a> Write for LockedWriter<'a> {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.guard.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for BufferWriter {
        type Writer = LockedWriter<'a>;

        fn make_writer(&'a self) -> Self::Writer {
            LockedWriter {
                guard: self.inner.lock().expect("log buffer poisoned"),
            }
        }
    }

    #[test]
    fn default_config_when_missing_file() {
        let cfg = load_from(Some(PathBuf::from("__nonexistent_aggregator__.toml"))).unwrap();
        assert!(cfg.file.filter.keys_to_save.is_empty());
        assert_eq!(cfg.file.gather.interval_events, 100);
    }

    #[test]
    fn parses_filter_and_gather_sections() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            tmp.path(),
            "[filter]\nkeys_to_save = [\"ebeam\"]\nkeys_to_drop = [\"debug/raw\"]\n[gather]\ninterval_events = 50\n",
        )
        .unwrap();
        let cfg = load_from(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(cfg.file.filter.keys_to_save, vec!["ebeam".to_string()]);
        assert_eq!(cfg.interval_events(), 50);
    }

    #[test]
    fn keep_key_respects_save_and_drop_lists() {
        let cfg = AggregatorConfig {
            raw: None,
            file: ConfigFile {
                filter: FilterConfig {
                    keys_to_save: vec!["ebeam".to_string()],
                    keys_to_drop: vec!["ebeam/debug".to_string()],
                },
                gather: GatherConfig::default(),
            },
        };
        assert!(cfg.keep_key("ebeam/charge"));
        assert!(!cfg.keep_key("ebeam/debug"));
        assert!(!cfg.keep_key("phase_cav/fitTime1"));
    }

    #[test]
    fn parse_failure_falls_back_to_defaults_and_logs() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "not valid toml [[[").unwrap();
        let (writer, buffer) = BufferWriter::new();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .with_target(true)
            .with_ansi(false)
            .without_time()
            .with_writer(writer)
            .finish();

        let cfg = with_default(subscriber, || load_from(Some(tmp.path().to_path_buf())).unwrap());
        assert_eq!(cfg.file.gather.interval_events, 100);
        let log_output = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(log_output.contains("config parse failed"));
    }
}
