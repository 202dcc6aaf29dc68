use lazy_static::lazy_static;
use std::env;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

lazy_static! {
    static ref CONFIG: RwLock<Config> = RwLock::new(Config::new());
}

/// Process-wide engine configuration.
///
/// Loaded once at startup from environment variables, then overridden by a
/// `tsengine.toml` file if present. Neither source is required; every field
/// has a usable default.
#[derive(Debug, Clone)]
pub struct Config {
    /// Character device or file path the TS reader reads 188-byte packets from.
    pub dvr_device: String,
    /// Opaque connection string for the persisted service/multiplex store.
    pub database_path: String,
    /// How long the tuner controller waits for a front-end lock before failing.
    pub tune_timeout: Duration,
    /// How long the tuner controller waits for PAT/PMT/SDT-or-VCT before a scan
    /// candidate is abandoned.
    pub tables_timeout: Duration,
    /// Whether a multiplex is deleted from the store after a failed tune.
    pub remove_failed_frequencies: bool,
    /// Number of packets read per DVR batch.
    pub read_batch_size: usize,
}

impl Config {
    fn new() -> Self {
        let mut config = Config {
            dvr_device: String::from("/dev/dvb/adapter0/dvr0"),
            database_path: String::from("./tsengine.db"),
            tune_timeout: Duration::from_secs(30),
            tables_timeout: Duration::from_secs(5),
            remove_failed_frequencies: false,
            read_batch_size: 20,
        };

        if let Ok(dev) = env::var("TSENGINE_DVR_DEVICE") {
            config.dvr_device = dev;
        }
        if let Ok(db) = env::var("TSENGINE_DATABASE_PATH") {
            config.database_path = db;
        }
        if let Ok(secs) = env::var("TSENGINE_TUNE_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse() {
                config.tune_timeout = Duration::from_secs(secs);
            }
        }

        let config_paths = ["./tsengine.toml", "./config.toml"];
        for path in &config_paths {
            if let Ok(mut file) = File::open(path) {
                let mut content = String::new();
                if file.read_to_string(&mut content).is_ok() {
                    config.apply_lines(&content);
                }
            }
        }

        config
    }

    fn apply_lines(&mut self, content: &str) {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim().trim_matches('"').trim_matches('\'');
            if value.is_empty() {
                continue;
            }
            match key {
                "dvr_device" => self.dvr_device = value.to_string(),
                "database_path" => self.database_path = value.to_string(),
                "tune_timeout_secs" => {
                    if let Ok(secs) = value.parse() {
                        self.tune_timeout = Duration::from_secs(secs);
                    }
                }
                "tables_timeout_secs" => {
                    if let Ok(secs) = value.parse() {
                        self.tables_timeout = Duration::from_secs(secs);
                    }
                }
                "remove_failed_frequencies" => {
                    self.remove_failed_frequencies = value == "true";
                }
                "read_batch_size" => {
                    if let Ok(n) = value.parse() {
                        self.read_batch_size = n;
                    }
                }
                _ => {}
            }
        }
    }

    /// Reloads configuration from the environment and config file.
    pub fn reload() {
        let new_config = Config::new();
        if let Ok(mut config) = CONFIG.write() {
            *config = new_config;
        }
    }
}

/// Returns a clone of the current configuration.
pub fn get() -> Config {
    CONFIG.read().unwrap().clone()
}

/// Creates a default config template file if it doesn't exist.
pub fn create_default_config_template<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    if !path.as_ref().exists() {
        let template = r#"# tsengine configuration
# This is a template. Replace the values with your actual configuration.

dvr_device = "/dev/dvb/adapter0/dvr0"
database_path = "./tsengine.db"
tune_timeout_secs = 30
tables_timeout_secs = 5
remove_failed_frequencies = false
read_batch_size = 20
"#;
        std::fs::write(path, template)?;
    }
    Ok(())
}
