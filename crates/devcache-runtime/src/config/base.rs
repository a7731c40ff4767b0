use super::allocator::AllocatorConfig;
use alloc::sync::Arc;

/// Static mutex holding the global configuration, initialized as `None`.
static DEVCACHE_GLOBAL_CONFIG: spin::Mutex<Option<Arc<GlobalConfig>>> = spin::Mutex::new(None);

/// Represents the global configuration of the allocators.
#[derive(Default, Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct GlobalConfig {
    /// Configuration of the caching allocators.
    #[serde(default)]
    pub allocator: AllocatorConfig,
}

impl GlobalConfig {
    /// Retrieves the current global configuration, loading it from the current directory if not set.
    ///
    /// If no configuration is set, it attempts to load one from `devcache.toml` or `DevCache.toml`
    /// in the current directory or its parents. If no file is found, a default configuration is
    /// used. Environment variables are applied on top of it.
    ///
    /// # Notes
    ///
    /// Calling this function goes through a global static lock. Allocators read it once when they
    /// are created, not on every allocation.
    pub fn get() -> Arc<Self> {
        let mut state = DEVCACHE_GLOBAL_CONFIG.lock();
        match state.as_ref() {
            Some(config) => config.clone(),
            None => {
                cfg_if::cfg_if! {
                    if #[cfg(std_io)] {
                        let config = Self::from_current_dir();
                        let config = config.override_from_env();
                    } else {
                        let config = Self::default();
                    }
                }

                let config = Arc::new(config);
                *state = Some(config.clone());
                config
            }
        }
    }

    #[cfg(std_io)]
    /// Save the current configuration to the provided file path.
    pub fn save_default<P: AsRef<std::path::Path>>(path: P) -> std::io::Result<()> {
        use std::io::Write;

        let config = Self::get();
        let content = toml::to_string_pretty(config.as_ref()).map_err(std::io::Error::other)?;
        let mut file = std::fs::File::create(path)?;
        file.write_all(content.as_bytes())?;

        Ok(())
    }

    /// Sets the global configuration to the provided value.
    ///
    /// # Panics
    /// Panics if the configuration has already been set or read, as it cannot be overridden.
    ///
    /// # Warning
    /// This method must be called at the start of the program, before any calls to `get`.
    pub fn set(config: Self) {
        let mut state = DEVCACHE_GLOBAL_CONFIG.lock();
        if state.is_some() {
            panic!("Cannot set the global configuration multiple times.");
        }
        *state = Some(Arc::new(config));
    }

    #[cfg(std_io)]
    /// Overrides configuration fields based on environment variables.
    pub fn override_from_env(mut self) -> Self {
        use super::allocator::AllocatorLogLevel;

        if let Ok(val) = std::env::var("DEVCACHE_DEBUG_LOG") {
            let logger = &mut self.allocator.logger;
            logger.level = AllocatorLogLevel::Basic;

            match val.as_str() {
                "stdout" => logger.stdout = true,
                "stderr" => logger.stderr = true,
                "1" | "true" => logger.file = Some("/tmp/devcache.log".into()),
                "full" => {
                    logger.level = AllocatorLogLevel::Full;
                    logger.stderr = true;
                }
                "0" | "false" => logger.level = AllocatorLogLevel::Disabled,
                file_path => logger.file = Some(file_path.into()),
            }
        }

        if let Ok(val) = std::env::var("DEVCACHE_BIND_STREAM") {
            match val.as_str() {
                "1" | "true" => self.allocator.bind_stream = true,
                "0" | "false" => self.allocator.bind_stream = false,
                _ => {}
            }
        }

        if let Ok(val) = std::env::var("DEVCACHE_SPLIT_THRESHOLD") {
            match val.parse::<f64>() {
                Ok(threshold) if threshold > 0.0 && threshold <= 1.0 => {
                    self.allocator.split_threshold = threshold;
                }
                _ => log::warn!("Ignoring invalid DEVCACHE_SPLIT_THRESHOLD value {val:?}"),
            }
        }

        self
    }

    // Loads configuration from `devcache.toml` or `DevCache.toml` in the current directory or its parents.
    //
    // Traverses up the directory tree until a valid configuration file is found or the root is reached.
    // Returns a default configuration if no file is found.
    #[cfg(std_io)]
    fn from_current_dir() -> Self {
        let Ok(mut dir) = std::env::current_dir() else {
            return Self::default();
        };

        loop {
            if let Ok(content) = Self::from_file_path(dir.join("devcache.toml")) {
                return content;
            }

            if let Ok(content) = Self::from_file_path(dir.join("DevCache.toml")) {
                return content;
            }

            if !dir.pop() {
                break;
            }
        }

        Self::default()
    }

    // Loads configuration from a specified file path.
    #[cfg(std_io)]
    fn from_file_path<P: AsRef<std::path::Path>>(path: P) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = match toml::from_str(&content) {
            Ok(val) => val,
            Err(err) => panic!("The file provided doesn't have the right format => {err:?}"),
        };

        Ok(config)
    }
}
