//! Server configuration: defaults, environment loading, `key=value` files.

use std::path::Path;

#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Worker threads; 0 means one per hardware thread.
    pub thread_pool_size: usize,
    /// Listen backlog.
    pub max_connections: usize,
    /// Per-read chunk size.
    pub read_buffer_size: usize,
    /// Budget for the bounded read-retry loop.
    pub request_timeout_seconds: u64,
    /// Empty logs to stdout; otherwise append to this file.
    pub log_file: String,
    /// When false only error-level logs are emitted.
    pub enable_logging: bool,
    /// Optional static-file root.
    pub static_directory: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            thread_pool_size: 4,
            max_connections: 1000,
            read_buffer_size: 8192,
            request_timeout_seconds: 30,
            log_file: String::new(),
            enable_logging: true,
            static_directory: String::new(),
        }
    }
}

impl Config {
    /// Load from environment variables, falling back to defaults. A `.env`
    /// file is honored when present.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        Self {
            host: env_or("SERVER_HOST", defaults.host),
            port: env_parse("SERVER_PORT", defaults.port),
            thread_pool_size: env_parse("THREAD_POOL_SIZE", defaults.thread_pool_size),
            max_connections: env_parse("MAX_CONNECTIONS", defaults.max_connections),
            read_buffer_size: env_parse("READ_BUFFER_SIZE", defaults.read_buffer_size),
            request_timeout_seconds: env_parse(
                "REQUEST_TIMEOUT_SECONDS",
                defaults.request_timeout_seconds,
            ),
            log_file: env_or("LOG_FILE", defaults.log_file),
            enable_logging: std::env::var("ENABLE_LOGGING")
                .map(|v| parse_bool(&v))
                .unwrap_or(defaults.enable_logging),
            static_directory: env_or("STATIC_DIRECTORY", defaults.static_directory),
        }
    }

    /// Load from a `key=value` file. A missing file yields defaults;
    /// unknown keys and malformed lines are ignored.
    pub fn from_file(path: impl AsRef<Path>) -> Self {
        let mut config = Self::default();

        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(_) => return config,
        };

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some(eq) = line.find('=') else { continue };
            let key = line[..eq].trim();
            let value = line[eq + 1..].trim();

            match key {
                "host" => config.host = value.to_string(),
                "port" => set_parsed(&mut config.port, value),
                "thread_pool_size" => set_parsed(&mut config.thread_pool_size, value),
                "max_connections" => set_parsed(&mut config.max_connections, value),
                "read_buffer_size" => set_parsed(&mut config.read_buffer_size, value),
                "request_timeout_seconds" => {
                    set_parsed(&mut config.request_timeout_seconds, value)
                }
                "log_file" => config.log_file = value.to_string(),
                "enable_logging" => config.enable_logging = parse_bool(value),
                "static_directory" => config.static_directory = value.to_string(),
                _ => {}
            }
        }

        config
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, value: &str) {
    if let Ok(parsed) = value.parse() {
        *slot = parsed;
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.thread_pool_size, 4);
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.read_buffer_size, 8192);
        assert_eq!(config.request_timeout_seconds, 30);
        assert!(config.log_file.is_empty());
        assert!(config.enable_logging);
        assert!(config.static_directory.is_empty());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::from_file("/no/such/config/file.conf");
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn file_values_override_defaults() {
        let path = std::env::temp_dir().join(format!("vigil-config-{}.conf", std::process::id()));
        std::fs::write(
            &path,
            "# server settings\n\
             host = 127.0.0.1\n\
             port = 9090\n\
             thread_pool_size = 8\n\
             enable_logging = false\n\
             bogus_key = whatever\n\
             not a key value line\n",
        )
        .unwrap();

        let config = Config::from_file(&path);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9090);
        assert_eq!(config.thread_pool_size, 8);
        assert!(!config.enable_logging);
        // Untouched keys keep defaults.
        assert_eq!(config.max_connections, 1000);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn malformed_numbers_keep_defaults() {
        let path = std::env::temp_dir().join(format!("vigil-config-bad-{}.conf", std::process::id()));
        std::fs::write(&path, "port = eighty\n").unwrap();

        let config = Config::from_file(&path);
        assert_eq!(config.port, 8080);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn bind_addr_joins_host_and_port() {
        let config = Config::default();
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
    }
}
