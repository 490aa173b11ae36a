use std::path::Path;

use serde::Deserialize;

use super::{AppError, AppResult};

pub const DEFAULT_BUFFER_SIZE: usize = 16384;
pub const DEFAULT_PRECISION_MS: u64 = 100;
pub const MIN_PRECISION_MS: u64 = 10;
pub const DEFAULT_CONCURRENCY: usize = 512;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub input_buffer_size: usize,
    pub output_buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "127.0.0.2".to_string(),
            port: 12345,
            input_buffer_size: DEFAULT_BUFFER_SIZE,
            output_buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Settings of the reactor loop itself.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    /// Upper bound of a poll while no channel is active, in milliseconds.
    pub precision_ms: u64,
    /// Maximum number of channels polled in one cycle.
    pub concurrency: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        ReactorConfig {
            precision_ms: DEFAULT_PRECISION_MS,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetlogConfig {
    /// Entries declaring more bytes are truncated to their tail.
    pub max_entry_size: usize,
    /// Connections silent for longer are closed, 0 disables the check.
    pub idle_timeout_ms: u64,
    /// Path of the log file entries are appended to, `-` for stdout.
    pub output: String,
}

impl Default for NetlogConfig {
    fn default() -> Self {
        NetlogConfig {
            max_entry_size: DEFAULT_BUFFER_SIZE,
            idle_timeout_ms: 0,
            output: "-".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct NetloggerConfig {
    pub network: NetworkConfig,
    pub reactor: ReactorConfig,
    pub netlog: NetlogConfig,
}

impl NetloggerConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<NetloggerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(config::Environment::with_prefix("NETLOGGER").separator("__"))
            .build()?;

        let netlogger_config: NetloggerConfig = config.try_deserialize()?;
        netlogger_config.validate()?;

        Ok(netlogger_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.reactor.precision_ms < MIN_PRECISION_MS {
            return Err(AppError::InvalidValue(format!(
                "reactor.precision_ms {} lower than {}",
                self.reactor.precision_ms, MIN_PRECISION_MS
            )));
        }
        if self.reactor.concurrency == 0 {
            return Err(AppError::InvalidValue("reactor.concurrency is 0".into()));
        }
        if self.network.input_buffer_size == 0 || self.network.output_buffer_size == 0 {
            return Err(AppError::InvalidValue("network buffer size is 0".into()));
        }
        if self.netlog.max_entry_size == 0 {
            return Err(AppError::InvalidValue("netlog.max_entry_size is 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_toml_and_fills_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[network]\nip = \"127.0.0.1\"\nport = 4000\n\n[netlog]\nmax_entry_size = 64\n"
        )
        .unwrap();

        let config = NetloggerConfig::set_up_config(file.path()).unwrap();
        assert_eq!(config.network.ip, "127.0.0.1");
        assert_eq!(config.network.port, 4000);
        assert_eq!(config.network.input_buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.netlog.max_entry_size, 64);
        assert_eq!(config.netlog.output, "-");
        assert_eq!(config.reactor.precision_ms, DEFAULT_PRECISION_MS);
    }

    #[test]
    fn rejects_a_too_fine_precision() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[reactor]\nprecision_ms = 1\n").unwrap();

        let result = NetloggerConfig::set_up_config(file.path());
        assert!(matches!(result, Err(AppError::InvalidValue(_))));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let result = NetloggerConfig::set_up_config("/nonexistent/netlogger.toml");
        assert!(matches!(result, Err(AppError::ConfigFileError(_))));
    }
}
