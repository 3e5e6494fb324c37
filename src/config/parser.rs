//! Configuration file parser
//!
//! Parses `parameter value` configuration files for Lunar.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;

use super::VMConfig;

/// Error type for configuration parsing
#[derive(Debug, thiserror::Error)]
pub enum ConfigParseError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Invalid line format
    #[error("Invalid line format at line {0}: {1}")]
    Format(usize, String),

    /// Invalid parameter value
    #[error("Invalid value for parameter '{0}' at line {1}: {2}")]
    Value(String, usize, String),

    /// Unknown parameter
    #[error("Unknown parameter '{0}' at line {1}")]
    UnknownParam(String, usize),
}

/// Parse a configuration file
pub fn parse_config_file(path: &Path) -> Result<VMConfig, ConfigParseError> {
    let file = File::open(path)?;
    parse_lines(BufReader::new(file))
}

/// Parse configuration text
pub fn parse_config_str(text: &str) -> Result<VMConfig, ConfigParseError> {
    parse_lines(text.as_bytes())
}

fn parse_lines(reader: impl BufRead) -> Result<VMConfig, ConfigParseError> {
    let mut config = VMConfig::default();

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        let line = line.trim();

        // Skip empty lines and comments
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (param, value) = match line.split_once(char::is_whitespace) {
            Some((param, value)) => (param.to_lowercase(), value.trim()),
            None => return Err(ConfigParseError::Format(line_num + 1, line.to_string())),
        };

        apply_config_param(&mut config, &param, value, line_num + 1)?;
    }

    Ok(config)
}

/// Apply a configuration parameter to the config
fn apply_config_param(
    config: &mut VMConfig,
    param: &str,
    value: &str,
    line_num: usize,
) -> Result<(), ConfigParseError> {
    match param {
        "memory-limit" => {
            config.limits.memory_limit = parse_size(param, value, line_num)? as usize;
        }
        "instruction-limit" => {
            config.limits.instruction_limit = parse_value(param, value, line_num)?;
        }
        "call-stack-limit" => {
            config.limits.call_stack_limit = parse_value(param, value, line_num)?;
        }
        "native-call-limit" => {
            config.limits.native_call_limit = parse_value(param, value, line_num)?;
        }
        "gc-threshold" => {
            config.limits.gc_threshold = parse_size(param, value, line_num)? as usize;
        }
        "deterministic" => {
            config.deterministic = parse_yes_no(param, value, line_num)?;
        }
        "debug" => {
            config.debug = parse_yes_no(param, value, line_num)?;
        }
        "slice-size" => {
            let slice: u64 = parse_value(param, value, line_num)?;
            if slice == 0 {
                return Err(ConfigParseError::Value(param.to_string(), line_num, value.to_string()));
            }
            config.scheduler.slice_size = slice;
        }
        "timeout-ms" => {
            config.scheduler.timeout_ms = parse_value(param, value, line_num)?;
        }
        _ => return Err(ConfigParseError::UnknownParam(param.to_string(), line_num)),
    }
    Ok(())
}

/// Parse a plain value
fn parse_value<T: FromStr>(param: &str, value: &str, line_num: usize) -> Result<T, ConfigParseError> {
    value
        .parse::<T>()
        .map_err(|_| ConfigParseError::Value(param.to_string(), line_num, value.to_string()))
}

/// Parse a yes/no value
fn parse_yes_no(param: &str, value: &str, line_num: usize) -> Result<bool, ConfigParseError> {
    match value.to_lowercase().as_str() {
        "yes" | "1" => Ok(true),
        "no" | "0" => Ok(false),
        _ => Err(ConfigParseError::Value(param.to_string(), line_num, value.to_string())),
    }
}

/// Parse a size value (e.g., 64mb, 2gb)
fn parse_size(param: &str, value: &str, line_num: usize) -> Result<u64, ConfigParseError> {
    let value = value.trim().to_lowercase();
    let idx = value.find(|c: char| !c.is_ascii_digit()).unwrap_or(value.len());
    if idx == 0 {
        return Err(ConfigParseError::Value(param.to_string(), line_num, value));
    }

    let num: u64 = value[..idx]
        .parse()
        .map_err(|_| ConfigParseError::Value(param.to_string(), line_num, value.clone()))?;

    let multiplier = match &value[idx..] {
        "" | "b" => 1,
        "kb" => 1024,
        "mb" => 1024 * 1024,
        "gb" => 1024 * 1024 * 1024,
        _ => return Err(ConfigParseError::Value(param.to_string(), line_num, value)),
    };

    Ok(num * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_basic_config() {
        let config_content = r#"
# Resource limits
memory-limit 16mb
instruction-limit 5000000
call-stack-limit 150

# Scheduling
slice-size 500
timeout-ms 2000
deterministic no
"#;

        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();
        write(path, config_content).unwrap();

        let config = parse_config_file(path).unwrap();
        assert_eq!(config.limits.memory_limit, 16 * 1024 * 1024);
        assert_eq!(config.limits.instruction_limit, 5_000_000);
        assert_eq!(config.limits.call_stack_limit, 150);
        assert_eq!(config.scheduler.slice_size, 500);
        assert_eq!(config.scheduler.timeout_ms, 2000);
        assert!(!config.deterministic);
    }

    #[test]
    fn test_errors_carry_line_numbers() {
        let err = parse_config_str("debug yes\nfrobnicate 3\n").unwrap_err();
        assert!(matches!(err, ConfigParseError::UnknownParam(ref p, 2) if p == "frobnicate"));

        let err = parse_config_str("instruction-limit lots").unwrap_err();
        assert!(matches!(err, ConfigParseError::Value(_, 1, _)));

        let err = parse_config_str("debug").unwrap_err();
        assert!(matches!(err, ConfigParseError::Format(1, _)));

        assert!(parse_config_str("slice-size 0").is_err());
    }

    #[test]
    fn test_parse_yes_no() {
        assert!(parse_yes_no("test", "yes", 1).unwrap());
        assert!(!parse_yes_no("test", "no", 1).unwrap());
        assert!(parse_yes_no("test", "1", 1).unwrap());
        assert!(!parse_yes_no("test", "0", 1).unwrap());
        assert!(parse_yes_no("test", "invalid", 1).is_err());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("test", "1024", 1).unwrap(), 1024);
        assert_eq!(parse_size("test", "1kb", 1).unwrap(), 1024);
        assert_eq!(parse_size("test", "1MB", 1).unwrap(), 1024 * 1024);
        assert_eq!(parse_size("test", "1gb", 1).unwrap(), 1024 * 1024 * 1024);
        assert!(parse_size("test", "invalid", 1).is_err());
        assert!(parse_size("test", "12tb", 1).is_err());
    }
}
