//! Configuration module for Lunar
//!
//! Provides the VM configuration, loadable from a `key value` configuration
//! file and overridable from command-line arguments.

mod cli;
mod parser;

pub use cli::{parse_args, print_help, CliArgs};
pub use parser::{parse_config_file, parse_config_str, ConfigParseError};

use std::path::PathBuf;
use std::time::Duration;

/// Resource limits for Lua executions
#[derive(Debug, Clone)]
pub struct LuaLimits {
    /// Maximum estimated heap size in bytes (0 disables the check)
    pub memory_limit: usize,

    /// Maximum instructions per invocation (0 disables the check)
    pub instruction_limit: u64,

    /// Maximum call frame depth
    pub call_stack_limit: usize,

    /// Maximum nesting of calls that re-enter the interpreter from Rust
    /// (metamethods, `pcall`, library callbacks). Every level holds a
    /// nested interpreter loop on the native stack; the default fits a
    /// 2MB thread stack in unoptimized builds.
    pub native_call_limit: usize,

    /// Heap size that triggers the first garbage collection
    pub gc_threshold: usize,
}

impl Default for LuaLimits {
    fn default() -> Self {
        LuaLimits {
            memory_limit: 64 * 1024 * 1024, // 64MB
            instruction_limit: 100_000_000, // 100M instructions
            call_stack_limit: 20_000,
            native_call_limit: 32,
            gc_threshold: 1024 * 1024,
        }
    }
}

/// Cooperative scheduling settings
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Instructions executed per slice before yielding
    pub slice_size: u64,

    /// Wall-clock limit per execution in milliseconds (0 disables it)
    pub timeout_ms: u64,
}

impl SchedulerConfig {
    /// Timeout as a duration, if one is set
    pub fn timeout(&self) -> Option<Duration> {
        if self.timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.timeout_ms))
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            slice_size: 10_000,
            timeout_ms: 0,
        }
    }
}

/// VM configuration
#[derive(Debug, Clone)]
pub struct VMConfig {
    /// Seed `math.random` with a fixed value
    pub deterministic: bool,

    /// Trace every executed instruction
    pub debug: bool,

    /// Resource limits
    pub limits: LuaLimits,

    /// Scheduler settings
    pub scheduler: SchedulerConfig,
}

impl Default for VMConfig {
    fn default() -> Self {
        VMConfig {
            deterministic: true,
            debug: false,
            limits: LuaLimits::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl VMConfig {
    /// Load configuration from a file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigParseError> {
        let path = path.into();
        parse_config_file(&path)
    }

    /// Apply command-line arguments to override config
    pub fn apply_cli_args(&mut self, args: &CliArgs) {
        if let Some(timeout) = args.timeout_ms {
            self.scheduler.timeout_ms = timeout;
        }
        if let Some(slice) = args.slice_size {
            self.scheduler.slice_size = slice;
        }
        if let Some(limit) = args.instruction_limit {
            self.limits.instruction_limit = limit;
        }
        if args.debug {
            self.debug = true;
        }
    }

    /// Get a configuration parameter by name
    pub fn get(&self, param: &str) -> Option<String> {
        let yes_no = |b: bool| if b { "yes" } else { "no" }.to_string();
        match param {
            "memory-limit" => Some(self.limits.memory_limit.to_string()),
            "instruction-limit" => Some(self.limits.instruction_limit.to_string()),
            "call-stack-limit" => Some(self.limits.call_stack_limit.to_string()),
            "native-call-limit" => Some(self.limits.native_call_limit.to_string()),
            "gc-threshold" => Some(self.limits.gc_threshold.to_string()),
            "deterministic" => Some(yes_no(self.deterministic)),
            "debug" => Some(yes_no(self.debug)),
            "slice-size" => Some(self.scheduler.slice_size.to_string()),
            "timeout-ms" => Some(self.scheduler.timeout_ms.to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = VMConfig::default();
        assert!(config.deterministic);
        assert_eq!(config.limits.call_stack_limit, 20_000);
        assert_eq!(config.limits.native_call_limit, 32);
        assert_eq!(config.scheduler.timeout(), None);
        assert_eq!(config.get("debug"), Some("no".to_string()));
        assert_eq!(config.get("unknown"), None);
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = VMConfig::default();
        let args = CliArgs {
            timeout_ms: Some(250),
            slice_size: Some(64),
            debug: true,
            ..CliArgs::default()
        };
        config.apply_cli_args(&args);
        assert_eq!(config.scheduler.timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.scheduler.slice_size, 64);
        assert!(config.debug);
    }
}
