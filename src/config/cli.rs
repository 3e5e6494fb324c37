//! Command-line argument parser

use std::path::PathBuf;

/// Command-line arguments for the `lunar` runner
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    /// Configuration file path
    pub config: Option<PathBuf>,

    /// Bytecode file to run
    pub script: Option<PathBuf>,

    /// Wall-clock limit in milliseconds
    pub timeout_ms: Option<u64>,

    /// Instructions per scheduler slice
    pub slice_size: Option<u64>,

    /// Instruction limit per invocation
    pub instruction_limit: Option<u64>,

    /// Trace executed instructions
    pub debug: bool,

    /// Print usage and exit
    pub help: bool,

    /// Print the version and exit
    pub version: bool,
}

/// Parse command-line arguments, without the program name
pub fn parse_args<I>(args: I) -> Result<CliArgs, String>
where
    I: IntoIterator<Item = String>,
{
    let args: Vec<String> = args.into_iter().collect();
    let mut cli_args = CliArgs::default();
    let mut i = 0;

    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                cli_args.help = true;
                i += 1;
            }
            "--version" | "-v" => {
                cli_args.version = true;
                i += 1;
            }
            "--debug" | "-d" => {
                cli_args.debug = true;
                i += 1;
            }
            "--config" | "-c" => {
                let value = option_value(&args, i, "--config")?;
                cli_args.config = Some(PathBuf::from(value));
                i += 2;
            }
            "--timeout" | "-t" => {
                let value = option_value(&args, i, "--timeout")?;
                cli_args.timeout_ms = Some(parse_number(value, "--timeout")?);
                i += 2;
            }
            "--slice" => {
                let value = option_value(&args, i, "--slice")?;
                let slice = parse_number(value, "--slice")?;
                if slice == 0 {
                    return Err("Invalid value for --slice: 0".to_string());
                }
                cli_args.slice_size = Some(slice);
                i += 2;
            }
            "--instruction-limit" => {
                let value = option_value(&args, i, "--instruction-limit")?;
                cli_args.instruction_limit = Some(parse_number(value, "--instruction-limit")?);
                i += 2;
            }
            arg if arg.starts_with('-') && arg.len() > 1 => {
                return Err(format!("Unknown option: {}", arg));
            }
            arg => {
                if cli_args.script.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                cli_args.script = Some(PathBuf::from(arg));
                i += 1;
            }
        }
    }

    Ok(cli_args)
}

fn option_value<'a>(args: &'a [String], i: usize, name: &str) -> Result<&'a str, String> {
    args.get(i + 1)
        .map(|s| s.as_str())
        .ok_or_else(|| format!("Missing argument for {}", name))
}

fn parse_number(value: &str, name: &str) -> Result<u64, String> {
    value
        .parse::<u64>()
        .map_err(|_| format!("Invalid value for {}: {}", name, value))
}

/// Print usage information
pub fn print_help() {
    println!("Usage: lunar [OPTIONS] <chunk.json | chunk.luac>");
    println!();
    println!("Options:");
    println!("  --help, -h                 Show this help message");
    println!("  --version, -v              Show version information");
    println!("  --config, -c  <file>       Configuration file to use");
    println!("  --timeout, -t <ms>         Abort the script after this many milliseconds");
    println!("  --slice       <n>          Instructions per scheduler slice");
    println!("  --instruction-limit <n>    Maximum instructions per invocation");
    println!("  --debug, -d                Trace executed instructions");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_cli_args() {
        let parsed = parse_args(args(&["--timeout", "500", "-c", "lunar.conf", "main.json"])).unwrap();
        assert_eq!(parsed.timeout_ms, Some(500));
        assert_eq!(parsed.config, Some(PathBuf::from("lunar.conf")));
        assert_eq!(parsed.script, Some(PathBuf::from("main.json")));
        assert!(!parsed.debug);
    }

    #[test]
    fn test_cli_errors() {
        assert!(parse_args(args(&["--timeout"])).is_err());
        assert!(parse_args(args(&["--timeout", "soon"])).is_err());
        assert!(parse_args(args(&["--bogus"])).is_err());
        assert!(parse_args(args(&["a.json", "b.json"])).is_err());
        assert!(parse_args(args(&["--slice", "0"])).is_err());
    }

    #[test]
    fn test_flags() {
        let parsed = parse_args(args(&["-d", "--help"])).unwrap();
        assert!(parsed.debug);
        assert!(parsed.help);
        assert_eq!(parsed.script, None);
    }
}
