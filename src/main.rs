//! Lunar - A Lua 5.1 bytecode virtual machine written in pure Rust
//!
//! This is the command-line runner: it loads one chunk and runs it to
//! completion on the scheduler.

use lunar::config::{parse_args, print_help, CliArgs};
use lunar::{Chunk, LuaError, LuaVM, Scheduler, VMConfig};
use std::process;

fn main() {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Try 'lunar --help' for more information.");
            process::exit(2);
        }
    };

    if args.help {
        print_help();
        return;
    }
    if args.version {
        println!("lunar {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    if let Err(e) = run(&args) {
        eprintln!("lunar: {}", e);
        process::exit(1);
    }
}

fn load_config(args: &CliArgs) -> Result<VMConfig, String> {
    let mut config = match &args.config {
        Some(path) => VMConfig::from_file(path.clone()).map_err(|e| e.to_string())?,
        None => VMConfig::default(),
    };
    config.apply_cli_args(args);
    Ok(config)
}

fn run(args: &CliArgs) -> Result<(), String> {
    let config = load_config(args)?;
    let script = args
        .script
        .as_ref()
        .ok_or_else(|| "no chunk given".to_string())?;

    let chunk = Chunk::from_path(script).map_err(|e| e.to_string())?;
    let scheduler = Scheduler::from_config(&config.scheduler);

    let mut vm = LuaVM::new(config);
    vm.open_libs().map_err(|e| e.to_string())?;
    let main = vm.instantiate(&chunk).map_err(|e| e.to_string())?;
    let id = vm.spawn(&main, Vec::new()).map_err(|e| e.to_string())?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(|e| e.to_string())?;

    runtime
        .block_on(scheduler.run(&mut vm, id))
        .map(|_| ())
        .map_err(|e: LuaError| e.to_string())
}
