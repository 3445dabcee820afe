use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::exit;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use clap::{Arg, Command};
use tracing_subscriber::EnvFilter;

use embr::{Host, Vm};

/// Real-world host services: process clocks, `sh -c` for `term`, and a file
/// loader that resolves `<name>.embr` under `lib/` first, then next to the
/// running script.
struct SystemHost {
    start: Instant,
    script_dir: PathBuf,
}

impl SystemHost {
    fn new(script_dir: PathBuf) -> Self {
        Self { start: Instant::now(), script_dir }
    }
}

impl Host for SystemHost {
    fn clock(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    fn time(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    fn term(&mut self, cmd: &str) -> Result<f64, String> {
        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .status()
            .map_err(|e| format!("Failed to run command: {}", e))?;
        Ok(status.code().unwrap_or(-1) as f64)
    }

    fn load(&mut self, name: &str) -> Result<String, String> {
        let file = format!("{}.embr", name);
        let candidates = [self.script_dir.join("lib").join(&file), self.script_dir.join(&file)];
        for path in &candidates {
            if path.exists() {
                return fs::read_to_string(path)
                    .map_err(|e| format!("Failed to read module '{}': {}", path.display(), e));
            }
        }
        Err(format!("Failed to find module '{}'.", name))
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let matches = Command::new("embr")
        .about("Interpreter for the Embr scripting language")
        .arg(Arg::new("script").value_name("SCRIPT").help("Script to run; omit for a REPL"))
        .get_matches();

    match matches.get_one::<String>("script") {
        Some(path) => run_file(path),
        None => repl(),
    }
}

fn run_file(path: &str) {
    let source = fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("Failed to read {}: {}", path, e);
        exit(1);
    });
    let dir = Path::new(path).parent().map(Path::to_path_buf).unwrap_or_default();
    let mut vm = Vm::new(Box::new(SystemHost::new(dir)));
    if let Err(e) = vm.interpret(&source) {
        eprintln!("{}", e);
        exit(e.exit_code());
    }
}

fn repl() {
    let mut vm = Vm::new(Box::new(SystemHost::new(PathBuf::new())));
    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("embr> ");
        let _ = io::stdout().flush();
        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == ":q" || trimmed == ":quit" {
            break;
        }
        if let Err(e) = vm.interpret(trimmed) {
            eprintln!("{}", e);
        }
    }
}
