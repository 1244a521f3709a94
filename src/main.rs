//! Command line entry point.
//!
//! Routine dispatch in the style of the classic overlay tools:
//! `termlay layer` runs the overlay process, `termlay version` prints
//! the version, and `termlay query-windows PID...` pokes running layer
//! processes to re-scan for terminal windows.

use anyhow::{bail, Context, Result};
use log::info;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use termlay::command::codec::CodecKind;
use termlay::config::Config;
use termlay::layer::{self, LayerOptions};
use termlay::loading::{worker, LoaderKind};
use termlay::term::proc;

fn print_help() {
    println!(
        r#"termlay {} - X11 image overlay layer for terminal emulators

USAGE:
    termlay layer [options]
    termlay version
    termlay query-windows PID...

ROUTINES:
    layer                   Display images (reads commands from stdin)
    version                 Print version information
    query-windows           Ask running layer processes to re-scan for
                            terminal windows (sends SIGUSR1)

LAYER OPTIONS:
    -p, --parser <format>   one of json, simple, bash
                            json: one JSON object per line
                            simple: key/value pairs separated by tabs
                            bash: associative array dumped via `declare -p`
                            [default: json]
    -l, --loader <loader>   one of synchronous, thread, process
                            synchronous: decode images right away
                            thread: decode images on a thread pool
                            process: decode images in helper processes
                            [default: thread]
    -s, --silent            do not print error records to stderr
    -h, --help              Print this help message
    -V, --version           Print version information

CONFIG FILE:
    ~/.config/termlay/config.toml
"#,
        env!("CARGO_PKG_VERSION")
    );
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args: Vec<String> = std::env::args().collect();

    // Internal decode helper, spawned by the process loader. Dispatched
    // before anything else so it stays cheap and quiet.
    if args.get(1).map(String::as_str) == Some(worker::WORKER_ROUTINE) {
        return worker::run_worker();
    }

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("termlay {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    match args.get(1).map(String::as_str) {
        Some("layer") | None => run_layer(&args[2.min(args.len())..]),
        Some("version") => {
            println!("termlay {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some("query-windows") => query_windows(&args[2..]),
        Some(other) => {
            print_help();
            bail!("unknown routine '{other}'");
        }
    }
}

fn run_layer(args: &[String]) -> Result<()> {
    let config = Config::load();
    let mut options = LayerOptions {
        codec: config.layer.codec(),
        loader: config.layer.loader_kind(),
        silent: config.layer.silent,
    };

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        // Accept both `--parser json` and `--parser=json`.
        let (flag, inline_value) = match arg.split_once('=') {
            Some((flag, value)) => (flag, Some(value.to_string())),
            None => (arg.as_str(), None),
        };
        let mut value = |name: &str| -> Result<String> {
            inline_value
                .clone()
                .or_else(|| iter.next().cloned())
                .with_context(|| format!("{name} needs a value"))
        };

        match flag {
            "-p" | "--parser" => {
                let name = value("--parser")?;
                options.codec = CodecKind::parse(&name)
                    .with_context(|| format!("unknown parser '{name}'"))?;
            }
            "-l" | "--loader" => {
                let name = value("--loader")?;
                options.loader = LoaderKind::parse(&name)
                    .with_context(|| format!("unknown loader '{name}'"))?;
            }
            "-s" | "--silent" => options.silent = true,
            other => bail!("unknown layer option '{other}'"),
        }
    }

    info!(
        "termlay layer starting (parser {}, loader {})",
        options.codec.name(),
        options.loader.name()
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building the async runtime")?;
    runtime.block_on(layer::run(options))
}

/// Sends SIGUSR1 to each given pid, but only to processes running the
/// same command as this one. Dead pids are skipped silently.
fn query_windows(pids: &[String]) -> Result<()> {
    let own_command = proc::get_command(std::process::id() as i32)
        .context("reading own command name")?;

    for raw in pids {
        let pid: i32 = raw
            .parse()
            .with_context(|| format!("invalid pid '{raw}'"))?;
        match proc::get_command(pid) {
            Ok(command) if command == own_command => {
                match kill(Pid::from_raw(pid), Signal::SIGUSR1) {
                    Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                    Err(error) => bail!("signalling pid {pid}: {error}"),
                }
            }
            // A different program now owns the pid, or it exited.
            Ok(_) | Err(_) => {}
        }
    }
    Ok(())
}
