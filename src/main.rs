//! vtlaunch - privileged session launcher for Linux compositors
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            Control Loop (poll)              │
//! │  signalfd (CHLD/INT/TERM/USR1/USR2)         │
//! ├──────────────────────┬──────────────────────┤
//! │  VT ownership        │  Broker channel (fds)│
//! │  PAM session         │  Compositor child    │
//! └──────────────────────┴──────────────────────┘
//! ```
//!
//! The launcher owns the virtual terminal and the signal plumbing; the
//! compositor runs unprivileged and asks for device descriptors over the
//! inherited broker socket.

mod config;
#[cfg(target_os = "linux")]
mod device;
mod session;

use anyhow::{anyhow, bail, Result};
use log::info;
use session::LaunchSession;

fn print_help() {
    println!(
        r#"vtlaunch {} - privileged session launcher for Linux compositors

USAGE:
    vtlaunch [OPTIONS] [--] [COMMAND [ARGS...]]

OPTIONS:
    -h, --help        Show this help message
    -V, --version     Show version
    -u, --user USER   Run the session as USER (root only)
    -t, --tty PATH    Use this terminal instead of a free VT (requires --user)
    -v, --verbose     Enable debug logging
    --check-gpu       Print the primary GPU device and exit

If COMMAND is omitted, the compositor command from the config file is used.

EXAMPLES:
    vtlaunch weston
    vtlaunch -- kwin_wayland --drm
    sudo vtlaunch -u carol weston

CONFIG FILE:
    /etc/vtlaunch/config.toml

For more information, see: https://github.com/sanohiro/vtlaunch"#,
        env!("CARGO_PKG_VERSION")
    );
}

#[derive(Debug, Default, PartialEq, Eq)]
struct CliArgs {
    help: bool,
    version: bool,
    verbose: bool,
    check_gpu: bool,
    user: Option<String>,
    tty: Option<String>,
    command: Vec<String>,
}

fn parse_args(args: &[String]) -> Result<CliArgs> {
    let mut cli = CliArgs::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => cli.help = true,
            "-V" | "--version" => cli.version = true,
            "-v" | "--verbose" => cli.verbose = true,
            "--check-gpu" => cli.check_gpu = true,
            "-u" | "--user" => {
                i += 1;
                cli.user = Some(
                    args.get(i)
                        .cloned()
                        .ok_or_else(|| anyhow!("--user needs a value"))?,
                );
            }
            "-t" | "--tty" => {
                i += 1;
                cli.tty = Some(
                    args.get(i)
                        .cloned()
                        .ok_or_else(|| anyhow!("--tty needs a value"))?,
                );
            }
            "--" => {
                cli.command = args[i + 1..].to_vec();
                break;
            }
            arg if arg.starts_with('-') => bail!("unknown option: {}", arg),
            _ => {
                // First bare word starts the compositor command; everything
                // after it belongs to the compositor, not to us.
                cli.command = args[i..].to_vec();
                break;
            }
        }
        i += 1;
    }
    Ok(cli)
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_args(&args)?;

    if cli.help {
        print_help();
        return Ok(());
    }
    if cli.version {
        println!("vtlaunch {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    // From here on a panic must put the console back into text mode
    session::vt::setup_panic_hook();

    let cfg = config::Config::load();

    if cli.check_gpu {
        #[cfg(target_os = "linux")]
        {
            let path = device::find_primary_gpu(&cfg.session.seat)?;
            println!("{}", path.display());
            return Ok(());
        }
        #[cfg(not(target_os = "linux"))]
        bail!("GPU discovery is only available on Linux");
    }

    if cli.tty.is_some() && cli.user.is_none() {
        bail!("--tty requires --user");
    }

    let command = if cli.command.is_empty() {
        cfg.compositor.command.clone()
    } else {
        cli.command
    };
    if command.is_empty() {
        bail!("no compositor command given (pass one or set compositor.command in the config)");
    }

    let identity = session::identity::resolve(cli.user.as_deref())?;
    session::identity::check_permission()?;

    info!("Launching {} for {}", command[0], identity.name);

    let mut launch = LaunchSession::new(identity, command);
    let status = launch.run(cli.tty.as_deref(), &cfg.session.pam_service);

    // Exiting through process::exit skips Drop; close explicitly first
    launch.close();

    match status {
        Ok(code) => std::process::exit(code),
        Err(e) => Err(e.into()),
    }
}
