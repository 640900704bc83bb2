use std::path::PathBuf;

use clap::{Parser, Subcommand};

use grace_server::config::load_config;
use grace_server::control::{is_alive, read_pid, send_signal, ControlError};
use grace_server::lifecycle::Signal;

#[derive(Parser)]
#[command(name = "grace-ctl")]
#[command(about = "Control a running grace-server through its pid file", long_about = None)]
struct Cli {
    /// Server configuration, used to find the pid file.
    #[arg(short, long, default_value = "grace.toml")]
    config: PathBuf,

    /// Pid file to use instead of the one in the configuration.
    #[arg(short, long)]
    pid_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a replacement process on the same sockets (SIGHUP)
    Restart,
    /// Stop accepting and drain (SIGTERM)
    Stop,
    /// Report whether the recorded process is running
    Status,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let pid_file = match cli.pid_file {
        Some(path) => path,
        None => load_config(&cli.config)?
            .restart
            .pid_file
            .ok_or(ControlError::NoPidFile)?,
    };
    let pid = read_pid(&pid_file)?;

    match cli.command {
        Commands::Restart => {
            send_signal(pid, Signal::Hangup)?;
            println!("Sent SIGHUP to {pid}; a replacement is starting");
        }
        Commands::Stop => {
            send_signal(pid, Signal::Terminate)?;
            println!("Sent SIGTERM to {pid}; draining");
        }
        Commands::Status => {
            if !is_alive(pid) {
                return Err(ControlError::NotRunning(pid).into());
            }
            println!("running (pid {pid})");
        }
    }

    Ok(())
}
