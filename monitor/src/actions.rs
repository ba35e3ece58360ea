use accounting::ActionDispatcher;
use std::io;
use std::process::Command;
use tracing::{error, info, warn};

/// Host power-off through an external command and process exit.
pub struct HostActions {
    shutdown_command: Vec<String>,
}

impl HostActions {
    pub fn new(shutdown_command: Vec<String>) -> Self {
        Self { shutdown_command }
    }
}

impl ActionDispatcher for HostActions {
    fn shutdown_host(&self) -> io::Result<()> {
        let (program, args) = self.shutdown_command.split_first().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "shutdown command is empty")
        })?;

        warn!("Running shutdown command: {:?}", self.shutdown_command);
        let status = Command::new(program).args(args).status()?;
        if status.success() {
            info!("Shutdown command accepted");
            Ok(())
        } else {
            error!("Shutdown command exited with {}", status);
            Err(io::Error::other(format!("{} exited with {}", program, status)))
        }
    }

    fn terminate_self(&self) {
        info!("Terminating process");
        std::process::exit(0);
    }
}
