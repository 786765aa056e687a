//! `fcm`: create, stop, start and destroy Firecracker microVMs.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

mod cli;
mod commands;

use std::process::ExitCode;

use clap::Parser;
use fcm_executor::{ErrorKind, ExecutorError, Settings};
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;

/// Exit status for a failed command, by error class.
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<ExecutorError>().map(ExecutorError::kind) {
        Some(ErrorKind::Validation) => 2,
        Some(ErrorKind::ResourceConflict) => 3,
        Some(ErrorKind::State) => 4,
        Some(ErrorKind::ExternalTool | ErrorKind::Api) => 5,
        Some(ErrorKind::Interrupted) => 130,
        Some(ErrorKind::Internal) | None => 1,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match Settings::load(cli.env_file.as_deref()) {
        Ok(settings) => commands::run(cli.command, settings).await,
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_error_kind() {
        let state = anyhow::Error::from(ExecutorError::State { vm: "t1".to_owned(), reason: "running".to_owned() });
        assert_eq!(exit_code(&state), 4);
        assert_eq!(exit_code(&anyhow::Error::from(ExecutorError::Interrupted)), 130);
        assert_eq!(exit_code(&anyhow::anyhow!("plain failure")), 1);
    }
}
