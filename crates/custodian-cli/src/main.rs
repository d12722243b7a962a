//! Custodian CLI binary entrypoint.

use std::io;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use custodian_cli::cli::{Cli, Commands};
use custodian_cli::commands::{
    BackupCommand, RetentionCommand, RetireCommand, RetryReplicationCommand, RotateCommand, RunCommand, StatusCommand,
    UnlockCommand, VerifyCommand,
};
use custodian_cli::output::OutputFormat;
use custodian_cli::{CliError, Config, Context};

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries command output
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error [{}]: {e}", e.kind());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = Config::from_file(&cli.config)?;
    let context = Context::open(config)?;
    let format = OutputFormat::new(cli.format);
    let mut stdout = io::stdout().lock();

    match cli.command {
        Commands::Backup(args) => {
            let cmd = BackupCommand::new(&context);
            cmd.execute(&mut stdout, &format, &args).await?;
        }
        Commands::Rotate(args) => {
            let cmd = RotateCommand::new(&context);
            cmd.execute(&mut stdout, &format, &args).await?;
        }
        Commands::Verify(args) => {
            let cmd = VerifyCommand::new(&context);
            cmd.execute(&mut stdout, &format, &args).await?;
        }
        Commands::RetentionSweep(args) => {
            let cmd = RetentionCommand::new(&context);
            cmd.execute(&mut stdout, &format, &args).await?;
        }
        Commands::Run(args) => {
            let cmd = RunCommand::new(&context);
            cmd.execute(&mut stdout, &format, &args).await?;
        }
        Commands::RetryReplication(args) => {
            let cmd = RetryReplicationCommand::new(&context);
            cmd.execute(&mut stdout, &format, &args).await?;
        }
        Commands::RetireExpired => {
            let cmd = RetireCommand::new(&context);
            cmd.execute(&mut stdout, &format).await?;
        }
        Commands::Unlock(args) => {
            let cmd = UnlockCommand::new(&context);
            cmd.execute(&mut stdout, &format, &args).await?;
        }
        Commands::Status => {
            let cmd = StatusCommand::new(&context);
            cmd.execute(&mut stdout, &format).await?;
        }
    }

    Ok(())
}
