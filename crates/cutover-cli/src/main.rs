use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use cutover_core::ReleaseId;
use cutover_deploy::{DeployError, EXIT_PREPARATION};

mod commands;

#[derive(Parser, Debug)]
#[command(
    name = "cutover",
    about = "Atomic symlink release cutover with rollback",
    version,
    propagate_version = true
)]
struct Cli {
    /// Configuration file.
    #[arg(short, long, global = true, default_value = "cutover.toml")]
    config: PathBuf,
    /// Environment to operate on. Optional when only one is configured.
    #[arg(short, long, global = true)]
    env: Option<String>,
    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Prepare, verify and promote an artifact.
    ///
    /// Exit codes: 0 active and healthy, 1 preparation failed (previous
    /// release still active), 2 health check failed and the previous release
    /// was restored, 3 infrastructure failure (run `status`).
    Deploy {
        /// Directory, tarball, or https:// s3:// oci:// git:// reference.
        artifact: String,
    },
    /// Repoint `current` to a retired release (default: the previous one).
    Rollback { release: Option<ReleaseId> },
    /// Show the active release and every release on record.
    Status {
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },
    /// Remove releases beyond the retention policy.
    Prune,
    /// Write a configuration scaffold.
    Init {
        /// Environment root on the target host (absolute).
        #[arg(long)]
        root: String,
        /// Overwrite an existing configuration file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(cli.json_logs) {
        eprintln!("error: {e:#}");
        return ExitCode::from(EXIT_PREPARATION as u8);
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Deploy { artifact } => {
            commands::deploy::deploy(&cli.config, cli.env.as_deref(), &artifact).await
        }
        Commands::Rollback { release } => {
            commands::deploy::rollback(&cli.config, cli.env.as_deref(), release).await
        }
        Commands::Status { format } => {
            commands::inspect::status(&cli.config, cli.env.as_deref(), format == Format::Json)
        }
        Commands::Prune => commands::inspect::prune(&cli.config, cli.env.as_deref()),
        Commands::Init { root, force } => {
            commands::init::init(&cli.config, cli.env.as_deref(), &root, force)
        }
    }
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("warn,cutover=info"))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

/// Deploy failures carry their own exit code; anything else (bad config,
/// unreadable files) is a rejected request.
fn exit_code(err: &anyhow::Error) -> u8 {
    let code = err
        .downcast_ref::<DeployError>()
        .map(DeployError::exit_code)
        .unwrap_or(EXIT_PREPARATION);
    u8::try_from(code).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cutover_deploy::{EXIT_INDETERMINATE, EXIT_ROLLED_BACK};

    #[test]
    fn parses_deploy_with_globals() {
        let cli = Cli::try_parse_from([
            "cutover",
            "--config",
            "/etc/cutover.toml",
            "deploy",
            "/builds/shop.tar.gz",
            "--env",
            "staging",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/cutover.toml"));
        assert_eq!(cli.env.as_deref(), Some("staging"));
        assert!(matches!(cli.command, Commands::Deploy { artifact } if artifact == "/builds/shop.tar.gz"));
    }

    #[test]
    fn rollback_target_is_optional() {
        let cli = Cli::try_parse_from(["cutover", "rollback"]).unwrap();
        assert!(matches!(cli.command, Commands::Rollback { release: None }));

        let cli = Cli::try_parse_from(["cutover", "rollback", "12"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Rollback {
                release: Some(ReleaseId(12))
            }
        ));

        assert!(Cli::try_parse_from(["cutover", "rollback", "latest"]).is_err());
    }

    #[test]
    fn status_format() {
        let cli = Cli::try_parse_from(["cutover", "status"]).unwrap();
        assert!(matches!(cli.command, Commands::Status { format: Format::Text }));
        let cli = Cli::try_parse_from(["cutover", "status", "--format", "json"]).unwrap();
        assert!(matches!(cli.command, Commands::Status { format: Format::Json }));
        assert!(Cli::try_parse_from(["cutover", "status", "--format", "yaml"]).is_err());
    }

    #[test]
    fn deploy_requires_artifact() {
        assert!(Cli::try_parse_from(["cutover", "deploy"]).is_err());
        assert!(Cli::try_parse_from(["cutover", "init"]).is_err());
    }

    #[test]
    fn exit_codes_follow_deploy_errors() {
        let rolled_back = anyhow::Error::new(DeployError::DeploymentFailed {
            release: ReleaseId(2),
            step: cutover_core::Step::PostCheck,
            reason: "unhealthy".into(),
            rolled_back_to: Some(ReleaseId(1)),
        });
        assert_eq!(exit_code(&rolled_back), EXIT_ROLLED_BACK as u8);

        let transport = anyhow::Error::new(DeployError::Transport {
            release: None,
            step: None,
            reason: "disk".into(),
        })
        .context("deploy to production");
        assert_eq!(exit_code(&transport), EXIT_INDETERMINATE as u8);

        assert_eq!(exit_code(&anyhow::anyhow!("no such file")), EXIT_PREPARATION as u8);
    }
}
