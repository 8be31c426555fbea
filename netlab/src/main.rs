use anyhow::Context;
use clap::Parser;
use netlab_core::config::defaults::DEFAULT_LOG_DIRECTIVE;
use netlab_core::exec::ExecOutputFormat;
use netlab_core::NetlabConfig;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "netlab")]
#[command(about = "Network lab deployer", long_about = None)]
struct Cli {
    /// Configuration file (.yaml, .yml, .json or .toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// List the supported node kinds
    Kinds {
        /// Output format: plain or json (table is an alias of plain)
        #[arg(long, default_value = "plain")]
        format: ExecOutputFormat,
    },
    /// Validate a lab manifest and print its deployment plan
    Check {
        /// Lab manifest
        manifest: PathBuf,

        /// Output format: plain or json (table is an alias of plain)
        #[arg(long, default_value = "plain")]
        format: ExecOutputFormat,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<NetlabConfig> {
    match path {
        Some(path) => NetlabConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(NetlabConfig::from_env()?),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let directive = if cli.verbose { "netlab=debug" } else { DEFAULT_LOG_DIRECTIVE };
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(
        directive
            .parse()
            .with_context(|| format!("invalid log directive {:?}", directive))?,
    );
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let registry = Arc::new(netlab_kinds::build_registry()?);

    match cli.command {
        Commands::Kinds { format } => {
            print!("{}", netlab::kinds(&registry, format)?);
        }
        Commands::Check { manifest, format } => {
            let config = load_config(cli.config.as_ref())?;
            let plan = netlab::preflight(registry, &manifest, config).await?;
            print!("{}", netlab::render_plan(&plan, format)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_format_is_plain() {
        let cli = Cli::try_parse_from(["netlab", "kinds", "--format", "table"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Kinds {
                format: ExecOutputFormat::Plain
            }
        ));

        let cli = Cli::try_parse_from(["netlab", "check", "lab.yml", "--format", "json"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Check {
                format: ExecOutputFormat::Json,
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_format_is_rejected() {
        assert!(Cli::try_parse_from(["netlab", "kinds", "--format", "xml"]).is_err());
    }
}
