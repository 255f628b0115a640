use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level};
use warship::api::{self, ApiClient, ClientConfig, DEFAULT_API_URL, DEFAULT_AUTH_URL};
use warship::deploy::{self, DeployOptions, DeployRequest};
use warship::store::{unpack_tar_gz, ArchiveSpool};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[clap(long, global = true, default_value_t = Level::INFO)]
    level: tracing::Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Platform {
    #[clap(long, env = "WARSHIP_API_URL", default_value = DEFAULT_API_URL)]
    api_url: String,

    #[clap(long, env = "WARSHIP_AUTH_URL", default_value = DEFAULT_AUTH_URL)]
    auth_url: String,

    #[clap(long, env = "WARSHIP_API_TOKEN", hide_env_values = true)]
    api_token: String,
}

#[derive(Subcommand)]
enum Command {
    /// Deploy a WAR archive from a local path or an http(s) URL
    Deploy {
        #[clap(long, short)]
        app: String,

        location: String,

        git_ref: Option<String>,

        #[clap(long)]
        no_follow: bool,

        /// Build the archive in a temporary file instead of memory
        #[clap(long)]
        spool_to_disk: bool,

        #[command(flatten)]
        platform: Platform,
    },

    /// Build the deployment archive without uploading it
    Package {
        #[clap(long, short)]
        app: String,

        location: String,

        #[clap(long, short)]
        output: PathBuf,

        #[clap(long)]
        spool_to_disk: bool,
    },

    /// List the entries of a deployment archive
    Inspect { archive: PathBuf },
}

fn spool(spool_to_disk: bool) -> ArchiveSpool {
    if spool_to_disk {
        ArchiveSpool::TempFile
    } else {
        ArchiveSpool::Memory
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut subscriber = tracing_subscriber::FmtSubscriber::builder().with_max_level(cli.level);

    // when we run the command with `TRACE` or `DEBUG` level, we want to see
    // the file and line number...
    if [Level::DEBUG, Level::TRACE].contains(&cli.level) {
        subscriber = subscriber.with_file(true).with_line_number(true);
    }
    let subscriber = subscriber.finish();
    tracing::subscriber::set_global_default(subscriber).context("setting default subscriber")?;

    match cli.command {
        Command::Deploy {
            app,
            location,
            git_ref,
            no_follow,
            spool_to_disk,
            platform,
        } => {
            let config = ClientConfig {
                api_url: platform.api_url,
                auth_url: platform.auth_url,
                api_token: platform.api_token,
            };

            let client = ApiClient::new(api::http_client()?, &config);

            let request = DeployRequest {
                app,
                location,
                git_ref,
                spool: spool(spool_to_disk),
                options: DeployOptions { follow: !no_follow },
            };

            let deployment = deploy::deploy_war(&client, client.http(), &request)
                .await
                .with_context(|| format!("fail to deploy {}", request.app))?;

            info!(
                "deployment {} started ({})",
                deployment.id,
                deployment.status.as_deref().unwrap_or("unknown")
            );

            Ok(())
        }

        Command::Package {
            app,
            location,
            output,
            spool_to_disk,
        } => {
            let client = api::http_client()?;
            let archive = deploy::package(&client, &app, &location, spool(spool_to_disk)).await?;

            archive
                .write_to(&output)
                .await
                .with_context(|| format!("fail to write {}", output.display()))?;

            info!("archive written: {} ({} bytes)", output.display(), archive.size());

            Ok(())
        }

        Command::Inspect { archive } => {
            let data = tokio::fs::read(&archive)
                .await
                .with_context(|| format!("fail to read {}", archive.display()))?;

            for entry in unpack_tar_gz(&data).await? {
                info!(
                    "{} mode={:o} size={} mtime={}",
                    entry.path, entry.mode, entry.size, entry.mtime
                );
            }

            Ok(())
        }
    }
}
