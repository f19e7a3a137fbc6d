use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;
use tubestage_core::EntityKind;
use tubestage_sync::{parse_channel_ids, resolve_channel_ids, RelationalStore, SyncConfig, SyncPipeline};

#[derive(Debug, Parser)]
#[command(name = "tubestage")]
#[command(about = "Fetch channel metadata, stage it, and migrate it into SQLite")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch and stage only.
    Fetch(FetchArgs),
    /// Copy staged documents into the relational tables.
    Migrate {
        /// Only migrate records owned by these channels (comma-separated).
        #[arg(long)]
        channels: Option<String>,
    },
    /// Fetch, stage and migrate in one run.
    Sync(FetchArgs),
    /// Print every row of one table.
    Show {
        /// channels, videos, playlists or comments
        entity: EntityKind,
    },
    /// Serve the dashboard.
    Serve {
        #[arg(long, env = "TUBESTAGE_WEB_PORT", default_value_t = tubestage_web::DEFAULT_WEB_PORT)]
        port: u16,
    },
}

#[derive(Debug, Default, Args)]
struct FetchArgs {
    /// Comma-separated channel ids; defaults to the enabled entries of channels.yaml.
    #[arg(long)]
    channels: Option<String>,
    #[arg(long)]
    page_size: Option<u32>,
    #[arg(long)]
    max_pages: Option<u32>,
}

impl FetchArgs {
    fn config(&self) -> Result<SyncConfig> {
        let config = SyncConfig::from_env().with_paging(self.page_size, self.max_pages);
        if config.api_credential.is_empty() {
            bail!("YOUTUBE_API_KEY is not set");
        }
        Ok(config)
    }

    fn channel_ids(&self, config: &SyncConfig) -> Result<Vec<String>> {
        let ids = resolve_channel_ids(config, self.channels.as_deref())?;
        if ids.is_empty() {
            warn!("no channel ids given");
        }
        Ok(ids)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync(FetchArgs::default())) {
        Commands::Fetch(args) => {
            let config = args.config()?;
            let channel_ids = args.channel_ids(&config)?;
            let pipeline = SyncPipeline::from_config(config).await?;
            let fetched = pipeline.fetch_pass(&channel_ids).await?;
            let staged = pipeline.stage(&fetched.batch).await?;
            let issues = fetched.issues.len() + staged.issues.len();
            for (kind, count) in &staged.staged {
                println!("{kind}: staged={count}");
            }
            println!(
                "fetch {}: {issues} issue(s)",
                if issues == 0 { "succeeded" } else { "completed with issues" }
            );
        }
        Commands::Migrate { channels } => {
            let config = SyncConfig::from_env();
            let filter = channels.as_deref().map(parse_channel_ids);
            let store = RelationalStore::connect(&config.relational_store_uri).await?;
            let pipeline = SyncPipeline::from_config(config).await?;
            let report = pipeline.migrate(&store, filter.as_deref()).await?;
            for upsert in &report.upserts {
                println!(
                    "{}: inserted={} skipped={}",
                    upsert.kind.table(),
                    upsert.inserted,
                    upsert.skipped
                );
            }
        }
        Commands::Sync(args) => {
            let config = args.config()?;
            let channel_ids = args.channel_ids(&config)?;
            let store = RelationalStore::connect(&config.relational_store_uri).await?;
            let pipeline = SyncPipeline::from_config(config).await?;
            let summary = pipeline.run_once(&store, &channel_ids).await?;
            let report_path = pipeline.write_run_report(&summary).await?;
            println!("{}", summary.status_line());
            println!("report: {}", report_path.display());
        }
        Commands::Show { entity } => {
            let config = SyncConfig::from_env();
            let store = RelationalStore::connect_read_only(&config.relational_store_uri)
                .await
                .context("no relational store yet; run `tubestage sync` first")?;
            let view = store
                .select_all(entity)
                .await
                .with_context(|| format!("reading {}", entity.table()))?;
            println!("{}", view.columns.join("\t"));
            for row in &view.rows {
                println!("{}", row.join("\t"));
            }
        }
        Commands::Serve { port } => {
            let config = SyncConfig::from_env();
            let store = RelationalStore::connect_read_only(&config.relational_store_uri)
                .await
                .context("no relational store yet; run `tubestage sync` first")?;
            tubestage_web::serve(tubestage_web::AppState::new(store), port).await?;
        }
    }

    Ok(())
}
