use anyhow::{bail, Context};
use clap::Parser;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use vibesearch::{
    app::{self, App},
    cli::{Args, Command},
    config::Config,
    semantic::IndexStorage,
    web,
};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let base_path = app::base_path()?;
    let config = Config::load_with(&base_path)?;

    match args.command {
        #[cfg(feature = "markdown-docs")]
        Command::MarkdownDocs {} => {
            clap_markdown::print_help_markdown::<Args>();
            Ok(())
        }

        Command::Daemon { listen } => {
            let listen = listen.unwrap_or_else(|| config.server.listen.clone());
            let app = App::new(config, false)?;

            // serve queries only once a consistent pair is loaded; an absent
            // index is fine, a broken one is not
            app.manager()
                .load_persisted()
                .context("persisted index failed verification")?;

            web::start_daemon(app, listen)
        }

        Command::BuildIndex { append } => {
            let app = App::new(config, true)?;
            let manager = app.manager();

            let summary = if append {
                manager.load_persisted()?;
                manager.append_new()?
            } else {
                manager.rebuild()?
            };

            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }

        Command::Search { image, text, board, k } => {
            let app = App::new(config, false)?;
            if !app.manager().load_persisted()? {
                bail!("no index found, run `vibe build-index` first");
            }
            let orchestrator = app.orchestrator();

            let output = match (image, text) {
                (Some(url), _) => serde_json::to_value(orchestrator.search_by_image(&url, k)?)?,
                (None, Some(text)) => serde_json::to_value(orchestrator.search_by_text(&text, k)?)?,
                (None, None) if !board.is_empty() => {
                    serde_json::to_value(orchestrator.search_by_board(&board, k)?)?
                }
                (None, None) => bail!("one of --image, --text or --board is required"),
            };

            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }

        Command::Info {} => {
            let storage = IndexStorage::new(config.index_path(), config.ids_path());
            if !storage.exists() {
                bail!("no index at {}", storage.index_path().display());
            }

            let snapshot = storage.load(&config.embedding.model, config.embedding.dimensions)?;
            let info = json!({
                "build_tag": snapshot.build_tag.to_string(),
                "built_at": snapshot.build_tag.built_at().to_rfc3339(),
                "entries": snapshot.len(),
                "dimensions": snapshot.index.dimensions(),
                "model": config.embedding.model,
                "index_path": storage.index_path(),
                "ids_path": storage.ids_path(),
            });

            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
    }
}
