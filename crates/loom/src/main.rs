//! loom: git forge pages over a replicated message log.
//!
//! Main binary with subcommands:
//! - `web`: Serve the HTML pages
//! - `locales`: List the available locale catalogs

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use loom_store::{BlobStore, Fixture, LogStore, MemoryStore, RepoStore};
use loom_view::Catalogs;
use loom_view::i18n::language_from_env;
use loom_web::{AppState, create_router};
use miette::Result;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "loom=info,loom_view=info,loom_web=info,loom_store=info";

#[derive(Parser)]
#[command(name = "loom")]
#[command(about = "Git forge pages over a replicated message log", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the web server
    Web {
        /// Address to listen on
        #[arg(long, env = "LOOM_LISTEN", default_value = "127.0.0.1:7718")]
        listen: SocketAddr,

        /// JSON fixture to load into the in-memory store
        #[arg(long, env = "LOOM_FIXTURE")]
        fixture: Option<PathBuf>,

        /// Identity to browse as when no fixture is given
        #[arg(long, env = "LOOM_WHOAMI", default_value = "@local")]
        whoami: String,

        /// Directory of `<locale>.json` catalogs
        #[arg(long, env = "LOOM_LOCALE_DIR", default_value = "locale")]
        locale_dir: PathBuf,

        /// Locale used when nothing else matches
        #[arg(long, env = "LOOM_FALLBACK_LOCALE", default_value = "en")]
        fallback_locale: String,

        /// Feed items and commits per page
        #[arg(long, env = "LOOM_PAGE_SIZE", default_value = "20", value_parser = clap::value_parser!(u16).range(1..))]
        page_size: u16,

        /// Static files directory
        #[arg(long, env = "LOOM_STATIC_DIR")]
        static_dir: Option<PathBuf>,

        /// Process default language, as in `de_DE.UTF-8`
        #[arg(long, env = "LANG")]
        lang: Option<String>,
    },

    /// List locales that have a catalog
    Locales {
        /// Directory of `<locale>.json` catalogs
        #[arg(long, env = "LOOM_LOCALE_DIR", default_value = "locale")]
        locale_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Web {
            listen,
            fixture,
            whoami,
            locale_dir,
            fallback_locale,
            page_size,
            static_dir,
            lang,
        } => {
            let store = load_store(fixture.as_deref(), &whoami)?;
            let catalogs = Catalogs::new(locale_dir, fallback_locale)
                .with_default_language(lang.as_deref().and_then(language_from_env));
            run_web_server(store, catalogs, usize::from(page_size), listen, static_dir.as_deref()).await
        }
        Commands::Locales { locale_dir } => {
            let catalogs = Catalogs::new(locale_dir, "en");
            let locales = catalogs
                .list_locales()
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            for locale in locales {
                println!("{}", locale);
            }
            Ok(())
        }
    }
}

/// A memory store from `fixture`, or an empty one for `whoami`.
fn load_store(fixture: Option<&Path>, whoami: &str) -> Result<Arc<MemoryStore>> {
    match fixture {
        Some(path) => {
            let fixture = Fixture::from_path(path)
                .map_err(|e| miette::miette!("failed to read fixture {}: {}", path.display(), e))?;
            fixture
                .into_store()
                .map_err(|e| miette::miette!("failed to load fixture {}: {}", path.display(), e))
        }
        None => {
            info!(whoami = %whoami, "no fixture given, starting with an empty store");
            Ok(MemoryStore::new(whoami))
        }
    }
}

async fn run_web_server(
    store: Arc<MemoryStore>,
    catalogs: Catalogs,
    page_size: usize,
    listen: SocketAddr,
    static_dir: Option<&Path>,
) -> Result<()> {
    let whoami = store.whoami().await.map_err(|e| miette::miette!("{}", e))?;
    let log: Arc<dyn LogStore> = store.clone();
    let blobs: Arc<dyn BlobStore> = store.clone();
    let repos: Arc<dyn RepoStore> = store;
    let state = AppState::new(log, blobs, repos, &whoami, catalogs, page_size);
    let router = create_router(Arc::new(state), static_dir);

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    info!(whoami = %whoami, "web server listening on http://{}", listen);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|stop| *stop).await;
        })
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_web_defaults() {
        let cli = Cli::try_parse_from(["loom", "web"]).unwrap();
        let Commands::Web {
            listen,
            page_size,
            fallback_locale,
            ..
        } = cli.command
        else {
            panic!("expected web command");
        };
        assert_eq!(listen.port(), 7718);
        assert_eq!(page_size, 20);
        assert_eq!(fallback_locale, "en");
    }

    #[test]
    fn test_zero_page_size_rejected() {
        assert!(Cli::try_parse_from(["loom", "web", "--page-size", "0"]).is_err());
    }

    #[test]
    fn test_load_fixture() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("fixture.json");
        std::fs::write(
            &path,
            r#"{"whoami": "@me", "messages": [
                {"author": "@me", "timestamp": 1, "content": {"type": "git-repo"}}
            ]}"#,
        )
        .unwrap();
        let store = load_store(Some(&path), "@ignored").unwrap();
        assert_eq!(store.len(), 1);

        assert!(load_store(Some(&dir.path().join("missing.json")), "@me").is_err());
        assert!(load_store(None, "@me").unwrap().is_empty());
    }

    #[test]
    fn test_demo_fixture_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demo/fixture.json");
        let store = load_store(Some(&path), "@ignored").unwrap();
        assert_eq!(store.len(), 6);
        assert_eq!(store.repo_count(), 1);
    }
}
