use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use snafu::ResultExt;
use vault_history::{HistoryRepository, JsonFileHistoryStore};
use vault_protocol::{DocumentGroups, ResponseType, RestoredView};
use vault_stream::{
    HealthMonitor, HttpTransport, ReplayTransport, SearchTransport, StreamTarget,
};

use super::error::{
    CliResult, CliHistorySnafu, ReadReplaySnafu, RenderOutputSnafu, SettingsSnafu,
    SetupTransportSnafu,
};
use super::session::{PendingSearch, SearchObserver, SearchOutcome, SearchProgress, SearchSession};
use super::settings::{ClientSettings, SettingsStore};

#[derive(Debug, Parser)]
#[command(name = "vault-search", version, about = "Streamed knowledge search with local history")]
pub struct Cli {
    /// Settings file; defaults to the platform config directory.
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,
    /// Overrides the backend endpoint for this run.
    #[arg(long, global = true)]
    pub endpoint: Option<String>,
    /// Answers the search from a recorded NDJSON trace instead of the backend.
    #[arg(long, global = true, value_name = "FILE")]
    pub replay: Option<PathBuf>,
    /// Includes online sources for this run.
    #[arg(long, global = true)]
    pub include_online: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Runs a search and stores the answer.
    Search { query: String },
    /// Answers a disambiguation prompt with one candidate.
    Select { query: String, candidate: String },
    /// Lists stored searches, newest first.
    History,
    /// Shows a stored search as it was first displayed.
    Restore { id: String },
    Delete { id: String },
    /// Attaches a note to a stored search.
    Comment { id: String, text: String },
    /// Removes the note at INDEX (zero-based).
    Uncomment { id: String, index: usize },
    /// Drops all stored searches.
    Clear,
    /// Probes the backend once, or keeps probing with --watch.
    Health {
        #[arg(long)]
        watch: bool,
    },
    /// Prints the effective settings, or changes one with `set`.
    Settings {
        #[command(subcommand)]
        action: Option<SettingsAction>,
    },
}

#[derive(Debug, Subcommand)]
pub enum SettingsAction {
    /// Stores KEY = VALUE in the settings file; VALUE is read as JSON when it parses.
    Set { key: String, value: String },
}

pub async fn run(cli: Cli) -> CliResult<()> {
    let store = match &cli.config {
        Some(path) => SettingsStore::new(path.clone()),
        None => SettingsStore::load(),
    };
    let mut settings = (*store.settings()).clone();
    if let Some(endpoint) = &cli.endpoint {
        settings.endpoint = endpoint.clone();
        settings = settings.normalized();
    }
    if cli.include_online {
        settings.include_online = true;
    }

    if let Command::Settings { action } = &cli.command {
        return match action {
            None => print_json(&settings),
            Some(SettingsAction::Set { key, value }) => set_setting(&store, key, value),
        };
    }

    let transport = build_transport(&settings, cli.replay.as_deref())?;
    if let Command::Health { watch } = cli.command {
        return health(transport, &settings, watch).await;
    }

    let session = open_session(transport, &settings)?;
    let result = execute(&session, cli.command).await;
    let flushed = session.flush();
    result?;
    flushed?;
    Ok(())
}

fn set_setting(store: &SettingsStore, key: &str, value: &str) -> CliResult<()> {
    let updated = (*store.settings())
        .clone()
        .with_value(key, value)
        .context(SettingsSnafu {
            stage: "parse-setting",
        })?;
    store.update(updated).context(SettingsSnafu {
        stage: "save-settings",
    })?;
    tracing::info!(key, path = ?store.config_path(), "setting updated");
    print_json(&*store.settings())
}

fn build_transport(
    settings: &ClientSettings,
    replay: Option<&Path>,
) -> CliResult<Arc<dyn SearchTransport>> {
    if let Some(path) = replay {
        let trace = std::fs::read_to_string(path).context(ReadReplaySnafu { path })?;
        tracing::info!(path = ?path, "replaying recorded search trace");
        return Ok(Arc::new(ReplayTransport::from_ndjson(&trace)));
    }

    let transport = HttpTransport::new(settings.transport_config()).context(
        SetupTransportSnafu {
            stage: "build-http-transport",
        },
    )?;
    Ok(Arc::new(transport))
}

fn open_session(
    transport: Arc<dyn SearchTransport>,
    settings: &ClientSettings,
) -> CliResult<SearchSession> {
    let store = Arc::new(JsonFileHistoryStore::new(settings.history_path.clone()));
    let mut history = HistoryRepository::init(store).context(CliHistorySnafu {
        stage: "load-history",
    })?;
    // The history file's settings block only mirrors the client settings.
    history.set_settings(settings.history_settings());

    let session = SearchSession::new(transport, history);
    let observer: Arc<dyn SearchObserver> =
        Arc::new(|target: StreamTarget, progress: SearchProgress| match progress {
            SearchProgress::Stage(stage) => eprintln!("... {stage}"),
            SearchProgress::Chunk(chunk) => {
                tracing::trace!(target = ?target, kind = chunk.kind(), "chunk received");
            }
            SearchProgress::Content(_) => {}
        });
    session.set_observer(Some(observer));
    Ok(session)
}

async fn execute(session: &SearchSession, command: Command) -> CliResult<()> {
    match command {
        Command::Search { query } => await_search(session.run(query)?).await,
        Command::Select { query, candidate } => {
            await_search(session.select_candidate(query, candidate)?).await
        }
        Command::History => {
            print_history(session);
            Ok(())
        }
        Command::Restore { id } => {
            let view = session.restore(&id).await?;
            print_view(&view)
        }
        Command::Delete { id } => {
            if session.with_history(|history| history.delete(&id)) {
                println!("deleted {id}");
            } else {
                println!("no record {id}");
            }
            Ok(())
        }
        Command::Comment { id, text } => {
            session
                .with_history(|history| history.add_comment(&id, &text))
                .context(CliHistorySnafu {
                    stage: "add-comment",
                })?;
            println!("comment added to {id}");
            Ok(())
        }
        Command::Uncomment { id, index } => {
            let removed = session
                .with_history(|history| history.remove_comment(&id, index))
                .context(CliHistorySnafu {
                    stage: "remove-comment",
                })?;
            if removed {
                println!("comment {index} removed from {id}");
            } else {
                println!("{id} has no comment {index}");
            }
            Ok(())
        }
        Command::Clear => {
            session.with_history(HistoryRepository::clear);
            println!("history cleared");
            Ok(())
        }
        Command::Health { .. } | Command::Settings { .. } => Ok(()),
    }
}

async fn await_search(mut pending: PendingSearch) -> CliResult<()> {
    let outcome = tokio::select! {
        outcome = &mut pending => outcome?,
        _ = tokio::signal::ctrl_c() => {
            pending.cancel();
            pending.await?
        }
    };

    match outcome {
        SearchOutcome::Saved(record) => {
            println!(
                "saved {} ({}, {} ms)",
                record.id,
                record.resolved_type().as_str(),
                record.processing_time_ms
            );
            print_view(&record.restored_view())
        }
        SearchOutcome::Disambiguation(prompt) => {
            println!(
                "'{}' matched {} candidates; pick one with `vault-search select <QUERY> <CANDIDATE>`:",
                prompt.query,
                prompt.candidates.len()
            );
            for candidate in &prompt.candidates {
                println!("  - {}", candidate.label());
            }
            print_citations(&prompt.document_groups);
            Ok(())
        }
        SearchOutcome::Cancelled => {
            println!("cancelled");
            Ok(())
        }
    }
}

fn print_history(session: &SearchSession) {
    session.with_history(|history| {
        if !history.settings().show_history {
            println!("history display is turned off (showHistory = false)");
            return;
        }
        if history.is_empty() {
            println!("no stored searches");
            return;
        }
        for record in history.list() {
            let selected = record
                .selected_product
                .as_deref()
                .map(|product| format!(" -> {product}"))
                .unwrap_or_default();
            println!(
                "{}  [{}]  {}{}  ({} citations, {} comments)",
                record.id,
                record.resolved_type().as_str(),
                record.query,
                selected,
                record.citations_count,
                record.comments.len()
            );
        }
    });
}

fn print_view(view: &RestoredView) -> CliResult<()> {
    println!("query: {}", view.query);
    if let Some(selected) = &view.selected_product {
        println!("selected: {selected}");
    }

    match view.response_type {
        ResponseType::Content | ResponseType::NoResults => println!("\n{}", view.response_content),
        ResponseType::SingleResult => {
            if let Some(product) = &view.product_data {
                println!();
                print_json(product)?;
            }
        }
        ResponseType::MultipleResults => {
            for candidate in &view.product_list {
                println!("  - {}", candidate.label());
            }
        }
    }

    print_citations(&view.document_groups);
    Ok(())
}

fn print_citations(groups: &DocumentGroups) {
    if groups.is_empty() {
        return;
    }

    println!("\nsources:");
    for (group, refs) in groups {
        println!("  {group}:");
        for document in refs {
            let title = document.title().unwrap_or("untitled");
            match document.source() {
                Some(source) => println!("    - {title} ({source})"),
                None => println!("    - {title}"),
            }
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> CliResult<()> {
    let rendered = serde_json::to_string_pretty(value).context(RenderOutputSnafu {
        stage: "render-json",
    })?;
    println!("{rendered}");
    Ok(())
}

async fn health(
    transport: Arc<dyn SearchTransport>,
    settings: &ClientSettings,
    watch: bool,
) -> CliResult<()> {
    if !watch {
        let connected = match transport.probe().await {
            Ok(connected) => connected,
            Err(error) => {
                tracing::debug!(error = %error, "health probe failed");
                false
            }
        };
        println!("{}", connection_label(connected));
        return Ok(());
    }

    let monitor = HealthMonitor::spawn(transport, settings.health_config());
    let mut connected = monitor.subscribe();
    loop {
        tokio::select! {
            changed = connected.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *connected.borrow_and_update();
                println!("{}", connection_label(state));
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    monitor.shutdown().await;
    Ok(())
}

fn connection_label(connected: bool) -> &'static str {
    if connected { "connected" } else { "disconnected" }
}
