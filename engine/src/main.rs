use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use chhoe_core::{ConfigStore, JsonFileProvider, SearchController, SubstringSearcher};
use chhoe_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use chhoe_types::{SearchEvent, SearchHit};

#[derive(Parser, Debug)]
#[command(name = "chhoe-engine")]
#[command(about = "Concurrent dictionary search across datasets")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one query against every configured dataset and print the results.
    Query {
        text: String,
        #[arg(long, default_value_t = false)]
        json: bool,
        #[arg(long, default_value_t = 10_000)]
        timeout_ms: u64,
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        state_dir: Option<String>,
        #[arg(long)]
        retry_budget: Option<u32>,
        #[arg(long)]
        retry_on_late_load: Option<bool>,
    },
    /// Interactive loop: each line is a query, a blank line clears results.
    Repl {
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        state_dir: Option<String>,
        #[arg(long)]
        retry_budget: Option<u32>,
        #[arg(long)]
        retry_on_late_load: Option<bool>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Query {
            text,
            json,
            timeout_ms,
            config,
            state_dir,
            retry_budget,
            retry_on_late_load,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let logs_dir = canonical_logs_dir_from_root(&state_dir);
            let (_log_guard, log_info) =
                init_process_logging(ProcessKind::Engine, &logs_dir, 14)?;
            info!("engine logging initialized: {:?}", log_info);

            let controller = start_controller(
                &state_dir,
                config,
                build_cli_overrides(retry_budget, retry_on_late_load),
                Some(text.clone()),
            )
            .await?;
            run_query(controller, &text, json, timeout_ms).await?;
        }
        Command::Repl {
            config,
            state_dir,
            retry_budget,
            retry_on_late_load,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let logs_dir = canonical_logs_dir_from_root(&state_dir);
            let (_log_guard, log_info) = init_process_logging(ProcessKind::Cli, &logs_dir, 14)?;
            info!("repl logging initialized: {:?}", log_info);

            let controller = start_controller(
                &state_dir,
                config,
                build_cli_overrides(retry_budget, retry_on_late_load),
                None,
            )
            .await?;
            run_repl(controller).await?;
        }
    }

    Ok(())
}

struct StartedController {
    controller: SearchController,
    events: tokio::sync::broadcast::Receiver<SearchEvent>,
    dataset_count: usize,
}

async fn start_controller(
    state_dir: &std::path::Path,
    config_flag: Option<String>,
    cli_overrides: Option<serde_json::Value>,
    initial_query: Option<String>,
) -> anyhow::Result<StartedController> {
    let config_path = config_flag
        .map(PathBuf::from)
        .unwrap_or_else(|| state_dir.join("config.json"));
    let store = ConfigStore::new(&config_path, cli_overrides).await?;
    let config = store.get().await;
    if config.datasets.is_empty() {
        anyhow::bail!(
            "no datasets configured; add a `datasets` array to {}",
            config_path.display()
        );
    }
    let dataset_count = config.datasets.len();

    emit_event(
        tracing::Level::INFO,
        ProcessKind::Engine,
        ObservabilityEvent {
            event: "engine.startup",
            component: "engine.main",
            dataset_id: None,
            search_id: None,
            query_hash: None,
            status: Some("ok"),
            error_code: None,
            detail: Some(&format!("datasets={dataset_count}")),
        },
    );

    let (controller, events) = SearchController::start(
        config,
        Arc::new(JsonFileProvider),
        Arc::new(SubstringSearcher),
        initial_query,
    );
    Ok(StartedController {
        controller,
        events,
        dataset_count,
    })
}

/// Wait until every dataset has either appended results or exhausted its
/// retries, then print. A dataset wedged past the deadline is reported as
/// timed out rather than blocking the others.
async fn run_query(
    started: StartedController,
    query: &str,
    json: bool,
    timeout_ms: u64,
) -> anyhow::Result<()> {
    let StartedController {
        controller,
        mut events,
        dataset_count,
    } = started;

    let mut results: BTreeMap<String, Vec<SearchHit>> = BTreeMap::new();
    let mut failed: Vec<String> = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);

    while results.len() + failed.len() < dataset_count {
        let event = tokio::select! {
            event = events.recv() => event.context("event stream closed")?,
            _ = tokio::time::sleep_until(deadline) => {
                warn!(
                    answered = results.len() + failed.len(),
                    expected = dataset_count,
                    "deadline reached before every dataset answered"
                );
                break;
            }
        };
        match event {
            SearchEvent::ResultsAppended {
                dataset_id, hits, ..
            } => {
                results.insert(dataset_id, hits);
            }
            SearchEvent::RetriesExhausted { dataset_id, .. } => {
                failed.push(dataset_id);
            }
            SearchEvent::DatasetLoaded { .. }
            | SearchEvent::AllDatasetsLoaded
            | SearchEvent::ResultsCleared => {}
        }
    }

    if json {
        let output = serde_json::json!({
            "query": query,
            "results": results,
            "failed": failed,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_results(query, &results, &failed);
    }

    controller.shutdown().await;
    Ok(())
}

fn print_results(query: &str, results: &BTreeMap<String, Vec<SearchHit>>, failed: &[String]) {
    for (dataset_id, hits) in results {
        println!("== {dataset_id} ({} hits)", hits.len());
        for hit in hits {
            println!("  {}  {}", hit.head, hit.definition);
        }
    }
    if results.is_empty() && failed.is_empty() {
        println!("no results for {query:?}");
    }
    for dataset_id in failed {
        println!("!! {dataset_id}: search failed after retries");
    }
}

async fn run_repl(started: StartedController) -> anyhow::Result<()> {
    let StartedController {
        controller,
        mut events,
        ..
    } = started;

    // Print events as they land so late loads and retries are visible.
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SearchEvent::ResultsAppended {
                    dataset_id, hits, ..
                } => {
                    println!("[{dataset_id}] {} hits", hits.len());
                    for hit in hits.iter().take(10) {
                        println!("  {}  {}", hit.head, hit.definition);
                    }
                }
                SearchEvent::ResultsCleared => println!("(cleared)"),
                SearchEvent::DatasetLoaded { dataset_id } => {
                    println!("(loaded {dataset_id})");
                }
                SearchEvent::AllDatasetsLoaded => println!("(all datasets loaded)"),
                SearchEvent::RetriesExhausted { dataset_id, .. } => {
                    println!("(!) {dataset_id}: search failed after retries");
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(b"chhoe> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim().to_string();
        if line == ":q" || line == ":quit" {
            break;
        }
        controller.submit_query(&line);
    }

    controller.shutdown().await;
    printer.abort();
    Ok(())
}

fn build_cli_overrides(
    retry_budget: Option<u32>,
    retry_on_late_load: Option<bool>,
) -> Option<serde_json::Value> {
    if retry_budget.is_none() && retry_on_late_load.is_none() {
        return None;
    }
    let mut root = serde_json::Map::new();
    if let Some(budget) = retry_budget {
        root.insert("retry_budget".to_string(), budget.into());
    }
    if let Some(enabled) = retry_on_late_load {
        root.insert("retry_on_late_load".to_string(), enabled.into());
    }
    Some(serde_json::Value::Object(root))
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("CHHOE_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::data_dir()
        .map(|d| d.join("chhoe"))
        .unwrap_or_else(|| PathBuf::from(".chhoe"))
}
