//! Interactive archive console.
//!
//! Reads one command per line from stdin. Fetches run in the background,
//! so `stop` and `status` work while a fetch is in progress.
//!
//! ## Configuration
//!
//! Same environment as the service (`ARCHIVE_*`, `FETCH_*`, `DATABASE_URL`
//! with the `postgres` feature). Logs default to the `pretty` format on
//! stderr.
//!
//! ## Usage
//!
//! ```bash
//! ARCHIVE_CHANNEL_ID=-1001593560584 ARCHIVE_REPLAY_FILE=export.jsonl cargo run --bin archive_console
//! ```

use std::io::Write;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use archive_kernel::{
    ArchiveConfig, ChannelContext, ChannelId, ChatClient, Console, ConsoleError, ConsoleReply,
    FetchSequencer, InMemoryChatClient, InMemoryMessageStore, MessageStore,
};

fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "archive_kernel=info,archive_console=info,sqlx=warn".into());

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

fn prompt(console_channel: Option<ChannelId>) {
    match console_channel {
        Some(channel) => print!("[{}]> ", channel),
        None => print!("> "),
    }
    let _ = std::io::stdout().flush();
}

fn report(result: Result<Option<ConsoleReply>, ConsoleError>) -> bool {
    match result {
        Ok(Some(ConsoleReply::Exit)) => return false,
        Ok(Some(reply)) => println!("{}", reply),
        Ok(None) => {}
        Err(ConsoleError::Help(text)) => println!("{}", text),
        Err(e) => eprintln!("error: {}", e),
    }
    true
}

async fn run_console<S, C>(mut console: Console<S, C>) -> Result<(), Box<dyn std::error::Error>>
where
    S: MessageStore + 'static,
    C: ChatClient + 'static,
{
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt(console.channel());

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if !report(console.execute_line(&line).await) {
                    break;
                }
                prompt(console.channel());
            }
            reply = console.job_finished() => {
                println!();
                println!("{}", reply);
                prompt(console.channel());
            }
        }
    }

    for reply in console.shutdown().await {
        println!("{}", reply);
    }
    println!("{}", ConsoleReply::Exit);
    Ok(())
}

fn load_client(config: &ArchiveConfig) -> Result<InMemoryChatClient, Box<dyn std::error::Error>> {
    match (&config.replay_file, config.channel_id) {
        (Some(path), Some(channel)) => {
            let client = InMemoryChatClient::from_jsonl(path, channel)?;
            info!(path = %path.display(), channel_id = %channel, "Replay export loaded");
            Ok(client)
        }
        (Some(_), None) => Err("ARCHIVE_REPLAY_FILE requires ARCHIVE_CHANNEL_ID".into()),
        (None, _) => Ok(InMemoryChatClient::new()),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = ArchiveConfig::from_env()?;
    let client = Arc::new(load_client(&config)?);
    let limits = ChannelContext::from_config(config.channel_id.unwrap_or(ChannelId::new(0)), &config);
    let select_channel = config.channel_id.is_some();

    #[cfg(feature = "postgres")]
    let postgres = match std::env::var("DATABASE_URL") {
        Ok(url) if !url.is_empty() => {
            let store = archive_kernel::PostgresMessageStore::from_env().await?;
            store.ensure_schema().await?;
            Some(store)
        }
        _ => None,
    };
    #[cfg(not(feature = "postgres"))]
    let postgres: Option<InMemoryMessageStore> = None;

    println!("archive console {} (type `help` for commands)", env!("CARGO_PKG_VERSION"));
    match postgres {
        Some(store) => {
            let sequencer = FetchSequencer::new(Arc::new(store), client);
            run_console(Console::new(sequencer, limits, select_channel)).await
        }
        None => {
            let sequencer = FetchSequencer::new(Arc::new(InMemoryMessageStore::new()), client);
            run_console(Console::new(sequencer, limits, select_channel)).await
        }
    }
}
