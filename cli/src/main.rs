// chatvault: operator CLI for the local conversation vault
//
// Cross-platform (macOS, Linux, Windows) command-line access to the storage
// facade: inspect, back up, restore and maintain a vault.

mod config;

use anyhow::{Context, Result};
use chatvault_core::{
    ListQuery, Settings, SettingsPatch, Snapshot, SortField, SortOrder, StorageFacade,
};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "chatvault")]
#[command(about = "ChatVault: local encrypted conversation storage", long_about = None)]
#[command(version)]
struct Cli {
    /// Override the storage directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show record counts and estimated size
    Stats,
    /// List conversations, one page at a time
    List {
        #[arg(short, long)]
        limit: Option<usize>,
        /// created, updated or accessed
        #[arg(short, long, default_value = "updated")]
        sort: SortField,
        /// asc or desc
        #[arg(short, long, default_value = "desc")]
        order: SortOrder,
        /// Id of the last conversation of the previous page
        #[arg(short, long)]
        cursor: Option<String>,
    },
    /// Show a conversation and its messages
    Show { id: String },
    /// Write a full snapshot to a JSON file
    Export { file: PathBuf },
    /// Merge a snapshot file into the vault
    Import { file: PathBuf },
    /// Read or change vault settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Delete every conversation and message
    Clear {
        #[arg(long)]
        yes: bool,
    },
    /// Rewrite all records under the current encryption setting
    Reencrypt,
}

#[derive(Subcommand)]
enum SettingsAction {
    Get,
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = config::Config::load()?;
    if let Some(dir) = &cli.data_dir {
        config.storage_path = Some(dir.to_string_lossy().to_string());
    }
    let _log_guard = init_logging(&config)?;

    let storage = config.storage();
    info!(data_dir = %storage.data_dir.display(), "Opening vault");
    let facade = StorageFacade::new(storage);
    if let Err(e) = facade.initialize().await {
        error!(error = %e, "Vault failed to initialize");
        return Err(e).context("Failed to open the vault");
    }

    match cli.command {
        Commands::Stats => cmd_stats(&facade, &config).await,
        Commands::List {
            limit,
            sort,
            order,
            cursor,
        } => cmd_list(&facade, limit.unwrap_or(config.page_size), sort, order, cursor).await,
        Commands::Show { id } => cmd_show(&facade, &id).await,
        Commands::Export { file } => cmd_export(&facade, file).await,
        Commands::Import { file } => cmd_import(&facade, file).await,
        Commands::Settings { action } => cmd_settings(&facade, action).await,
        Commands::Clear { yes } => cmd_clear(&facade, yes).await,
        Commands::Reencrypt => cmd_reencrypt(&facade).await,
    }?;

    facade.flush().await.context("Failed to flush the vault")?;
    Ok(())
}

fn init_logging(
    config: &config::Config,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr = fmt::layer().with_writer(std::io::stderr);

    if !config.file_logging {
        tracing_subscriber::registry().with(filter).with(stderr).init();
        return Ok(None);
    }

    let log_dir = config.data_dir()?.join("logs");
    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "chatvault.log"));
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    Ok(Some(guard))
}

fn format_time(millis: u64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(millis as i64)
        .map(|t| {
            t.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M")
                .to_string()
        })
        .unwrap_or_else(|| "?".to_string())
}

fn format_bytes(bytes: u64) -> String {
    const MIB: f64 = 1024.0 * 1024.0;
    if bytes as f64 >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB)
    } else {
        format!("{:.1} KiB", bytes as f64 / 1024.0)
    }
}

async fn cmd_stats(facade: &StorageFacade, config: &config::Config) -> Result<()> {
    let stats = facade.get_storage_stats().await?;
    let settings = facade.get_settings().await?;

    println!("{}", "Vault".bold());
    println!("  Location:      {}", config.storage().data_dir.display());
    println!("  Conversations: {}", stats.conversation_count);
    println!("  Messages:      {}", stats.message_count);
    println!(
        "  Size:          {} of {}",
        format_bytes(stats.estimated_size_bytes),
        format_bytes(settings.max_storage_size)
    );
    Ok(())
}

async fn cmd_list(
    facade: &StorageFacade,
    limit: usize,
    sort: SortField,
    order: SortOrder,
    cursor: Option<String>,
) -> Result<()> {
    let query = ListQuery::new(limit, sort, order).after(cursor);
    let page = facade.list_conversations(&query).await?;

    if page.items.is_empty() && page.skipped.is_empty() {
        println!("{}", "No conversations found.".dimmed());
        return Ok(());
    }

    for conversation in &page.items {
        println!(
            "{} {} [{} · {}]",
            conversation.id.bright_cyan(),
            conversation.title.bold(),
            conversation.model,
            format_time(conversation.sort_value(sort)).dimmed()
        );
    }
    for id in &page.skipped {
        println!("{} {}", id.bright_cyan(), "(unreadable)".red());
    }

    if let Some(next) = page.next_cursor {
        println!();
        println!("Next page: {} {}", "--cursor".dimmed(), next);
    }
    Ok(())
}

async fn cmd_show(facade: &StorageFacade, id: &str) -> Result<()> {
    let conversation = facade
        .get_conversation(id)
        .await?
        .with_context(|| format!("Conversation not found: {}", id))?;

    println!("{}", conversation.title.bold());
    println!(
        "  {} / {}  created {}",
        conversation.endpoint,
        conversation.model,
        format_time(conversation.created_at).dimmed()
    );
    if let Some(prefix) = &conversation.prompt_prefix {
        println!("  Prompt prefix: {}", prefix.dimmed());
    }
    println!();

    for message in facade.list_messages_by_conversation(id).await? {
        let author = if message.is_created_by_user {
            "You".bright_green()
        } else {
            "Assistant".bright_blue()
        };
        println!("{} [{}]", author, format_time(message.created_at).dimmed());
        println!("   {}", message.text);
        println!();
    }
    Ok(())
}

async fn cmd_export(facade: &StorageFacade, file: PathBuf) -> Result<()> {
    let report = facade.export_all().await.context("Export failed")?;
    let json = report.snapshot.to_json()?;
    std::fs::write(&file, json)
        .with_context(|| format!("Failed to write {}", file.display()))?;
    info!(
        path = %file.display(),
        conversations = report.snapshot.conversations.len(),
        messages = report.snapshot.messages.len(),
        skipped = report.skipped.len(),
        "Snapshot exported"
    );

    println!(
        "  {} Exported {} conversations and {} messages to {}",
        "✓".green(),
        report.snapshot.conversations.len(),
        report.snapshot.messages.len(),
        file.display()
    );
    if !report.skipped.is_empty() {
        println!(
            "  {} {} unreadable records were left out",
            "!".yellow(),
            report.skipped.len()
        );
    }
    Ok(())
}

async fn cmd_import(facade: &StorageFacade, file: PathBuf) -> Result<()> {
    let json = std::fs::read_to_string(&file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let snapshot = Snapshot::from_json(&json).context("Failed to parse snapshot")?;
    let report = facade.import_all(&snapshot).await.context("Import failed")?;
    info!(
        path = %file.display(),
        imported = report.imported,
        unchanged = report.unchanged,
        failed = report.failed,
        "Snapshot imported"
    );

    println!(
        "  {} Imported {}, unchanged {}, failed {}",
        "✓".green(),
        report.imported,
        report.unchanged,
        report.failed
    );
    Ok(())
}

fn print_settings(settings: &Settings) {
    println!("  encryption_enabled: {}", settings.encryption_enabled);
    println!("  backup_enabled:     {}", settings.backup_enabled);
    println!("  max_storage_size:   {}", settings.max_storage_size);
    println!(
        "  last_backup:        {}",
        settings
            .last_backup
            .map(format_time)
            .unwrap_or_else(|| "never".to_string())
    );
}

fn parse_patch(key: &str, value: &str) -> Result<SettingsPatch> {
    let mut patch = SettingsPatch::default();
    match key {
        "encryption_enabled" => {
            patch.encryption_enabled = Some(value.parse().context("Invalid boolean value")?);
        }
        "backup_enabled" => {
            patch.backup_enabled = Some(value.parse().context("Invalid boolean value")?);
        }
        "max_storage_size" => {
            patch.max_storage_size = Some(value.parse().context("Invalid number")?);
        }
        _ => anyhow::bail!("Unknown setting: {}", key),
    }
    Ok(patch)
}

async fn cmd_settings(facade: &StorageFacade, action: SettingsAction) -> Result<()> {
    let settings = match action {
        SettingsAction::Get => facade.get_settings().await?,
        SettingsAction::Set { key, value } => {
            let patch = parse_patch(&key, &value)?;
            let settings = facade.update_settings(&patch).await?;
            println!("  {} {} = {}", "✓".green(), key, value);
            if key == "encryption_enabled" {
                println!(
                    "  {} Existing records keep their current form until `chatvault reencrypt`",
                    "!".yellow()
                );
            }
            settings
        }
    };
    print_settings(&settings);
    Ok(())
}

async fn cmd_clear(facade: &StorageFacade, yes: bool) -> Result<()> {
    if !yes {
        anyhow::bail!("Refusing to delete everything without --yes");
    }
    facade.clear_all().await.context("Failed to clear the vault")?;
    println!("  {} Vault cleared", "✓".green());
    Ok(())
}

async fn cmd_reencrypt(facade: &StorageFacade) -> Result<()> {
    let report = facade.reencrypt_all().await.context("Re-encryption failed")?;
    println!("  {} Rewrote {} records", "✓".green(), report.rewritten);
    if report.failed > 0 {
        error!(failed = report.failed, "Some records could not be rewritten");
        println!(
            "  {} {} records kept their previous form",
            "!".yellow(),
            report.failed
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_patch() {
        let patch = parse_patch("max_storage_size", "1024").unwrap();
        assert_eq!(patch.max_storage_size, Some(1024));
        assert!(parse_patch("encryption_enabled", "maybe").is_err());
        assert!(parse_patch("key_hash", "00").is_err());
    }

    #[test]
    fn test_cli_parses_list_flags() {
        let cli = Cli::try_parse_from(["chatvault", "list", "--sort", "created", "--order", "asc"])
            .unwrap();
        match cli.command {
            Commands::List { sort, order, .. } => {
                assert_eq!(sort, SortField::CreatedAt);
                assert_eq!(order, SortOrder::Asc);
            }
            _ => panic!("expected list"),
        }
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MiB");
    }
}
