use anyhow::{Context, Result};
use clap::Parser;

use outlook_oauth::auth::{self, CredentialStore, TokenManager};
use outlook_oauth::config::{self, CliArgs, Command, Config};
use outlook_oauth::intake;
use outlook_oauth::mailbox::Mailbox;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // First run: no .env and no client identity in the environment
    if config::needs_interactive_setup(&args.env_file) {
        config::run_interactive_setup(&args.env_file)?;
    }

    let config = Config::load(&args.env_file)?;

    // Initialize logging; --log-level wins over LOG_LEVEL, RUST_LOG over both
    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.log_level.clone())
        .to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::debug!("Command: {:?}", args.command);

    match args.command {
        Command::Login => login(&config).await,
        Command::Check { force_refresh } => check(&config, force_refresh).await,
        Command::Refresh => refresh(&config).await,
        Command::Unread { folder } => unread(&config, &folder).await,
        Command::Folders => folders(&config).await,
        Command::Categories => categories(&config).await,
        Command::MarkUnread { ids } => mark_unread(&config, &ids).await,
        Command::Sweep {
            folder,
            dest,
            extension,
        } => sweep(&config, &folder, &dest, &extension).await,
        Command::ApplyTokenFile { token_file } => {
            let token_file = token_file.unwrap_or_else(|| config.token_file.clone());
            let archived =
                auth::rewrite_env_file(&token_file, &args.env_file, &config.env_archive_dir, &config)
                    .with_context(|| format!("Failed to apply {}", token_file.display()))?;
            if let Some(entry) = archived {
                println!("Previous {} archived to {}", args.env_file.display(), entry.path.display());
            }
            println!("{} updated from {}", args.env_file.display(), token_file.display());
            Ok(())
        }
    }
}

fn open_browser(url: &str) {
    println!("Opening browser for authentication...");
    if open::that(url).is_err() {
        println!("Could not open browser. Please visit:\n{}", url);
    }
}

async fn login(config: &Config) -> Result<()> {
    println!("Waiting for callback on {} ...", config.redirect_uri);
    let creds = auth::start_flow(config, open_browser)
        .await
        .context("Authorization flow failed")?;

    let store = CredentialStore::from_config(config);
    if let Some(entry) = store.save(&creds)? {
        println!("Previous token file archived to {}", entry.path.display());
    }
    println!("Tokens saved to {}", store.path().display());
    Ok(())
}

/// Token manager plus a session the mailbox API accepts
async fn authenticated_mailbox(config: &Config, force_refresh: bool) -> Result<(TokenManager, Mailbox)> {
    let manager = TokenManager::bootstrap(config)?;
    let session = manager
        .get_authenticated_session(force_refresh)
        .await
        .map_err(|e| {
            if e.requires_reauthorization() {
                tracing::error!("Run `outlook-oauth login` to authorize again");
            }
            e
        })
        .context("Could not establish an authenticated session")?;
    Ok((manager, Mailbox::new(session)))
}

async fn check(config: &Config, force_refresh: bool) -> Result<()> {
    let (manager, _) = authenticated_mailbox(config, force_refresh).await?;
    let creds = manager.credentials().await;
    println!(
        "Access token valid (token: {}...)",
        creds.access_token().map(auth::token_prefix).unwrap_or("-")
    );
    Ok(())
}

async fn refresh(config: &Config) -> Result<()> {
    let manager = TokenManager::bootstrap(config)?;
    let creds = manager.refresh().await.context("Token refresh failed")?;

    // The manager only persists when ADD_TOKEN_RESPONSE_TO_FILE is set
    if !config.add_token_response_to_file {
        CredentialStore::from_config(config).save(&creds)?;
    }
    println!("Token refreshed and saved to {}", config.token_file.display());
    Ok(())
}

async fn unread(config: &Config, folder: &str) -> Result<()> {
    let (_, mailbox) = authenticated_mailbox(config, false).await?;
    let messages = mailbox.list_unread_messages_in_folder(folder).await?;

    if messages.is_empty() {
        println!("No unread messages in '{}'", folder);
    }
    for message in &messages {
        println!(
            "{}\t{}\t{}",
            message["id"].as_str().unwrap_or("-"),
            message["from"]["emailAddress"]["address"].as_str().unwrap_or("-"),
            message["subject"].as_str().unwrap_or(""),
        );
    }
    Ok(())
}

async fn folders(config: &Config) -> Result<()> {
    let (_, mailbox) = authenticated_mailbox(config, false).await?;
    for folder in mailbox.list_folders().await? {
        println!(
            "{}\t{}\t{} unread",
            folder["displayName"].as_str().unwrap_or("-"),
            folder["id"].as_str().unwrap_or("-"),
            folder["unreadItemCount"].as_u64().unwrap_or(0),
        );
    }
    Ok(())
}

async fn categories(config: &Config) -> Result<()> {
    let (_, mailbox) = authenticated_mailbox(config, false).await?;
    for category in mailbox.list_categories().await? {
        println!(
            "{}\t{}\t{}",
            category["displayName"].as_str().unwrap_or("-"),
            category["id"].as_str().unwrap_or("-"),
            category["color"].as_str().unwrap_or("-"),
        );
    }
    Ok(())
}

async fn mark_unread(config: &Config, ids: &[String]) -> Result<()> {
    let (_, mailbox) = authenticated_mailbox(config, false).await?;
    let outcome = mailbox.mark_unread_batch(ids).await;
    if !outcome.is_success() {
        anyhow::bail!(
            "Failed to mark {} of {} messages as unread: {:?}",
            outcome.failed.len(),
            outcome.attempted,
            outcome.failed_ids()
        );
    }
    println!("{} messages marked as unread", outcome.attempted);
    Ok(())
}

async fn sweep(config: &Config, folder: &str, dest: &std::path::Path, extension: &str) -> Result<()> {
    let (_, mailbox) = authenticated_mailbox(config, false).await?;
    let report = intake::sweep_attachments(&mailbox, folder, dest, extension)
        .await
        .with_context(|| format!("Attachment sweep of '{}' failed", folder))?;

    for path in &report.saved {
        println!("Saved {}", path.display());
    }
    println!(
        "{} messages checked, {} attachments saved, {} skipped, {} empty",
        report.messages_seen,
        report.saved.len(),
        report.skipped.len(),
        report.empty.len()
    );
    Ok(())
}
