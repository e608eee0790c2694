//! CLI command handlers

use anyhow::{Context, Result};
use relay_core::models::{
    ApprovalOption, ApprovalOutcome, LogLevel, Priority, RelayConfig, BOT_TOKEN_ENV, CHAT_ID_ENV,
};
use relay_core::relay::{AddOutcome, FlushOutcome, Relay, ShutdownController};
use relay_core::services::logging;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Exit code for approvals that ended without a choice
pub const EXIT_NOT_CHOSEN: i32 = 2;

/// Resolve the configuration path, expanding a leading `~/`
pub fn resolve_config_path(config_file: Option<String>) -> Result<PathBuf> {
    match config_file {
        Some(path) if path.starts_with("~/") => {
            let home = std::env::var("HOME")
                .map_err(|_| anyhow::anyhow!("HOME environment variable not set"))?;
            Ok(PathBuf::from(path.replacen("~/", &format!("{}/", home), 1)))
        }
        Some(path) => Ok(PathBuf::from(path)),
        None => RelayConfig::default_config_path()
            .map_err(|e| anyhow::anyhow!("Failed to get default config path: {}", e)),
    }
}

/// Load and validate the configuration
pub fn load_config(config_file: Option<String>) -> Result<RelayConfig> {
    let path = resolve_config_path(config_file)?;
    let config = RelayConfig::load_from_file(&path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    if let Err(errors) = config.validate() {
        return Err(anyhow::anyhow!(
            "Invalid configuration in {}:\n  - {}",
            path.display(),
            errors.join("\n  - ")
        ));
    }
    Ok(config)
}

fn init_logging(config: &RelayConfig) -> Result<()> {
    logging::init_logging(config.log_level)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

/// Parse `LABEL` or `LABEL=VALUE`
pub fn parse_option(raw: &str) -> Result<ApprovalOption> {
    let (label, value) = match raw.split_once('=') {
        Some((label, value)) => (label.trim(), Some(value.trim())),
        None => (raw.trim(), None),
    };
    if label.is_empty() {
        return Err(anyhow::anyhow!("Option '{}' has an empty label", raw));
    }
    Ok(match value {
        Some(value) if !value.is_empty() => ApprovalOption::with_value(label, value),
        _ => ApprovalOption::new(label),
    })
}

/// Process exit code for an approval outcome
pub fn exit_code(outcome: &ApprovalOutcome) -> i32 {
    match outcome {
        ApprovalOutcome::Chosen(_) => 0,
        _ => EXIT_NOT_CHOSEN,
    }
}

/// Handle the 'notify' command
pub async fn handle_notify(
    text: String,
    priority: String,
    config_file: Option<String>,
) -> Result<()> {
    let priority: Priority = priority
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid priority: {}", e))?;
    let config = load_config(config_file)?;
    init_logging(&config)?;

    let (relay, _updates) = Relay::telegram(config).context("Failed to set up Telegram relay")?;

    match relay.notify(text, priority).await {
        AddOutcome::Delivered(handle) => {
            println!("✅ Notification sent ({})", handle);
        }
        AddOutcome::Dropped(e) => {
            return Err(anyhow::anyhow!("Notification was not delivered: {}", e));
        }
        AddOutcome::Queued { .. } => {
            // Nothing outlives this process, so the queue is flushed right away
            let report = relay.shutdown().await;
            match report.map(|r| r.flushed) {
                Some(FlushOutcome::Sent { handle, count })
                | Some(FlushOutcome::Edited { handle, count }) => {
                    println!("✅ {} notification(s) sent ({})", count, handle);
                }
                Some(FlushOutcome::Failed { error, .. }) => {
                    return Err(anyhow::anyhow!("Notification was not delivered: {}", error));
                }
                Some(FlushOutcome::Empty) | None => {}
            }
        }
    }
    Ok(())
}

/// Handle the 'approve' command. Returns the process exit code.
pub async fn handle_approve(
    question: String,
    options: Vec<String>,
    timeout_secs: Option<u64>,
    json: bool,
    config_file: Option<String>,
) -> Result<i32> {
    let options = options
        .iter()
        .map(|raw| parse_option(raw))
        .collect::<Result<Vec<_>>>()?;
    let config = load_config(config_file)?;
    init_logging(&config)?;

    let timeout = timeout_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.approvals.default_timeout());
    let (relay, updates) = Relay::telegram(config).context("Failed to set up Telegram relay")?;
    let relay = Arc::new(relay);
    let listener = relay.spawn_update_listener(Arc::new(updates));

    if !json {
        println!("📤 Sending approval request: {}", question);
        println!("⏳ Waiting for the operator (timeout {}s)...", timeout.as_secs());
    }

    let result = tokio::select! {
        result = relay.request_approval(question.clone(), options, Some(timeout)) => result,
        _ = ShutdownController::wait_for_signal() => {
            relay.shutdown().await;
            Ok(ApprovalOutcome::Cancelled)
        }
    };
    listener.abort();
    let outcome = result.context("Approval request failed")?;
    tracing::info!(outcome = outcome.as_str(), "Approval finished");

    if json {
        let mut response = serde_json::json!({
            "outcome": outcome.as_str(),
            "question": question,
            "timestamp": chrono::Utc::now().to_rfc3339()
        });
        if let Some(option) = outcome.chosen() {
            response["choice"] = serde_json::Value::String(option.label.clone());
            response["value"] = serde_json::Value::String(option.value.clone());
        }
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        match &outcome {
            ApprovalOutcome::Chosen(option) => println!("✅ Operator chose: {}", option.label),
            ApprovalOutcome::TimedOut => println!(
                "⏱️  Timeout: No answer received within {} seconds",
                timeout.as_secs()
            ),
            ApprovalOutcome::Evicted => println!("♻️  Superseded by a newer approval request"),
            ApprovalOutcome::Cancelled => println!("⚠️  Approval request was cancelled"),
            ApprovalOutcome::NotFound => println!("⚠️  Approval request is no longer tracked"),
        }
    }
    Ok(exit_code(&outcome))
}

fn read_user_input_sync() -> Result<String> {
    let mut buffer = String::new();
    io::stdin()
        .read_line(&mut buffer)
        .context("Failed to read from stdin")?;
    Ok(buffer)
}

fn prompt(label: &str, current: &str) -> Result<String> {
    print!("{} [{}]: ", label, current);
    io::stdout().flush()?;
    Ok(read_user_input_sync()?.trim().to_string())
}

fn log_level_name(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    }
}

/// Handle 'config --init'
pub async fn handle_config_init(config_file: Option<String>) -> Result<()> {
    println!("⚙️  Initializing relay configuration");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config_path = resolve_config_path(config_file)?;
    println!("📄 Config file: {}", config_path.display());

    let mut config = if config_path.exists() {
        println!("⚠️  Configuration file already exists. Loading existing values...");
        RelayConfig::load_from_file(&config_path)
            .map_err(|e| anyhow::anyhow!("Failed to load existing config: {}", e))?
    } else {
        println!("✨ Creating new configuration with defaults...");
        RelayConfig::default()
    };

    println!("\n📝 Please answer the following questions (press Enter to use default):\n");

    let chat_default = config.telegram.chat_id.clone().unwrap_or_default();
    let chat_input = prompt("Telegram chat ID (from @userinfobot or group)", &chat_default)?;
    if !chat_input.is_empty() {
        config.telegram.chat_id = Some(chat_input);
    }

    let level_input = prompt(
        "Log level (error/warn/info/debug/trace)",
        log_level_name(config.log_level),
    )?;
    if !level_input.is_empty() {
        config.log_level = match level_input.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => {
                println!("⚠️  Invalid log level, using default");
                config.log_level
            }
        };
    }

    let window_input = prompt(
        "Batch window in seconds",
        &config.batch.window_seconds.to_string(),
    )?;
    if !window_input.is_empty() {
        match window_input.parse::<u64>() {
            Ok(window) => config.batch.window_seconds = window,
            Err(_) => println!("⚠️  Invalid batch window, using default"),
        }
    }

    let timeout_input = prompt(
        "Default approval timeout in seconds",
        &config.approvals.default_timeout_seconds.to_string(),
    )?;
    if !timeout_input.is_empty() {
        match timeout_input.parse::<u64>() {
            Ok(timeout) => config.approvals.default_timeout_seconds = timeout,
            Err(_) => println!("⚠️  Invalid timeout value, using default"),
        }
    }
    println!(
        "   Token must be set via environment ({}); it is not stored in the config file.",
        BOT_TOKEN_ENV
    );

    println!("\n🔍 Validating configuration...");
    match config.validate() {
        Ok(()) => println!("✅ Configuration is valid"),
        Err(errors) => {
            println!("❌ Configuration validation failed:");
            for error in &errors {
                println!("   - {}", error);
            }
            return Err(anyhow::anyhow!("Configuration validation failed"));
        }
    }

    println!("\n💾 Saving configuration to {}...", config_path.display());
    config
        .save_to_file(&config_path)
        .map_err(|e| anyhow::anyhow!("Failed to save configuration: {}", e))?;
    println!("✅ Configuration saved successfully!");
    print_summary(&config);
    Ok(())
}

/// Handle 'config' without flags: show the effective settings
pub async fn handle_config_show(config_file: Option<String>) -> Result<()> {
    let config_path = resolve_config_path(config_file)?;
    println!("📄 Config file: {}", config_path.display());
    if !config_path.exists() {
        println!("   (not found, showing defaults; run 'relay config --init' to create it)");
    }
    let config = RelayConfig::load_from_file(&config_path)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    print_summary(&config);
    match config.validate() {
        Ok(()) => println!("\n✅ Configuration is valid"),
        Err(errors) => {
            println!("\n❌ Configuration validation failed:");
            for error in &errors {
                println!("   - {}", error);
            }
        }
    }
    Ok(())
}

fn print_summary(config: &RelayConfig) {
    let token_set = std::env::var(BOT_TOKEN_ENV)
        .map(|t| !t.trim().is_empty())
        .unwrap_or(false);
    println!("\n📋 Configuration summary:");
    println!("   Log level: {}", log_level_name(config.log_level));
    println!(
        "   Telegram chat: {} ({} overrides)",
        config
            .telegram
            .resolve_chat_id()
            .unwrap_or_else(|| "not set".to_string()),
        CHAT_ID_ENV
    );
    println!(
        "   Bot token: {}",
        if token_set { "set" } else { "not set" }
    );
    println!(
        "   Batch window: {}s, max {} queued",
        config.batch.window_seconds, config.batch.max_queue_size
    );
    println!(
        "   Delivery: {} attempts, {} requests per {}ms",
        config.delivery.retry_attempts,
        config.delivery.rate_limit_max_requests,
        config.delivery.rate_limit_window_ms
    );
    println!(
        "   Approvals: max {} live, {}s default timeout, {:?} wait",
        config.approvals.max_concurrent,
        config.approvals.default_timeout_seconds,
        config.approvals.wait_mode
    );
}
