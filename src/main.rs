#[macro_use]
mod log;

mod backup;
mod config;
mod export;
mod fetch;
mod gmail;
mod mbox;
mod parser;
mod ratelimit;

use backup::{BackupResult, BackupService};
use chrono::Utc;
use config::{AccountConfig, Config};
use export::{ExportFormat, ExportSelection};
use gmail::client::GmailClient;
use ratelimit::RateLimiter;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

fn default_config_path() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join("gmback").join("config.toml")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home)
            .join(".config")
            .join("gmback")
            .join("config.toml")
    } else {
        PathBuf::from("config.toml")
    }
}

/// Run the account's token command through the shell and return the trimmed
/// stdout as the access token.
pub fn run_token_command(cmd: &str) -> Result<String, String> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .output()
        .map_err(|e| format!("failed to execute token command: {}", e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "token command exited with {}: {}",
            output.status, stderr
        ));
    }

    let token = String::from_utf8(output.stdout)
        .map_err(|e| format!("token command output is not valid UTF-8: {}", e))?;

    let token = token.trim().to_string();
    if token.is_empty() {
        return Err("token command printed nothing".to_string());
    }
    Ok(token)
}

fn connect_account(account: &AccountConfig, config: &Config) -> Result<GmailClient, String> {
    let token = run_token_command(&account.token_command)?;
    let limiter = Arc::new(RateLimiter::new(
        config.gmail.quota_per_second,
        config.gmail.burst_size,
    ));
    let client = GmailClient::new(&token, limiter);
    Ok(match &config.gmail.api_base_url {
        Some(url) => client.with_base_url(url),
        None => client,
    })
}

fn print_help() {
    eprintln!("Usage: gmback COMMAND [OPTIONS]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  backup           Back up messages to an mbox archive");
    eprintln!("  export           Export messages (mbox, json, eml, csv)");
    eprintln!("  labels           List labels, or show one with --id=");
    eprintln!("  message          Show one decoded message (--id= required)");
    eprintln!("  quota            Show the configured quota budget");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config=PATH    Use config file at PATH instead of default");
    eprintln!("  --account=NAME   Use [account.NAME] (default: first account)");
    eprintln!("  --full           backup: full run, ignoring the watermark");
    eprintln!("  --query=Q        Gmail search query filter");
    eprintln!("  --max=N          Cap on matched messages");
    eprintln!("  --format=F       export: mbox (default), json, eml, csv");
    eprintln!("  --output=PATH    export: output file (eml: directory)");
    eprintln!("  --ids=A,B,C      export: explicit message ids instead of a query");
    eprintln!("  --id=ID          labels/message: a single id to show");
    eprintln!("  --help           Show this help");
}

fn flag_value<'a>(args: &'a [String], prefix: &str) -> Option<&'a str> {
    args.iter()
        .find(|a| a.starts_with(prefix))
        .map(|a| &a[prefix.len()..])
}

fn parse_max(args: &[String]) -> Result<Option<u32>, String> {
    match flag_value(args, "--max=") {
        Some(raw) => raw
            .parse::<u32>()
            .map(Some)
            .map_err(|e| format!("invalid --max value '{}': {}", raw, e)),
        None => Ok(None),
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            log_error!("failed to serialize result: {}", e);
            std::process::exit(1);
        }
    }
}

fn cmd_backup(config: &Config, account: &AccountConfig, args: &[String]) -> i32 {
    let query = flag_value(args, "--query=");
    let max = match parse_max(args) {
        Ok(max) => max,
        Err(e) => {
            eprintln!("{}", e);
            return 2;
        }
    };
    let full = args.iter().any(|a| a == "--full");

    // Credential failure is reported the same way as any other backup
    // failure: a result record, not a bare error.
    let result = match connect_account(account, config) {
        Ok(client) => {
            let service = BackupService::new(client, Path::new(&config.gmail.backup_folder))
                .with_limits(
                    config.gmail.max_messages_per_backup,
                    config.gmail.max_messages_per_full_backup,
                );
            if full {
                service.full_backup(&account.user_id, query, max)
            } else {
                service.incremental_backup(&account.user_id, query, max)
            }
        }
        Err(e) => BackupResult::failure(Utc::now(), format!("not authenticated: {}", e)),
    };

    print_json(&result);
    if result.success {
        0
    } else {
        1
    }
}

fn cmd_export(config: &Config, account: &AccountConfig, args: &[String]) -> i32 {
    let format = match flag_value(args, "--format=").unwrap_or("mbox").parse::<ExportFormat>() {
        Ok(format) => format,
        Err(e) => {
            eprintln!("{}", e);
            return 2;
        }
    };
    let max = match parse_max(args) {
        Ok(max) => max,
        Err(e) => {
            eprintln!("{}", e);
            return 2;
        }
    };
    let output = flag_value(args, "--output=").map(PathBuf::from);

    let selection = match flag_value(args, "--ids=") {
        Some(ids) => ExportSelection::Ids(
            ids.split(',')
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect(),
        ),
        None => ExportSelection::Query {
            query: flag_value(args, "--query="),
            max_results: max.unwrap_or(export::DEFAULT_MAX_EXPORT_RESULTS),
        },
    };

    let client = match connect_account(account, config) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };

    match export::export_messages(
        &client,
        &account.user_id,
        selection,
        format,
        output.as_deref(),
        Path::new(&config.gmail.export_folder),
    ) {
        Ok(result) => {
            print_json(&result);
            0
        }
        Err(e) => {
            log_error!("export failed: {}", e);
            1
        }
    }
}

fn cmd_labels(config: &Config, account: &AccountConfig, args: &[String]) -> i32 {
    let client = match connect_account(account, config) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };

    let outcome = match flag_value(args, "--id=") {
        Some(id) => client
            .get_label(&account.user_id, id)
            .map(|label| print_json(&label)),
        None => client
            .list_labels(&account.user_id)
            .map(|labels| print_json(&labels)),
    };

    match outcome {
        Ok(()) => 0,
        Err(e) => {
            log_error!("labels request failed: {}", e);
            1
        }
    }
}

fn cmd_message(config: &Config, account: &AccountConfig, args: &[String]) -> i32 {
    let Some(id) = flag_value(args, "--id=") else {
        eprintln!("message requires --id=MESSAGE_ID");
        return 2;
    };

    let client = match connect_account(account, config) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };

    let message = match client.get_message(&account.user_id, id, "full") {
        Ok(message) => message,
        Err(e) => {
            log_error!("message fetch failed: {}", e);
            return 1;
        }
    };
    match parser::decode(&message) {
        Ok(parsed) => {
            print_json(&parsed);
            0
        }
        Err(e) => {
            log_error!("message decode failed: {}", e);
            1
        }
    }
}

fn cmd_quota(config: &Config) -> i32 {
    let limiter = RateLimiter::new(config.gmail.quota_per_second, config.gmail.burst_size);
    print_json(&serde_json::json!({
        "quota_per_second": limiter.quota_per_second(),
        "burst_size": limiter.burst_size(),
        "available": limiter.get_current_quota(),
    }));
    0
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.is_empty() || args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        std::process::exit(if args.is_empty() { 2 } else { 0 });
    }

    let command = match args.iter().find(|a| !a.starts_with("--")) {
        Some(command) => command.as_str(),
        None => {
            print_help();
            std::process::exit(2);
        }
    };

    let config_path = flag_value(&args, "--config=")
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading config from {}: {}", config_path.display(), e);
            eprintln!("Create a config file with:");
            eprintln!();
            eprintln!("  [account.personal]");
            eprintln!("  token_command = \"pass show gmail/token\"");
            std::process::exit(1);
        }
    };

    let account = match config.account(flag_value(&args, "--account=")) {
        Ok(account) => account.clone(),
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    let code = match command {
        "backup" => cmd_backup(&config, &account, &args),
        "export" => cmd_export(&config, &account, &args),
        "labels" => cmd_labels(&config, &account, &args),
        "message" => cmd_message(&config, &account, &args),
        "quota" => cmd_quota(&config),
        other => {
            eprintln!("Unknown command '{}'", other);
            print_help();
            2
        }
    };
    std::process::exit(code);
}
