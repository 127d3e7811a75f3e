use anyhow::{anyhow, Result};
use chrono::{Duration, Utc};
use clap::{Arg, ArgAction, Command};
use std::collections::BTreeMap;
use tracing::{error, info};

use hospital_audit::audit::event::AuditLogEntry;
use hospital_audit::audit::{detect_gaps, find_tampered_entries, verify_chain, GapType};
use hospital_audit::config::AppConfig;
use hospital_audit::database::{AuditStore, Database};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("verify-audit-log")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Verify hospital audit ledger integrity")
        .arg(
            Arg::new("database-url")
                .short('d')
                .long("database-url")
                .value_name("URL")
                .help("Ledger database URL (defaults to the configured database)"),
        )
        .arg(
            Arg::new("window-days")
                .short('w')
                .long("window-days")
                .value_name("DAYS")
                .value_parser(clap::value_parser!(i64))
                .help("Only verify entries persisted within the last DAYS days"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable verbose output"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .help("Suppress output except errors"),
        )
        .get_matches();

    let verbose = matches.get_flag("verbose");
    let quiet = matches.get_flag("quiet");

    // Set log level based on flags
    let level = if quiet {
        tracing::Level::ERROR
    } else if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let database_url = match matches.get_one::<String>("database-url") {
        Some(url) => url.clone(),
        None => AppConfig::load()?.database.url,
    };
    let window_days = matches.get_one::<i64>("window-days").copied();

    if let Err(e) = verify_ledger(&database_url, window_days, verbose, quiet).await {
        error!("Audit ledger verification failed: {}", e);
        eprintln!("✗ {}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn verify_ledger(database_url: &str, window_days: Option<i64>, verbose: bool, quiet: bool) -> Result<()> {
    info!("Verifying audit ledger: {}", database_url);

    let database = Database::new(database_url).await?;
    let checkpoints = database.checkpoints().await?;
    let (entries, from_genesis) = match window_days {
        Some(days) => (
            database
                .entries_persisted_since(Utc::now() - Duration::days(days))
                .await?,
            false,
        ),
        None => (database.all_entries().await?, true),
    };

    if verbose {
        println!(
            "Loaded {} ledger entries and {} retention checkpoints",
            entries.len(),
            checkpoints.len()
        );
    }

    let result = verify_chain(&entries, &checkpoints, from_genesis);
    let gaps = detect_gaps(&entries, &checkpoints);

    if verbose {
        print_summary(&entries);
        for gap in &gaps {
            let kind = match gap.gap_type {
                GapType::Retention => "retention checkpoint",
                GapType::HashGap => "UNEXPLAINED",
            };
            println!("  Gap between entries {} and {}: {}", gap.before_id, gap.after_id, kind);
        }
    }

    if !result.is_valid {
        let tampered = find_tampered_entries(&entries);
        if !tampered.is_empty() {
            eprintln!("Entries whose contents no longer match their hash: {:?}", tampered);
        }
        return Err(anyhow!(result.summary()));
    }

    if !quiet {
        println!("✓ {}", result.summary());
    }
    Ok(())
}

fn print_summary(entries: &[AuditLogEntry]) {
    let (first, last) = match (entries.first(), entries.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => {
            println!("Ledger is empty");
            return;
        }
    };

    println!("\nAudit Ledger Summary:");
    println!("  Total entries: {}", entries.len());
    println!("  First entry: {} ({})", first.id, first.event.timestamp);
    println!("  Last entry: {} ({})", last.id, last.event.timestamp);
    println!("  Head hash: {}", last.hash_chain);

    let mut by_risk = BTreeMap::new();
    for entry in entries {
        *by_risk.entry(entry.event.risk_level).or_insert(0) += 1;
    }
    println!("\nRisk distribution:");
    for (risk, count) in by_risk {
        println!("  {}: {}", risk, count);
    }
}
