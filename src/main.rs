// Only compile UI module when TUI feature is enabled
#[cfg(feature = "tui")]
mod ui;

use anyhow::{Context, Result};
use chrono::{Local, NaiveTime};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use slip_renewal::{
    build_extractor, decode, entitlement_history, list_members, load_members_csv, parse_time_of_day, upsert_members,
    AppConfig, EntitlementExtender, LogStore, MemberStore, MonthToken, SqliteStore, SubmissionError,
    SubmissionForm, SubmissionService,
};

/// Membership renewal from self-reported bank transfers
#[derive(Parser, Debug)]
#[command(name = "slip-renewal")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = slip_renewal::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the database schema
    Init,

    /// Import or refresh members from a CSV export
    ImportMembers {
        /// CSV with columns Member_ID, Name, Aliases, Entitlement
        csv: PathBuf,
    },

    /// List members and their entitlements
    Members,

    /// Show the most recent transaction log rows
    Logs {
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Show past entitlement changes of one member
    History {
        /// Member id, name or alias
        member: String,

        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Show the months covered by an entitlement string
    Decode {
        entitlement: String,
    },

    /// Preview an extension without touching the database
    Extend {
        entitlement: String,
        amount: i64,

        /// Current month as YEAR-MM (defaults to today, with the year offset)
        #[arg(long)]
        now: Option<MonthToken>,
    },

    /// Report a transfer
    Submit {
        /// Sender name as registered
        #[arg(long)]
        name: String,

        #[arg(long)]
        amount: i64,

        /// Slip image file
        #[arg(long)]
        slip: PathBuf,

        /// Transfer time from the slip (HH:MM), used when the slip cannot be read
        #[arg(long, value_parser = parse_time_arg)]
        time: Option<NaiveTime>,
    },

    /// Browse members and the transaction log
    Ui,
}

fn parse_time_arg(s: &str) -> Result<NaiveTime, String> {
    parse_time_of_day(s).ok_or_else(|| format!("invalid time {:?}, expected HH:MM", s))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    let config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config {:?}", cli.config))?;

    match cli.command.unwrap_or(Commands::Ui) {
        Commands::Init => run_init(&config),
        Commands::ImportMembers { csv } => run_import(&config, &csv),
        Commands::Members => run_members(&config),
        Commands::Logs { limit } => run_logs(&config, limit),
        Commands::History { member, limit } => run_history(&config, &member, limit),
        Commands::Decode { entitlement } => {
            run_decode(&entitlement);
            Ok(())
        }
        Commands::Extend { entitlement, amount, now } => {
            run_extend(&config, &entitlement, amount, now);
            Ok(())
        }
        Commands::Submit { name, amount, slip, time } => {
            run_submit(&config, name, amount, &slip, time)
        }
        Commands::Ui => run_ui_mode(&config),
    }
}

fn run_init(config: &AppConfig) -> Result<()> {
    println!("🔧 Setting up database...");
    SqliteStore::open(&config.database_path)?;
    println!("✓ Database ready at {:?} (WAL mode)", config.database_path);
    Ok(())
}

fn run_import(config: &AppConfig, csv_path: &Path) -> Result<()> {
    println!("📂 Loading members from {:?}...", csv_path);
    let members = load_members_csv(csv_path)?;
    println!("✓ Loaded {} members from CSV", members.len());

    let store = SqliteStore::open(&config.database_path)?;
    let summary = upsert_members(store.connection(), &members)?;

    println!("✓ Inserted: {} members", summary.inserted);
    println!("✓ Updated: {} members", summary.updated);
    Ok(())
}

fn run_members(config: &AppConfig) -> Result<()> {
    let store = SqliteStore::open(&config.database_path)?;
    let members = list_members(store.connection())?;

    println!("{:<10} {:<24} {:<24} {}", "ID", "Name", "Aliases", "Entitlement");
    for m in &members {
        println!("{:<10} {:<24} {:<24} {}", m.member_id, m.name, m.aliases, m.entitlement);
    }
    println!("\n{} members", members.len());
    Ok(())
}

fn run_logs(config: &AppConfig, limit: usize) -> Result<()> {
    let store = SqliteStore::open(&config.database_path)?;
    let entries = store.recent_log(limit)?;

    println!("{:<20} {:<24} {:>8} {:<9} {}", "Timestamp", "Sender", "Amount", "Time", "Status");
    for e in &entries {
        println!(
            "{:<20} {:<24} {:>8} {:<9} {}",
            e.record.timestamp, e.record.sender_name, e.record.amount, e.record.transfer_time, e.status
        );
    }
    Ok(())
}

fn run_history(config: &AppConfig, key: &str, limit: usize) -> Result<()> {
    let store = SqliteStore::open(&config.database_path)?;
    let Some(member) = store.lookup(key)? else {
        eprintln!("❌ No member named '{}'", key);
        std::process::exit(1);
    };

    println!("📜 {} ({}): {}\n", member.name, member.member_id, member.entitlement);
    let history = entitlement_history(store.connection(), &member.member_id, limit)?;
    if history.is_empty() {
        println!("(no changes recorded)");
    }
    for change in &history {
        println!(
            "{}  {} → {}",
            change.recorded_at.format("%Y-%m-%d %H:%M"),
            change.previous,
            change.updated
        );
    }
    Ok(())
}

fn run_decode(entitlement: &str) {
    let covered = decode(entitlement);
    if covered.is_empty() {
        println!("(no covered months)");
        return;
    }

    for token in covered.iter() {
        println!("{}", token);
    }
    println!("\n{} months | canonical: {}", covered.len(), covered);
}

fn run_extend(config: &AppConfig, entitlement: &str, amount: i64, now: Option<MonthToken>) {
    let now = now.unwrap_or_else(|| MonthToken::from_date(Local::now().date_naive(), config.year_offset));
    let extender = EntitlementExtender::with_unit_price(config.unit_price)
        .with_max_months(config.max_months_per_submission);
    let ext = match extender.extend_detailed(entitlement, amount, now) {
        Ok(ext) => ext,
        Err(e) => {
            eprintln!("❌ {}", e);
            return;
        }
    };

    println!("Before: {}", ext.previous);
    println!("After:  {}", ext.updated);
    match (ext.first_added, ext.last_added) {
        (Some(first), Some(last)) => {
            println!("Added {} month(s): {} → {}", ext.months_added, first, last)
        }
        _ => println!("Nothing added (amount below {})", config.unit_price),
    }
}

fn run_submit(
    config: &AppConfig,
    name: String,
    amount: i64,
    slip: &Path,
    time: Option<NaiveTime>,
) -> Result<()> {
    let slip_image = std::fs::read(slip).with_context(|| format!("Failed to read slip {:?}", slip))?;

    let store = SqliteStore::open(&config.database_path)?;
    let service = SubmissionService::from_config(build_extractor(config), config)?;

    if !config.payment_instructions.is_empty() {
        println!("ℹ️  {}", config.payment_instructions);
    }

    let form = SubmissionForm {
        sender_name: name,
        amount,
        slip_image,
        manual_time: time,
    };

    match service.submit(&store, &form, Local::now()) {
        Ok(outcome) => {
            println!("🎉 {}", outcome.message());
            Ok(())
        }
        Err(SubmissionError::Store(e)) => Err(e.context("System error")),
        Err(e) => {
            eprintln!("❌ {}", e);
            std::process::exit(2);
        }
    }
}

#[cfg(feature = "tui")]
fn run_ui_mode(config: &AppConfig) -> Result<()> {
    println!("🖥️  Loading Slip Renewal UI...\n");

    if !config.database_path.exists() {
        eprintln!("❌ Database not found at {:?}", config.database_path);
        eprintln!("   Run: slip-renewal import-members <csv>");
        eprintln!("   to import members first.");
        std::process::exit(1);
    }

    let store = SqliteStore::open(&config.database_path)?;
    let members = list_members(store.connection())?;
    let log = store.recent_log(500)?;

    println!("✓ Loaded {} members, {} log rows\n", members.len(), log.len());

    let current = MonthToken::from_date(Local::now().date_naive(), config.year_offset);
    let mut app = ui::App::new(members, log, current);
    ui::run_ui(&mut app)?;

    println!("\n✅ UI closed successfully");
    Ok(())
}

#[cfg(not(feature = "tui"))]
fn run_ui_mode(_config: &AppConfig) -> Result<()> {
    eprintln!("❌ TUI mode not available!");
    eprintln!("   Rebuild with: cargo build --features tui");
    eprintln!("   Or use web UI: cargo run --bin slip-renewal-server --features server");
    std::process::exit(1);
}
