use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use clerk::accounts::session::SessionStore;
use clerk::accounts::UserStore;
use clerk::blockcount::BlockCountStore;
use clerk::config::{Config, ConfigOverrides};
use clerk::db;
use clerk::email::sink::{build_sink, deliver_pending};
use clerk::migrations::blockcount::{parse_currency_list, CurrencyCode};
use clerk::migrations::MigrationRunner;
use clerk::server::run_server;
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    name = "clerk",
    about = "Account management and per-currency block-count schema"
)]
struct Cli {
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long)]
    db: Option<String>,
    /// Comma separated currency codes, replacing the configured list
    #[arg(long)]
    currencies: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply every pending migration
    Migrate,
    /// List migrations and whether they are applied
    Migrations,
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    UserAdd {
        #[arg(long, default_value = "")]
        email: String,
        #[arg(long, default_value = "")]
        name: String,
    },
    /// Issue a bearer session token for a user
    Session {
        #[arg(long = "user-id")]
        user_id: i64,
    },
    Blockcount {
        #[arg(long)]
        currency: String,
        #[arg(long)]
        count: i64,
    },
    /// Hand queued e-mails to the configured sink
    DeliverEmails,
    Config {
        #[arg(long)]
        init: bool,
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load(Some(&config_path))?;
    config.apply_overrides(ConfigOverrides {
        db_path: cli.db.clone(),
        currencies: cli
            .currencies
            .as_deref()
            .map(parse_currency_list)
            .transpose()?,
    });

    if let Commands::Config { init, show } = &cli.command {
        return handle_config_command(*init, *show, &config, &config_path);
    }
    if let Commands::Serve { host, port } = &cli.command {
        let host = host.clone().unwrap_or_else(|| config.server.host.clone());
        let port = port.unwrap_or(config.server.port);
        let bind = format!("{host}:{port}");
        let addr: SocketAddr = bind
            .parse()
            .map_err(|e| anyhow!("invalid bind address {bind}: {e}"))?;
        return run_server(config, addr).await;
    }
    if matches!(cli.command, Commands::DeliverEmails) {
        let Some(sink) = build_sink(&config.email)? else {
            println!("email sink is 'outbox'; nothing to deliver");
            return Ok(());
        };
        let delivered =
            deliver_pending(&config.resolved_db_path(), &config.email, sink.as_ref()).await?;
        println!("Delivered {delivered} emails");
        return Ok(());
    }

    let db_path = config.resolved_db_path();
    let conn = db::open(&db_path)?;
    let runner = MigrationRunner::with_currencies(&config.currencies.codes);

    match &cli.command {
        Commands::Migrate => {
            let applied = runner.run(&conn)?;
            info!("applied {} migrations to {}", applied.len(), db_path.display());
            for name in applied {
                println!("applied {name}");
            }
        }
        Commands::Migrations => {
            for status in runner.status(&conn)? {
                let marker = if status.applied { "x" } else { " " };
                println!("[{marker}] {}", status.name);
            }
        }
        Commands::UserAdd { email, name } => {
            runner.run(&conn)?;
            let user = UserStore::new(&conn).create(email, name)?;
            println!("Created user {}", user.id);
        }
        Commands::Session { user_id } => {
            runner.run(&conn)?;
            if UserStore::new(&conn).get(*user_id)?.is_none() {
                return Err(anyhow!("user {user_id} not found"));
            }
            let token = SessionStore::new(&conn).create(*user_id)?;
            println!("{token}");
        }
        Commands::Blockcount { currency, count } => {
            let currency: CurrencyCode = currency.parse()?;
            if !config.currencies.codes.contains(&currency) {
                return Err(anyhow!(
                    "currency {currency} is not configured; add it to [currencies] codes"
                ));
            }
            runner.run(&conn)?;
            let row = BlockCountStore::new(&conn).record(&currency, *count)?;
            println!("Recorded {currency} block count {} (row {})", row.blockcount, row.id);
        }
        Commands::Config { .. } | Commands::Serve { .. } | Commands::DeliverEmails => {
            unreachable!("handled before opening the database")
        }
    }

    Ok(())
}

fn handle_config_command(
    init: bool,
    show: bool,
    config: &Config,
    config_path: &PathBuf,
) -> Result<()> {
    if init {
        Config::write_template(config_path)?;
        println!("Wrote config template to {}", config_path.display());
    }
    if show || !init {
        println!("{}", serde_json::to_string_pretty(config)?);
    }
    Ok(())
}
