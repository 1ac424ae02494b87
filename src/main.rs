use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ldap_link::{Config, Connection, ResultCursor, Scope, SearchError};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "ldap-link")]
#[command(about = "LDAP client - search, read and authenticate against a directory")]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Host to connect to (repeatable; overrides `hosts` from the config)
    #[arg(long = "host", value_name = "HOST")]
    hosts: Vec<String>,

    /// Bind as this identity instead of the configured admin
    #[arg(long, value_name = "DN", env = "LDAP_BIND_DN")]
    bind_dn: Option<String>,

    /// Password for --bind-dn
    #[arg(long, value_name = "PASSWORD", env = "LDAP_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Print Prometheus metrics to stderr before exiting
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Search and print matching entries as JSON lines
    Search {
        /// Search base (defaults to base_dn from the config)
        #[arg(short, long)]
        base: Option<String>,
        #[arg(short, long, default_value = "(objectClass=*)")]
        filter: String,
        #[arg(short, long, value_enum, default_value_t = ScopeArg::Subtree)]
        scope: ScopeArg,
        /// Attribute to return (repeatable; all when omitted)
        #[arg(short, long = "attr")]
        attrs: Vec<String>,
        #[arg(long, default_value_t = 0)]
        size_limit: u32,
        #[arg(long)]
        page_size: Option<u32>,
        /// Send a single request without the paged results control
        #[arg(long)]
        no_paging: bool,
    },
    /// Print one entry
    Read {
        dn: String,
        #[arg(short, long = "attr")]
        attrs: Vec<String>,
    },
    /// Print the immediate children of an entry
    List {
        dn: String,
        #[arg(short, long, default_value = "(objectClass=*)")]
        filter: String,
        #[arg(short, long = "attr")]
        attrs: Vec<String>,
    },
    /// Check a user's password without keeping the session
    Auth {
        username: String,
        #[arg(long, env = "LDAP_USER_PASSWORD", hide_env_values = true)]
        user_password: String,
    },
    /// Print the authorization identity of the session
    Whoami,
}

#[derive(Clone, Copy, ValueEnum)]
enum ScopeArg {
    Base,
    One,
    Subtree,
}

impl From<ScopeArg> for Scope {
    fn from(scope: ScopeArg) -> Self {
        match scope {
            ScopeArg::Base => Scope::Base,
            ScopeArg::One => Scope::OneLevel,
            ScopeArg::Subtree => Scope::Subtree,
        }
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config {:?}", args.config))?;
    if !args.hosts.is_empty() {
        config.hosts = args.hosts.clone();
    }
    if let Some(dn) = &args.bind_dn {
        config.admin_username = Some(dn.clone());
        config.admin_password = args.password.clone();
    } else if let Some(password) = &args.password {
        config.admin_password = Some(password.clone());
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn print_records(cursor: &mut ResultCursor) -> Result<usize> {
    let mut printed = 0;
    while let Some(record) = cursor.advance()? {
        println!("{}", serde_json::to_string(&record)?);
        printed += 1;
    }
    Ok(printed)
}

/// Print what arrived, then surface the failure.
fn print_search(outcome: std::result::Result<ResultCursor, SearchError>) -> Result<()> {
    match outcome {
        Ok(mut cursor) => {
            let printed = print_records(&mut cursor)?;
            info!("{} entries", printed);
            Ok(())
        }
        Err(err) => {
            let (error, partial) = err.into_parts();
            if let Some(mut partial) = partial {
                let printed = print_records(&mut partial)?;
                error!("search stopped after {} entries", printed);
            }
            Err(error).context("Search failed")
        }
    }
}

/// Runs one subcommand. `Ok(false)` means the directory answered but said no.
async fn run(conn: &mut Connection, command: Command) -> Result<bool> {
    match command {
        Command::Search {
            base,
            filter,
            scope,
            attrs,
            size_limit,
            page_size,
            no_paging,
        } => {
            let base = base.unwrap_or_else(|| conn.config().base_dn.clone());
            let mut request = conn
                .search_request(base, filter)
                .scope(scope.into())
                .attributes(attrs)
                .size_limit(size_limit);
            if let Some(size) = page_size {
                request = request.page_size(size);
            }
            if no_paging {
                request = request.paging(false);
            }
            print_search(conn.search(&request).await)?;
            Ok(true)
        }
        Command::Read { dn, attrs } => {
            let attrs: Vec<&str> = attrs.iter().map(String::as_str).collect();
            print_search(conn.read(&dn, &attrs).await)?;
            Ok(true)
        }
        Command::List { dn, filter, attrs } => {
            let attrs: Vec<&str> = attrs.iter().map(String::as_str).collect();
            print_search(conn.list(&dn, &filter, &attrs).await)?;
            Ok(true)
        }
        Command::Auth {
            username,
            user_password,
        } => {
            let result = conn
                .authenticate(&username, &user_password)
                .await
                .context("Authentication could not be attempted")?;
            println!("{}", serde_json::to_string(&result)?);
            Ok(result.is_authenticated())
        }
        Command::Whoami => {
            let identity = conn.whoami().await.context("WhoAmI failed")?;
            println!("{}", identity.unwrap_or_else(|| "anonymous".to_string()));
            Ok(true)
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("ldap_link={},warn", log_level))
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&args)?;
    info!("Hosts: {}", config.hosts.join(" "));
    info!("Port: {}", config.port());

    let metrics = Arc::new(ldap_link::Metrics::new());
    let mut conn = Connection::native(config)?.with_metrics(Arc::clone(&metrics));

    let outcome = run(&mut conn, args.command).await;
    conn.close().await;

    if args.metrics {
        eprint!("{}", metrics.render());
    }
    Ok(ExitCode::from(exit_status(outcome?)))
}

/// 2 when credentials were rejected, so scripts can tell it from an error (1).
fn exit_status(accepted: bool) -> u8 {
    if accepted {
        0
    } else {
        2
    }
}
