use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "vg")]
#[command(about = "Vault gate operator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env overlays)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Validate a layered config and list the env vars it references
    ConfigCheck {
        #[arg(required = true)]
        paths: Vec<String>,

        /// GATE | DAEMON
        #[arg(long, default_value = "DAEMON")]
        surface: String,

        /// Fail on unused keys instead of warning
        #[arg(long, default_value_t = false)]
        strict: bool,

        /// Also require every referenced env var to be set
        #[arg(long, default_value_t = false)]
        resolve: bool,
    },

    /// Read a secret from stdin and print its verification material
    HashSecret {
        /// exact | phrase
        #[arg(long, default_value = "exact")]
        normalize: String,
    },

    /// Grant token utilities
    Token {
        #[command(subcommand)]
        cmd: TokenCmd,
    },

    /// Audit trail utilities
    Audit {
        #[command(subcommand)]
        cmd: AuditCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,

    /// Apply SQL migrations.
    Migrate,
}

#[derive(Subcommand)]
enum TokenCmd {
    /// Check a grant token's signature and print its claims
    Verify {
        token: String,

        /// Layered config paths; `signing.key_env` names the key's env var
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,
    },
}

#[derive(Subcommand)]
enum AuditCmd {
    /// Verify the hash chain of a JSONL audit log
    Verify { path: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = vg_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = vg_db::status(&pool).await?;
                    println!(
                        "db_ok={} has_gate_tables={} live_sessions={}",
                        s.ok, s.has_gate_tables, s.live_sessions
                    );
                }
                DbCmd::Migrate => {
                    vg_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash { paths } => commands::config::config_hash(&paths)?,

        Commands::ConfigCheck {
            paths,
            surface,
            strict,
            resolve,
        } => {
            let surface = commands::config::parse_surface(&surface)?;
            commands::config::config_check(&paths, surface, strict, resolve)?;
        }

        Commands::HashSecret { normalize } => {
            let n = commands::parse_normalization(&normalize)?;
            commands::secret::hash_secret_cmd(n)?;
        }

        Commands::Token { cmd } => match cmd {
            TokenCmd::Verify {
                token,
                config_paths,
            } => commands::secret::token_verify(&token, &config_paths)?,
        },

        Commands::Audit { cmd } => match cmd {
            AuditCmd::Verify { path } => commands::audit::audit_verify(&path)?,
        },
    }

    Ok(())
}
