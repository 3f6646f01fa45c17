//! gfsp
//!
//! Storage provider node binary. `run` starts the approver, receiver and
//! upload scanner; the other command groups are operator tools working on
//! the same configuration and database.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gfsp_core::piece::{self, PieceOp};
use gfsp_core::spdb::{BucketQuota, ReadRecord, SpDb, SqliteSpDb};
use gfsp_core::task::{MsgMigrateBucket, Task};
use gfsp_core::{metrics, Customize, GfSpBaseApp, GfSpConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Greenfield storage provider node
#[derive(Parser, Debug)]
#[command(name = "gfsp", author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "GFSP_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true, env = "GFSP_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct ConfigArg {
    /// Path of the TOML config file; defaults apply when omitted
    #[arg(long, short = 'c', env = "GFSP_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the node
    Run(ConfigArg),
    /// Configuration commands
    #[command(subcommand)]
    Config(ConfigCommand),
    /// P2P identity commands
    #[command(subcommand)]
    P2p(P2pCommand),
    /// Piece key and size helpers
    #[command(subcommand)]
    Debug(DebugCommand),
    /// Read bookkeeping tables
    #[command(subcommand)]
    Query(QueryCommand),
    /// Inspect what is needed to rebuild an object's pieces
    #[command(subcommand)]
    Recovery(RecoveryCommand),
    /// Bucket migration commands
    #[command(subcommand)]
    Migrate(MigrateCommand),
    /// Read quota commands
    #[command(subcommand)]
    Quota(QuotaCommand),
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the default configuration
    Default(ConfigArg),
    /// Load and validate a configuration file
    Check(ConfigArg),
}

#[derive(Subcommand, Debug)]
enum P2pCommand {
    /// Print the node's peer id, derived from its signer key
    PeerId(ConfigArg),
}

#[derive(Subcommand, Debug)]
enum DebugCommand {
    /// Build the piece key of a segment or EC piece
    PieceKey {
        #[command(flatten)]
        cfg: ConfigArg,
        #[arg(long)]
        object_id: u64,
        #[arg(long)]
        segment_idx: u32,
        /// Negative for the segment itself
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        redundancy_idx: i32,
        #[arg(long, default_value_t = 0)]
        version: i64,
    },
    /// Parse a piece key into its segment and redundancy indexes
    ParseKey {
        #[command(flatten)]
        cfg: ConfigArg,
        key: String,
    },
    /// Print the segment (and EC piece) sizes of a payload
    PieceSize {
        #[command(flatten)]
        cfg: ConfigArg,
        #[arg(long)]
        payload_size: u64,
        #[arg(long)]
        max_segment_size: u64,
        #[arg(long, default_value_t = 0)]
        data_chunk_num: u32,
    },
}

#[derive(Subcommand, Debug)]
enum QueryCommand {
    /// Monthly read traffic of a bucket
    Traffic {
        #[command(flatten)]
        cfg: ConfigArg,
        #[arg(long)]
        bucket_id: u64,
        /// Month as YYYY-MM
        #[arg(long)]
        year_month: String,
    },
    /// Committed integrity hash of an object replica
    Integrity {
        #[command(flatten)]
        cfg: ConfigArg,
        #[arg(long)]
        object_id: u64,
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        redundancy_idx: i32,
    },
    /// Upload progress of an object
    Upload {
        #[command(flatten)]
        cfg: ConfigArg,
        #[arg(long)]
        object_id: u64,
    },
}

#[derive(Subcommand, Debug)]
enum RecoveryCommand {
    /// List piece keys and checksums recorded for an object replica
    ListPieces {
        #[command(flatten)]
        cfg: ConfigArg,
        #[arg(long)]
        object_id: u64,
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        redundancy_idx: i32,
        #[arg(long, default_value_t = 0)]
        version: i64,
    },
}

#[derive(Subcommand, Debug)]
enum MigrateCommand {
    /// Ask the approver to sign a bucket migration to `dst_sp_id`
    Approve {
        #[command(flatten)]
        cfg: ConfigArg,
        #[arg(long)]
        bucket: String,
        #[arg(long)]
        dst_sp_id: u32,
        #[arg(long, default_value = "")]
        operator: String,
    },
}

#[derive(Subcommand, Debug)]
enum QuotaCommand {
    /// Charge a read against a bucket's monthly quota
    Check {
        #[command(flatten)]
        cfg: ConfigArg,
        #[arg(long)]
        bucket_id: u64,
        #[arg(long, default_value = "")]
        bucket_name: String,
        #[arg(long, default_value_t = 0)]
        object_id: u64,
        #[arg(long, default_value = "")]
        object_name: String,
        #[arg(long, default_value = "")]
        user: String,
        #[arg(long)]
        size: u64,
        #[arg(long)]
        free_quota: u64,
        #[arg(long, default_value_t = 0)]
        charged_quota: u64,
        /// Read time in microseconds; now when omitted
        #[arg(long)]
        timestamp_us: Option<i64>,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    match cli.command {
        Command::Run(cfg) => run(load_config(&cfg)?).await,
        Command::Config(cmd) => config_command(cmd),
        Command::P2p(P2pCommand::PeerId(cfg)) => {
            let config = load_config(&cfg)?;
            println!("{}", peer_id(&config.app.signer_key));
            Ok(())
        }
        Command::Debug(cmd) => debug_command(cmd),
        Command::Query(cmd) => query_command(cmd).await,
        Command::Recovery(cmd) => recovery_command(cmd).await,
        Command::Migrate(cmd) => migrate_command(cmd).await,
        Command::Quota(cmd) => quota_command(cmd).await,
    }
}

fn load_config(arg: &ConfigArg) -> Result<GfSpConfig> {
    match &arg.config {
        Some(path) => GfSpConfig::load_from_file(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(GfSpConfig::default()),
    }
}

async fn open_db(config: &GfSpConfig) -> Result<SqliteSpDb> {
    SqliteSpDb::connect(&config.db.url, config.db.max_connections)
        .await
        .with_context(|| format!("failed to open db {}", config.db.url))
}

// =============================================================================
// Commands
// =============================================================================

async fn run(config: GfSpConfig) -> Result<()> {
    info!("Starting gfsp node");
    info!("  Operator: {}", config.app.operator_address);
    info!("  DB: {}", config.db.url);

    let app = GfSpBaseApp::build(config.clone(), Customize::new()).await?;
    let mut lifecycle = app.lifecycle();
    let cancel = lifecycle.token();

    if !config.metrics.disable {
        let addr = config.metrics.listen_address.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(&addr, cancel).await {
                error!("Metrics server error: {:#}", e);
            }
        });
    }

    lifecycle.signals();
    lifecycle.start_services().await?;
    info!(services = ?lifecycle.active_services(), "node running");

    if !lifecycle.wait().await {
        bail!("services did not stop within {:?}", config.shutdown_timeout());
    }
    info!("Node shutdown complete");
    Ok(())
}

fn config_command(cmd: ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Default(_) => {
            print!("{}", GfSpConfig::default().to_toml_string()?);
        }
        ConfigCommand::Check(cfg) => {
            let path = cfg.config.clone().context("--config is required")?;
            load_config(&cfg)?;
            println!("{} is valid", path.display());
        }
    }
    Ok(())
}

fn peer_id(signer_key: &str) -> String {
    hex::encode(Sha256::digest(signer_key.as_bytes()))
}

fn debug_command(cmd: DebugCommand) -> Result<()> {
    let op = piece::DefaultPieceOp;
    match cmd {
        DebugCommand::PieceKey {
            cfg,
            object_id,
            segment_idx,
            redundancy_idx,
            version,
        } => {
            load_config(&cfg)?;
            println!(
                "{}",
                op.challenge_piece_key(object_id, segment_idx, redundancy_idx, version)
            );
        }
        DebugCommand::ParseKey { cfg, key } => {
            load_config(&cfg)?;
            let (segment_idx, redundancy_idx) = op.parse_challenge_idx(&key)?;
            println!("segment_idx: {}", segment_idx);
            println!("redundancy_idx: {}", redundancy_idx);
        }
        DebugCommand::PieceSize {
            cfg,
            payload_size,
            max_segment_size,
            data_chunk_num,
        } => {
            load_config(&cfg)?;
            if max_segment_size == 0 {
                bail!("--max-segment-size must be positive");
            }
            let count = op.segment_piece_count(payload_size, max_segment_size);
            println!("segments: {}", count);
            for idx in 0..count {
                let segment = op.segment_piece_size(payload_size, idx, max_segment_size);
                if data_chunk_num > 0 {
                    let ec =
                        op.ec_piece_size(payload_size, idx, max_segment_size, data_chunk_num);
                    println!("  {}: segment {} ec {}", idx, segment, ec);
                } else {
                    println!("  {}: segment {}", idx, segment);
                }
            }
        }
    }
    Ok(())
}

async fn query_command(cmd: QueryCommand) -> Result<()> {
    match cmd {
        QueryCommand::Traffic {
            cfg,
            bucket_id,
            year_month,
        } => {
            let db = open_db(&load_config(&cfg)?).await?;
            let traffic = db.get_bucket_traffic(bucket_id, &year_month).await?;
            println!("{}", serde_json::to_string_pretty(&traffic)?);
            println!("remaining: {}", traffic.remaining());
        }
        QueryCommand::Integrity {
            cfg,
            object_id,
            redundancy_idx,
        } => {
            let db = open_db(&load_config(&cfg)?).await?;
            let meta = db.get_object_integrity(object_id, redundancy_idx).await?;
            println!("object_id: {}", meta.object_id);
            println!("redundancy_idx: {}", meta.redundancy_index);
            println!("integrity: {}", hex::encode(&meta.integrity_checksum));
            println!("signature: {}", hex::encode(&meta.signature));
            println!("pieces: {}", meta.piece_checksum_list.len());
        }
        QueryCommand::Upload { cfg, object_id } => {
            let db = open_db(&load_config(&cfg)?).await?;
            let meta = db.get_upload_meta(object_id).await?;
            println!("{}", serde_json::to_string_pretty(&meta)?);
        }
    }
    Ok(())
}

async fn recovery_command(cmd: RecoveryCommand) -> Result<()> {
    let RecoveryCommand::ListPieces {
        cfg,
        object_id,
        redundancy_idx,
        version,
    } = cmd;
    let db = open_db(&load_config(&cfg)?).await?;
    let meta = db.get_object_integrity(object_id, redundancy_idx).await?;
    let op = piece::DefaultPieceOp;
    for (idx, checksum) in meta.piece_checksum_list.iter().enumerate() {
        let segment_idx = u32::try_from(idx).context("segment index overflow")?;
        println!(
            "{} {}",
            op.challenge_piece_key(object_id, segment_idx, redundancy_idx, version),
            hex::encode(checksum)
        );
    }
    Ok(())
}

async fn migrate_command(cmd: MigrateCommand) -> Result<()> {
    let MigrateCommand::Approve {
        cfg,
        bucket,
        dst_sp_id,
        operator,
    } = cmd;
    let config = load_config(&cfg)?;
    let app = GfSpBaseApp::build(config, Customize::new()).await?;
    let mut task = Task::migrate_bucket_approval(Some(MsgMigrateBucket {
        operator,
        bucket_name: bucket,
        dst_primary_sp_id: dst_sp_id,
        ..Default::default()
    }));
    app.approver().pre_migrate_bucket_approval(&mut task).await?;
    app.approver()
        .handle_migrate_bucket_approval_task(&mut task)
        .await?;

    println!("key: {}", task.key());
    println!("expired_height: {}", task.expired_height().unwrap_or_default());
    if let Some(approval) = task.approval_mut() {
        println!("signature: {}", hex::encode(&approval.sig));
    }
    Ok(())
}

async fn quota_command(cmd: QuotaCommand) -> Result<()> {
    let QuotaCommand::Check {
        cfg,
        bucket_id,
        bucket_name,
        object_id,
        object_name,
        user,
        size,
        free_quota,
        charged_quota,
        timestamp_us,
    } = cmd;
    let db = open_db(&load_config(&cfg)?).await?;
    let record = ReadRecord {
        bucket_id,
        object_id,
        user_address: user,
        bucket_name,
        object_name,
        read_size: size,
        read_timestamp_us: timestamp_us.unwrap_or_else(|| chrono::Utc::now().timestamp_micros()),
    };
    let quota = BucketQuota {
        free_quota_size: free_quota,
        charged_quota_size: charged_quota,
    };
    db.check_quota_and_add_read_record(&record, &quota).await?;
    println!("read of {} bytes admitted for bucket {}", size, bucket_id);
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(cli: &Cli) -> Result<()> {
    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("sqlx=warn".parse()?);

    let registry = tracing_subscriber::registry().with(filter);
    if cli.log_json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?;
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init()?;
    }
    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, cancel: CancellationToken) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(body.into()));
        *response.status_mut() = status;
        response
    }

    async fn metrics_handler(
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/metrics" => match metrics::gather_text() {
                Ok(text) => {
                    let mut response = respond(StatusCode::OK, text);
                    response.headers_mut().insert(
                        CONTENT_TYPE,
                        HeaderValue::from_static("text/plain; version=0.0.4"),
                    );
                    response
                }
                Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            },
            "/healthz" | "/livez" | "/readyz" => respond(StatusCode::OK, "ok"),
            _ => respond(StatusCode::NOT_FOUND, "not found"),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid metrics server address {}", addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics server to {}", addr))?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Metrics server stopped");
                return Ok(());
            }
            accepted = listener.accept() => accepted.context("metrics server accept error")?,
        };

        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                error!("Metrics server connection error: {}", e);
            }
        });
    }
}
