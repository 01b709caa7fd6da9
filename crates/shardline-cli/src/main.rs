//! Shardline CLI - inventory checks, dumps and binlog tailing
//!
//! Every command reads a pipeline YAML file; flags override the file values.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use shardline_pipeline::prelude::*;
use shardline_rdbc::connection::{Connection, DatabaseType};
use shardline_rdbc::mysql::MySqlConnection;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "shardline")]
#[command(about = "Shardline - chunked inventory scans and binlog capture for live data migration")]
#[command(version)]
struct Cli {
    /// Pipeline configuration file
    #[arg(short, long, env = "SHARDLINE_CONFIG", default_value = "shardline.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare a table between source and target, chunk by chunk
    Check {
        /// Table as `schema.table` or `table`
        table: String,

        /// Rows per compared chunk
        #[arg(long)]
        chunk_size: Option<usize>,
    },

    /// Print every row of a source table as JSON lines
    Dump {
        /// Table as `schema.table` or `table`
        table: String,

        /// Rows per batch
        #[arg(long)]
        batch_size: Option<usize>,

        /// Resume after the checkpoint stored in this JSON file
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },

    /// Follow the source binlog and print decoded events as JSON lines
    Tail {
        /// Binlog file to start from
        #[arg(long)]
        file: Option<String>,

        /// Offset in the binlog file
        #[arg(long)]
        position: Option<u64>,

        /// Print single events instead of whole transactions
        #[arg(long)]
        no_group: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Check { table, chunk_size } => {
            if let Some(chunk_size) = chunk_size {
                config.inventory.chunk_size = chunk_size;
            }
            check(&config, QualifiedTable::parse(&table)).await?;
        }

        Commands::Dump {
            table,
            batch_size,
            checkpoint,
        } => {
            if let Some(batch_size) = batch_size {
                config.dumper.batch_size = batch_size;
            }
            let resume = match checkpoint {
                Some(path) => {
                    let content = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    Some(serde_json::from_str::<ScanCheckpoint>(&content)?)
                }
                None => None,
            };
            dump(&config, QualifiedTable::parse(&table), resume).await?;
        }

        Commands::Tail {
            file,
            position,
            no_group,
        } => {
            let mut binlog = config
                .binlog
                .clone()
                .context("the configuration has no binlog section")?;
            if file.is_some() {
                binlog.file = file;
            }
            if let Some(position) = position {
                binlog.position = position;
            }
            if no_group {
                binlog.group_by_transaction = false;
            }
            tail(&binlog).await?;
        }
    }

    Ok(())
}

async fn connect(source: &DataSourceConfig) -> anyhow::Result<Arc<MySqlConnection>> {
    let config = source.connection_config();
    let database_type = config.database_type()?;
    if !matches!(database_type, DatabaseType::MySQL | DatabaseType::MariaDB) {
        anyhow::bail!("{} sources are not supported by this build", database_type);
    }
    Ok(Arc::new(MySqlConnection::connect(&config).await?))
}

/// Primary key columns, or the first all-NOT-NULL unique index
async fn unique_keys(
    conn: &MySqlConnection,
    table: &QualifiedTable,
) -> anyhow::Result<Vec<UniqueKeyColumn>> {
    let metadata = conn
        .table_metadata(table.schema.as_deref(), &table.table)
        .await?
        .ok_or_else(|| shardline_rdbc::Error::table_not_found(table.to_string()))?;

    let primary: Vec<UniqueKeyColumn> = metadata
        .primary_key_columns()
        .into_iter()
        .map(|c| UniqueKeyColumn::new(c.name.clone(), c.type_name.clone()))
        .collect();
    if !primary.is_empty() {
        return Ok(primary);
    }

    let keys = conn
        .unique_key_columns(table.schema.as_deref(), &table.table)
        .await?
        .into_iter()
        .map(|name| {
            let data_type = metadata
                .column(&name)
                .map(|c| c.type_name.clone())
                .unwrap_or_default();
            UniqueKeyColumn::new(name, data_type)
        })
        .collect();
    Ok(keys)
}

async fn check(config: &PipelineConfig, table: QualifiedTable) -> anyhow::Result<()> {
    let target_config = config
        .target
        .as_ref()
        .context("the configuration has no target section")?;
    let source = connect(&config.source).await?;
    let target = connect(target_config).await?;
    let keys = unique_keys(&source, &table).await?;

    let calculator = |conn: &Arc<MySqlConnection>| {
        RecordChunkCalculator::new(
            ChecksumAggregator,
            Arc::new(DialectQueryBuilder::for_database(conn.database_type())),
            config.inventory.chunk_size,
        )
        .with_streaming(
            config.inventory.streaming_range_type,
            config.inventory.streaming_chunk_count,
        )
    };
    let checker = TableInventoryChecker::new(calculator(&source), calculator(&target))?;

    let source_params = ScanParameters::range(source.clone(), table.clone(), keys.clone(), QueryRange::full());
    let target_params = ScanParameters::range(target.clone(), table, keys, QueryRange::full());
    let result = tokio::select! {
        result = checker.check(source_params, target_params) => result?,
        _ = tokio::signal::ctrl_c() => {
            checker.cancel().await;
            anyhow::bail!("check interrupted");
        }
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    source.close().await?;
    target.close().await?;
    if !result.matched {
        std::process::exit(2);
    }
    Ok(())
}

async fn dump(
    config: &PipelineConfig,
    table: QualifiedTable,
    resume: Option<ScanCheckpoint>,
) -> anyhow::Result<()> {
    let source = connect(&config.source).await?;
    let keys = unique_keys(&source, &table).await?;
    let range = match &resume {
        Some(checkpoint) => {
            info!("Resuming dump of {} after {:?}", table, checkpoint.lower_bound);
            checkpoint.resume_range(None)
        }
        None => QueryRange::full(),
    };

    let dumper = Arc::new(InventoryDumper::new(
        Arc::new(DialectQueryBuilder::for_database(source.database_type())),
        &config.dumper,
        &config.inventory,
    ));
    let (mut rx, handle) = dumper.spawn(ScanParameters::range(source.clone(), table.clone(), keys, range));

    let mut last_key = None;
    loop {
        tokio::select! {
            batch = rx.recv() => {
                let Some(batch) = batch else { break };
                for record in batch {
                    if let IngestPosition::UniqueKey { begin: Some(key), .. } = &record.position {
                        last_key = Some(key.clone());
                    }
                    let line = serde_json::json!({
                        "columns": record.columns,
                        "values": record.values,
                        "position": record.position,
                    });
                    println!("{}", line);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                dumper.stop().await;
                let checkpoint = ScanCheckpoint {
                    table: table.to_string(),
                    lower_bound: last_key.clone(),
                    lower_inclusive: false,
                };
                eprintln!("{}", serde_json::to_string(&checkpoint)?);
                break;
            }
        }
    }

    match handle.await? {
        Ok(rows) => info!("Dumped {} rows", rows),
        Err(e) if e.is_cancelled() => info!("Dump stopped"),
        Err(e) => return Err(e.into()),
    }
    source.close().await?;
    Ok(())
}

async fn tail(config: &BinlogConfig) -> anyhow::Result<()> {
    let client = BinlogClient::connect(config).await?;
    info!(
        "Connected to {} (connection {})",
        client.server_version(),
        client.connection_id()
    );
    let mut events = client
        .start(config, BinlogFrameDecoder::from_config(config))
        .await?;

    loop {
        tokio::select! {
            unit = events.next() => match unit? {
                Some(unit) => println!("{}", serde_json::to_string(&unit)?),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    let position = events.position();
    eprintln!("{}", serde_json::to_string(position)?);
    info!("Stopped at {}", position);
    Ok(())
}
