//! inarbit - service runner.
//!
//! Wires the ingestor, both opportunity scanners, and the decision service
//! over a shared in-process KV store and the SQLite relational store, then
//! waits for ctrl-c and stops every task through its stop signal. The OMS is
//! constructed here too so the presentation collaborator (out of tree) can
//! drive it; this binary itself only runs the background pipeline.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use dotenv::dotenv;
use tracing::info;
use tracing_subscriber::EnvFilter;

use inarbit_backend::config::PairCatalog;
use inarbit_backend::decision::{ConstraintsHandle, DecisionService, DecisionSettings};
use inarbit_backend::exchange::{BinanceAdapter, ExchangeAdapter};
use inarbit_backend::marketdata::{IngestorSettings, MarketDataIngestor, MarketDataRepository};
use inarbit_backend::oms::{OmsService, OmsSettings};
use inarbit_backend::regime::{MarketRegimeService, RegimeSettings};
use inarbit_backend::scanners::{
    CashCarryScanner, CashCarrySettings, TriangularScanner, TriangularSettings,
};
use inarbit_backend::store::{Database, KvStore, MemoryKv};
use inarbit_backend::util::stop_channel;

#[derive(Parser, Debug)]
#[command(name = "inarbit", about = "Arbitrage decision and execution core")]
struct Args {
    /// SQLite database path.
    #[arg(long, env = "INARBIT_DB_PATH", default_value = "inarbit.db")]
    db_path: String,

    /// Skip the market data ingestor (scanners then run on external writes).
    #[arg(long, default_value_t = false)]
    no_ingest: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(db_path = %args.db_path, "starting inarbit core");

    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let db = Database::open(&args.db_path)?;
    let catalog = PairCatalog::new(db.clone()).await?;
    let repo = MarketDataRepository::new(kv.clone());
    let adapter: Arc<dyn ExchangeAdapter> = Arc::new(BinanceAdapter::from_env()?);

    let mut handles = Vec::new();
    let mut tasks = Vec::new();

    if !args.no_ingest {
        let ingestor = MarketDataIngestor::new(
            adapter.clone(),
            kv.clone(),
            catalog.clone(),
            IngestorSettings::from_env(),
        );
        let (handle, stop) = stop_channel();
        handles.push(handle);
        tasks.push(tokio::spawn(ingestor.run(stop)));
    }

    let triangular = TriangularScanner::new(
        repo.clone(),
        kv.clone(),
        catalog.clone(),
        TriangularSettings::from_env(),
    );
    let (handle, stop) = stop_channel();
    handles.push(handle);
    tasks.push(tokio::spawn(triangular.run(stop)));

    let cashcarry = CashCarryScanner::new(
        repo.clone(),
        kv.clone(),
        catalog.clone(),
        CashCarrySettings::from_env(),
    );
    let (handle, stop) = stop_channel();
    handles.push(handle);
    tasks.push(tokio::spawn(cashcarry.run(stop)));

    let regime = MarketRegimeService::new(
        repo.clone(),
        kv.clone(),
        catalog.clone(),
        RegimeSettings::from_env(),
    );
    let constraints = ConstraintsHandle::load(kv.clone()).await;
    let decisions = DecisionService::new(
        kv.clone(),
        repo.clone(),
        db.clone(),
        regime,
        constraints,
        DecisionSettings::from_env(),
    );
    let (handle, stop) = stop_channel();
    handles.push(handle);
    tasks.push(tokio::spawn(decisions.run(stop)));

    // The OMS has no background loop; it executes on explicit triggers from
    // the presentation layer. Constructing it here validates the wiring.
    let _oms = OmsService::new(
        db.clone(),
        kv.clone(),
        repo.clone(),
        adapter.clone(),
        catalog.clone(),
        OmsSettings::from_env(),
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, stopping services");
    for handle in &handles {
        handle.stop();
    }
    for task in tasks {
        let _ = task.await;
    }
    info!("all services stopped");
    Ok(())
}
