//! Node wiring: component construction and worker lifecycles.
//!
//! The binary in `main.rs` is a thin shell over [`Node`], so the full stack
//! can also be stood up in-process by integration tests.

pub mod workers;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use numio_adapter::AdapterRegistry;
use numio_catalog::{Catalog, MemoryIndex, OfferSync, SearchIndex};
use numio_kernel::{EventBus, Kernel};
use numio_outbox::Dispatcher;
use numio_poll::PollManager;
use numio_reaper::Reaper;
use numio_rpc::HealthBoard;
use numio_saga::Orchestrator;
use numio_store::{CacheStore, Store};
use numio_wallet::{LedgerWallet, WalletGateway};

/// The assembled core: every component wired onto one store.
pub struct Node {
    pub store: Arc<Store>,
    pub cache: Arc<CacheStore>,
    pub kernel: Arc<Kernel>,
    pub wallet: Arc<LedgerWallet>,
    pub index: Arc<MemoryIndex>,
    pub catalog: Arc<Catalog>,
    pub adapters: AdapterRegistry,
    pub orchestrator: Arc<Orchestrator>,
    pub poll: Arc<PollManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub reaper: Arc<Reaper>,
    pub offer_sync: Arc<OfferSync>,
    pub health: Arc<HealthBoard>,
}

impl Node {
    /// Open the stores under `data_dir` and wire every component.
    pub fn open(data_dir: &Path, adapters: AdapterRegistry) -> anyhow::Result<Self> {
        let store = Arc::new(
            Store::open(data_dir.join("core")).context("opening core store")?,
        );
        let cache = Arc::new(CacheStore::open(&store).context("opening cache keyspace")?);
        let kernel = Arc::new(Kernel::new(Arc::clone(&store), EventBus::default()));
        let wallet = Arc::new(
            LedgerWallet::open(data_dir.join("wallet")).context("opening wallet ledger")?,
        );

        let index = Arc::new(MemoryIndex::new());
        let catalog = Arc::new(Catalog::new(
            Arc::clone(&index) as Arc<dyn SearchIndex>,
            Arc::clone(&store),
        ));

        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&kernel),
            Arc::clone(&wallet) as Arc<dyn WalletGateway>,
            Arc::clone(&catalog),
            adapters.clone(),
        ));
        let poll = Arc::new(PollManager::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&kernel),
            adapters.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&kernel),
            Arc::clone(&orchestrator),
            adapters.clone(),
            Arc::clone(&index) as Arc<dyn SearchIndex>,
        ));
        let reaper = Arc::new(
            Reaper::new(
                Arc::clone(&store),
                Arc::clone(&cache),
                Arc::clone(&kernel),
                Arc::clone(&orchestrator),
                Arc::clone(&catalog),
                adapters.clone(),
            ),
        );
        let offer_sync = Arc::new(OfferSync::new(Arc::clone(&kernel)));

        Ok(Self {
            store,
            cache,
            kernel,
            wallet,
            index,
            catalog,
            adapters,
            orchestrator,
            poll,
            dispatcher,
            reaper,
            offer_sync,
            health: Arc::new(HealthBoard::new()),
        })
    }
}
