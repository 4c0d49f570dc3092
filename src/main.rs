use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;

use timetable_engine::config::EngineConfig;
use timetable_engine::hardware::HardwareProfile;
use timetable_engine::jobs::JobManager;
use timetable_engine::learning::store::{InMemoryPolicyStore, JsonPolicyStore, PolicyStore};
use timetable_engine::memory::MemoryMonitor;
use timetable_engine::provider::{DataProvider, StaticProvider};
use timetable_engine::{Result, server};

const CONFIG_ENV: &str = "TIMETABLE_CONFIG";

async fn start() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok())
        .map(PathBuf::from);
    let config = match config_path {
        Some(path) => EngineConfig::load(&path)?,
        None => EngineConfig::default(),
    };
    config.validate()?;

    let provider: Arc<dyn DataProvider> = match &config.server.data_file {
        Some(path) => Arc::new(StaticProvider::from_file(path.as_ref())?),
        None => {
            info!("No data file configured, starting with no organizations");
            Arc::new(StaticProvider::default())
        }
    };
    let store: Arc<dyn PolicyStore> = match &config.learning.store_dir {
        Some(dir) => Arc::new(JsonPolicyStore::open(dir)?),
        None => Arc::new(InMemoryPolicyStore::new()),
    };

    let profile = HardwareProfile::detect();
    let memory = MemoryMonitor::system(config.memory.clone());
    let sampler = memory.spawn()?;
    let jobs = JobManager::builder(profile, config.clone(), provider, store)
        .memory(Arc::clone(&memory))
        .on_emergency(Box::new(|job_id| {
            error!("Emergency stop requested by job {job_id}, exiting");
            std::process::exit(2);
        }))
        .build()?;

    let served = server::run_server(&config.server, jobs).await;
    memory.shutdown();
    let _ = sampler.join();
    served
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = start().await {
        error!("{e}");
        std::process::exit(1);
    }
}
