use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use fars::{
    cache::Manager,
    cli::LogFormat,
    locker::KeyedLocker,
    processor::Processor,
    resolver::PathResolver,
    server::AppContext,
    settings::{HumanDuration, Settings},
};

use super::net::{find_free_port, wait_for_listener};

pub struct TestServer {
    pub addr: SocketAddr,
    pub base_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub app: AppContext,
    _workspace: TempDir,
    task: JoinHandle<Result<()>>,
}

impl TestServer {
    pub async fn spawn() -> Result<Self> {
        Self::spawn_with(|_| {}).await
    }

    pub async fn spawn_with(configure: impl FnOnce(&mut Settings)) -> Result<Self> {
        let workspace = TempDir::new()?;
        let base_dir = workspace.path().join("base");
        let cache_dir = workspace.path().join("cache");
        std::fs::create_dir_all(&base_dir)?;
        std::fs::create_dir_all(&cache_dir)?;

        let port = find_free_port().await?;
        let mut settings = Settings {
            server: Default::default(),
            storage: Default::default(),
            resize: Default::default(),
            cache: Default::default(),
            rewrites: Vec::new(),
            log: LogFormat::Text,
            metrics_listen: None,
        };
        settings.server.host = "127.0.0.1".to_string();
        settings.server.port = port;
        settings.storage.base_dir = base_dir.display().to_string();
        settings.storage.cache_dir = cache_dir.display().to_string();
        // Sweeper stays off unless a test opts in.
        settings.cache.cleanup_interval = HumanDuration(Duration::ZERO);
        configure(&mut settings);

        let settings = Arc::new(settings);
        let resolver = Arc::new(PathResolver::new(&settings)?);
        let cache = Arc::new(Manager::new(&settings));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        cache.clone().start_sweeper(shutdown_rx);

        let app = AppContext {
            settings: settings.clone(),
            resolver,
            cache,
            locks: Arc::new(KeyedLocker::new()),
            processor: Arc::new(Processor::new()),
        };

        let addr: SocketAddr = format!("127.0.0.1:{port}").parse()?;
        let task = tokio::spawn(fars::server::run(app.clone(), shutdown_tx));
        wait_for_listener(addr).await?;

        Ok(Self {
            addr,
            base_dir,
            cache_dir,
            app,
            _workspace: workspace,
            task,
        })
    }

    pub fn write_original(&self, relative: &str, payload: &[u8]) -> Result<PathBuf> {
        let path = self.base_dir.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, payload)?;
        Ok(path)
    }

    pub fn cache_file(&self, geometry: &str, relative: &str) -> PathBuf {
        self.cache_dir.join(geometry).join(relative)
    }

    pub fn encode_count(&self) -> u64 {
        self.app.processor.encode_count()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
