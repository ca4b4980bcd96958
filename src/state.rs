use std::sync::Arc;

use crate::core::config::{AppPaths, ConfigService, CoreConfig};
use crate::core::errors::CoreError;
use crate::llm::completion::CompletionClient;
use crate::llm::openai::OpenAiProvider;
use crate::llm::provider::ChatProvider;
use crate::notify::NotificationChannel;
use crate::orchestrator::TurnOrchestrator;
use crate::rag::backend::BackendRegistry;
use crate::rag::retriever::Retriever;
use crate::store::chunks::ChunkStore;
use crate::store::sessions::SessionStore;

/// Application state shared across the process: configuration, the two
/// durable stores (opened once for the process lifetime), and the turn
/// orchestrator wired on top of them.
pub struct AppState {
    pub paths: Arc<AppPaths>,
    pub config: CoreConfig,
    pub sessions: Arc<SessionStore>,
    pub chunks: Arc<ChunkStore>,
    pub registry: Arc<BackendRegistry>,
    pub notify: Arc<NotificationChannel>,
    pub orchestrator: Arc<TurnOrchestrator>,
}

impl AppState {
    pub async fn initialize() -> Result<Arc<Self>, CoreError> {
        let paths = Arc::new(AppPaths::new());
        let config = ConfigService::new(paths.clone()).load()?;

        let sessions = Arc::new(SessionStore::new(&paths).await?);
        let chunks = Arc::new(ChunkStore::new(&paths).await?);

        let provider: Arc<dyn ChatProvider> = Arc::new(OpenAiProvider::new(&config.api));
        let registry = Arc::new(BackendRegistry::from_config(&config.backends, chunks.clone()));
        let retriever = Arc::new(Retriever::new(provider.clone(), registry.clone(), &config));
        let completion = Arc::new(CompletionClient::new(provider.clone(), retriever, &config));
        let notify = Arc::new(NotificationChannel::new());

        let orchestrator = Arc::new(TurnOrchestrator::new(
            sessions.clone(),
            chunks.clone(),
            completion,
            registry.clone(),
            notify.clone(),
            &config,
        ));

        let health_provider = provider.clone();
        tokio::spawn(async move {
            match health_provider.health_check().await {
                Ok(true) => tracing::info!("completion endpoint reachable"),
                _ => tracing::warn!("completion endpoint unreachable, turns will fail until it is up"),
            }
        });

        Ok(Arc::new(AppState {
            paths,
            config,
            sessions,
            chunks,
            registry,
            notify,
            orchestrator,
        }))
    }
}
