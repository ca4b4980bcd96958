pub mod paths;
pub mod service;

pub use paths::AppPaths;
pub use service::{
    ApiConfig, ConfigService, CoreConfig, EmptyBackendPolicy, IngestionConfig, RetrievalConfig,
};
