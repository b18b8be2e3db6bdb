pub mod auth;
pub mod config;
pub mod service;

pub use auth::{AuthError, BearerAuth, EnvTokenProvider, TokenProvider};
pub use config::{Args, ListenAddr, RuntimeConfig, load_runtime_config};
pub use service::{RunnerServiceImpl, ServiceConfig};
