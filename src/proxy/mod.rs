// proxy 模块 - 对话反代服务
pub mod api_client;
pub mod chat_service;
pub mod client;
pub mod config;
pub mod converter;
pub mod error;
pub mod error_mapper;
pub mod message_store;
pub mod middleware;
pub mod model_limits;
pub mod server;
pub mod store_janitor;
pub mod transport;

pub use api_client::ChatWebClient;
pub use chat_service::ChatService;
pub use client::ChatApi;
pub use config::{ApiModel, ProxyConfig};
pub use error::ChatError;
pub use message_store::MessageStore;
pub use server::AxumServer;
pub use transport::ProxyAgent;
