//! Server runtime configuration.

use super::http_layers::RequestsLoggingLevel;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub logging_level: RequestsLoggingLevel,
}
