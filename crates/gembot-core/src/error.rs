use thiserror::Error;

#[derive(Debug, Error)]
pub enum BotError {
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}
