use chaingov_products::ProductError;
use chaingov_sources::ClientError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Client {client} failed: {source}")]
    Client {
        client: String,
        #[source]
        source: ClientError,
    },

    #[error("{product} failed on stream {stream}: {source}")]
    Product {
        stream: String,
        product: &'static str,
        #[source]
        source: ProductError,
    },

    #[error("Cannot plan {stream} on {client}: {source}")]
    Plan {
        stream: String,
        client: String,
        #[source]
        source: ClientError,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Feed task panicked: {0}")]
    Task(String),
}
