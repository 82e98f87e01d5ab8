use thiserror::Error;

use crate::fsm::State;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid message format: {message}")]
    InvalidMessage { message: String },

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("timeout: {message}")]
    Timeout { message: String },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: State, to: State },

    /// Transient: the source had nothing to deliver. The replicator loop
    /// backs off and polls again; this is never counted as an error.
    #[error("no events found")]
    NoEventsFound,
}

pub type Result<T> = std::result::Result<T, Error>;
