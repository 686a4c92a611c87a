// Re-export needed modules for testing
pub mod config;
pub mod credentials;
pub mod messaging; // Queueing, reconnects and delivery tracking
pub mod models;
pub mod stomp; // STOMP-over-WebSocket client

// Re-export main types for convenience
pub use config::ClientConfig;
pub use credentials::{CredentialProvider, SessionCredentials};
pub use messaging::MessagingService;
pub use models::*;
pub use stomp::{ClientError, StompClient};
