pub mod admin;
pub mod app;
pub mod config;
pub mod document;
pub mod errors;
pub mod handlers;
pub mod memory;
pub mod models;
pub mod registry;
pub mod session;
pub mod state;
pub mod stats;
pub mod storage;

pub use app::router;
pub use config::{Config, SessionConfig};
pub use document::DocumentStore;
pub use memory::MemoryDocumentStore;
pub use session::{ChangeEvent, Session, Slice};
pub use state::AppState;
pub use storage::FileDocumentStore;
