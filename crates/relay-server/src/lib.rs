//! Real-time relay between a browser-automation agent and a chat client.

pub mod avatar;
pub mod broadcaster;
pub mod connection;
pub mod handlers;
pub mod history;
pub mod registry;
pub mod server;
pub mod session;
pub mod settings;

pub use avatar::AvatarBroker;
pub use broadcaster::Broadcaster;
pub use handlers::HandlerState;
pub use registry::SessionRegistry;
pub use server::{start, AppState, ServerConfig, ServerHandle, Services};
pub use session::{AgentSession, SessionTimeouts};
pub use settings::{load_settings, EngineKind, RelaySettings};
