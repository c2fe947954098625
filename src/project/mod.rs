//! Project sessions: chat fan-out, per-project orchestration and the
//! registry of live projects
//!
//! ```text
//! SessionRegistry ──get_or_create──► ProjectManager ──► SandboxSupervisor (per service)
//!        │                                 │
//!   sweep(timeout)                          └──► ChatSession (per chat)
//!        │                                          ├─ Broadcaster ─► Listener*
//!        └─ is_inactive? ─► kill()                  ├─ Agent
//!                                                   └─ turn lock
//! ```

pub mod broadcast;
pub mod manager;
pub mod registry;

pub use broadcast::{
    Broadcaster, ChannelListener, ChatChunk, ChatUpdate, Event, Listener, ListenerClosed,
    ListenerId, Payload, ProjectStatus,
};
pub use manager::{ManagerConfig, ProjectManager, TurnError};
pub use registry::SessionRegistry;
