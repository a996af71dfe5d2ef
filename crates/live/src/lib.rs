//! Session-scoped incremental parse pipeline.
//!
//! ```text
//! connection ──frame──> gateway ──mutation──> SessionStore
//!                          │                       │
//!                          └──> Coordinator ──debounce──> ParserCache ──> WorkerPool
//!                                    │                                        │
//!                                    └────── broadcast to subscribers <───────┘
//! ```

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod gateway;
pub mod model;
pub mod protocol;
pub mod session;
pub mod worker;

pub use cache::{CacheStats, ParserCache};
pub use config::LiveConfig;
pub use coordinator::{Coordinator, ForceParseOutcome, SlotState};
pub use engine::{CompiledGrammar, GrammarEngine, LarkEngine};
pub use error::{LiveError, LiveResult};
pub use gateway::Connection;
pub use model::{
    AstNode, ErrorDetail, ErrorType, ParseResult, ParseSettings, ParseStatus, SessionInfo, SettingsPatch,
    ValidationResult,
};
pub use protocol::{ClientEvent, ClientMessage, InboundError, ServerBody, ServerMessage};
pub use session::{ConnectionHandle, ConnectionId, ReapReport, SessionContent, SessionStats, SessionStore};
