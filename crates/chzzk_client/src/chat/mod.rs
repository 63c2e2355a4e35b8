#![forbid(unsafe_code)]

pub mod connection;
pub mod dispatcher;
pub(crate) mod keepalive;
pub(crate) mod poller;
pub mod session;


pub use connection::{BoxFuture, ChatWs, WsConnector, default_connector};
pub use dispatcher::{ChatHandler, EventCategory, EventDispatcher, HandlerId};
pub use keepalive::KEEPALIVE_PERIOD;
pub use poller::DEFAULT_POLL_INTERVAL;
pub use session::{ChatOptions, ChatSession, DEFAULT_RECENT_CHAT_COUNT, SessionPhase};
