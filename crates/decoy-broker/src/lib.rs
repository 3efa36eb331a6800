//! The live call broker.
//!
//! Owns everything between the two duplex streams of a call: session
//! formation and teardown, low-latency audio relay, streaming
//! transcription, and the analysis pipeline that turns scammer speech into
//! intelligence and operator coaching.
//!
//! # Architecture
//!
//! Each call is one actor task ([`session`]) with an inbox; the registry
//! ([`registry`]) maps call identifiers to session handles and never owns
//! session state. Legs talk to the session exclusively through the inbox,
//! and the session talks back through per-leg bounded egress queues
//! ([`egress`]). External capabilities are narrow injected traits
//! ([`collab`]); every call into them is raced against the session's
//! cancellation signal.

pub mod collab;
pub mod config;
pub mod dispatch;
pub mod egress;
pub mod error;
pub mod recording;
pub mod registry;
pub mod session;

pub use config::BrokerConfig;
pub use egress::{egress_queue, EgressError, EgressQueue, EgressReceiver};
pub use error::AttachError;
pub use registry::CallRegistry;
pub use session::{AttachOutcome, SessionHandle};
