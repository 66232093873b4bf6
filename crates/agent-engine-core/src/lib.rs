//! Core abstractions for agent engine session clients.
//!
//! This crate provides the fundamental building blocks:
//! - `Session`, `Turn`, `ControllerState` - Local session model
//! - `Fragment` - Decoded unit of a streamed reply
//! - `Aggregator` - Reduces fragments into reply text
//! - `SessionFeed` - Broadcast + history presenter
//! - `UserId` - Per-client identity
//! - Remote agent, storage and presenter traits

pub mod aggregate;
pub mod feed;
pub mod fragment;
pub mod identity;
pub mod session;
pub mod traits;

pub use aggregate::{AggregatedResponse, Aggregator, StreamError, aggregate};
pub use feed::{FeedEvent, SessionFeed};
pub use fragment::{ContentPart, Fragment};
pub use identity::UserId;
pub use session::{ControllerState, Role, Session, SessionSnapshot, Turn};
pub use traits::{
    FragmentStream, NullPresenter, Presenter, RemoteAgent, RemoteError, SessionStore, StoreError,
};
