//! The Property Exchange transaction engine (C6): request/response types in
//! [`request`], the reactor-task implementation in [`engine`].
mod engine;
mod header;
mod request;

pub use engine::{Engine, EngineStats};
pub use request::{
    BatchOptions, BatchSetItem, DeviceHandle, Notification, PeOperation, PeRequest, PeResponse,
    Subscription,
};
