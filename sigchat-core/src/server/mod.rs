//! Delivery Transport, server side
//!
//! ```text
//!   WebSocket ──► listener (one reader loop per socket)
//!                    │
//!                    ▼
//!              DeliveryService ──► ConnectionRegistry (who is online)
//!                    │
//!                    ├──► IdentityDirectory (username -> user id)
//!                    └──► MessageStore (PENDING / DELIVERED / READ)
//! ```

pub mod api;
pub mod delivery;
pub mod error;
pub mod listener;
pub mod registry;

pub use delivery::{DeliveryService, Session};
pub use error::{DeliveryError, ServerError};
pub use listener::{build_router, AppState, SigchatServer};
pub use registry::{ConnId, ConnectionHandle, ConnectionRegistry};
