mod router;
mod store;

pub use router::{ConnectionHandle, ConnectionId, Role, RoomRouter};
pub use store::{DocumentStore, StoreConfig, UpdateRecord};
