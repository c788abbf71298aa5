// Module layout (Clean Architecture style)
// - bootstrap: configuration and engine wiring
// - domain: keys, origins, error taxonomy
// - application: ports and access policy
// - infrastructure: CRDT/object-store/realtime adapters
// - presentation: HTTP and WebSocket endpoints
// - agent: the in-container workspace agent

pub mod agent;
pub mod application;
pub mod bootstrap;
pub mod domain;
pub mod infrastructure;
pub mod presentation;
