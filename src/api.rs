// =============================================================================
// HTTP/WS surface (§6) — thin transport layer over `AppState`'s components.
// =============================================================================

pub mod auth;
pub mod rest;
pub mod ws;
