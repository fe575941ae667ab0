//! HTTP API Module
//!
//! Provides a local REST API for collective administration.

mod http;

pub use http::{ErrorResponse, HttpServer, InviteRequest, InviteResponse, JoinRequest, MessageResponse};
