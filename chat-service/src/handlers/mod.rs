//! HTTP handlers for the chat service.

pub mod health;
pub mod receive_data;
