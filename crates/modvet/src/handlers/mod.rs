//! Renderers for the handler protocol.

pub mod json;
pub mod text;

pub use json::JsonHandler;
pub use text::TextHandler;
