//! Wire types for the classifier service

pub mod reply;

pub use reply::{ClearReply, ErrorReply, PredictReply};
