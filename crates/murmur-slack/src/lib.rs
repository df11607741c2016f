//! Slack surface for Murmur: webhook signature verification, Web API
//! client, and reply delivery with bounded retry.

mod api_client;
mod responder;
mod signature;

pub use api_client::{SlackApiClient, SlackPostedMessage};
pub use responder::{Responder, ResponderConfig};
pub use signature::{verify_signature, SIGNATURE_MAX_AGE_SECONDS};
