//! Conversion between canonical types and provider wire formats
//!
//! Requests go out in the provider's format; stream events come back as
//! [`StreamResult`](crate::types::StreamResult)s.

pub mod anthropic;
pub mod google;
pub mod openai;
