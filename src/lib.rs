//! Mail PDF Relay — watches a mailbox for one sender, renders the linked page
//! to PDF, publishes it to a static site and announces it in a chat.

pub mod config;
pub mod error;
pub mod mail;
pub mod notify;
pub mod pipeline;
pub mod publish;
pub mod render;
