//! Mailbox side: session, watcher, parsing and link extraction.

pub mod link;
pub mod message;
pub mod session;
pub mod watcher;

pub use link::{LinkOptions, extract_all_links, extract_link};
pub use message::{DeliveryMetadata, ParsedMessage, is_from_target_sender, parse_message};
pub use session::{ImapConnector, MailboxConnector, MailboxSession};
pub use watcher::{
    AcceptedMessage, CycleOutcome, MailboxWatcher, MessageHandler, WatcherConfig, WatcherHandle,
    WatcherState,
};
