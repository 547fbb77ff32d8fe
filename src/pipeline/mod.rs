//! Per-message processing after the watcher accepts a message.
//!
//! [`dispatch::DispatchPipeline`] is the watcher's [`MessageHandler`]:
//! 1. `Renderer::render()`: link → temporary PDF
//! 2. `Publisher::publish()`: copy into the site, update index, git push
//! 3. `Notifier::send_document()`: optional chat delivery
//!
//! [`MessageHandler`]: crate::mail::watcher::MessageHandler

pub mod dispatch;
