//! Palaver is a terminal-first chat client for OpenAI-compatible LLM APIs
//! with persistent local chat history.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns the session store (chat history, active buffer,
//!   persistence, eviction), the streaming turn state machine, title
//!   synthesis, and the chat-stream service that parses streamed events.
//! - [`api`] defines the chat/model wire payloads and the completion client
//!   used for non-streaming requests and model listing.
//! - [`ui`] renders the terminal interface and runs the interactive event
//!   loop that drives user input, streaming updates, and display refresh.
//!
//! The runtime entrypoint lives in the binary crate (`src/main.rs`), which
//! parses arguments and dispatches into [`ui::chat_loop`].

pub mod api;
pub mod core;
pub mod ui;
pub mod utils;
