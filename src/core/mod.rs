pub mod chat_stream;
pub mod constants;
pub mod conversation;
pub mod debounce;
pub mod message;
pub mod persistence;
pub mod session;
pub mod title;
