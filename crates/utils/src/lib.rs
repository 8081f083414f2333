pub mod channel_msg;
pub mod diff;
pub mod msg_store;
pub mod stream_lines;
pub mod text;
