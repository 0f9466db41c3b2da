pub mod chat;
pub mod embeddings;
pub mod images;
pub mod responses;
pub mod responses_stream;
