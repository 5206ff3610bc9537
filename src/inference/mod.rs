pub mod device;
pub mod sentence_encoder;

pub use sentence_encoder::SentenceEmbedder;
