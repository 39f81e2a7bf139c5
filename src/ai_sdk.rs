mod anthropic;
mod sse;

pub use anthropic::*;
pub use sse::SseDecoder;
