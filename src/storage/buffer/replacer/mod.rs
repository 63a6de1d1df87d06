mod lru;

pub use lru::LruReplacer;
