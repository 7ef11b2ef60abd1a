pub mod cache;
pub mod rule;

pub use cache::FrontierCache;
pub use rule::is_genuine_extremity;
