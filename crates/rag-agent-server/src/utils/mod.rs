pub mod error;
pub mod limiters;
pub mod lru;
pub mod similarity;
pub mod token_estimator;
