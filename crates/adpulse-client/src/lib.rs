pub mod classifier;
pub mod fetcher;

pub use classifier::StatusClassifier;
pub use fetcher::ReqwestFetcher;
