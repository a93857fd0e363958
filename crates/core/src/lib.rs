pub mod normalizer;
pub mod signature;
pub mod types;
