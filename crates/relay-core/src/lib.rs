pub mod engine;
pub mod errors;
pub mod ids;
pub mod persistence;
pub mod protocol;

pub use errors::EngineError;
