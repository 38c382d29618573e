pub mod dispatch;
mod error;
pub mod feed;
pub mod gesture;
pub mod paths;
pub mod scan;
pub mod settings;
pub mod tikhub;
pub mod transfer;

pub use error::{EngineError, Result};
