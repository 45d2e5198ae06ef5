pub mod engine;
pub mod http;
pub mod router;
pub mod server;
pub mod subsystems;

pub use engine::Engine;
