pub mod engine;

pub use engine::CommandEngine;
