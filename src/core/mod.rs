pub mod compiler;
pub mod engine;
pub mod host;
pub mod render;
pub mod save;
pub mod scope;
pub mod script;
