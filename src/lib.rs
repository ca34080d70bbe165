mod bin;
mod common;
pub mod interpreter;

pub use bin::tracedig_main_async;
