pub mod activation;
pub mod connection;
pub mod engine;
pub mod events;
pub mod identifiers;
pub mod metrics;
pub mod normalize;
pub mod options;
pub mod report;
pub mod trace;
pub mod xmla;

#[cfg(test)]
mod testing;

pub use engine::{RunRequest, run};
pub use report::QueryRunResult;
pub use xmla::XmlaConnector;
