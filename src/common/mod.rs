mod stopwatch;

pub use stopwatch::Stopwatch;
