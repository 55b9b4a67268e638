pub mod config;
pub mod logging;
pub mod matching;
pub mod queue;
pub mod relay;
pub mod replay;
