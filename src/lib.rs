pub mod channel;
pub mod config;
pub mod cookies;
pub mod error;
pub mod export;
pub mod input;
pub mod ledger;
pub mod orchestrator;
pub mod pipelines;
pub mod progress;
pub mod retry;
pub mod session;
pub mod sources;
pub mod thumbnail;
pub mod transcript;
pub mod video;
pub mod youtube;
pub mod ytdlp;
