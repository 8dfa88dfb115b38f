pub mod admin;
pub mod analysis;
pub mod candles;
pub mod config;
pub mod error;
pub mod indicator_cache;
pub mod indicators;
pub mod model;
pub mod quality;
pub mod report;
pub mod storage_utils;
pub mod timeframe;
pub mod training;
pub mod tui;
pub mod warehouse;
