//! HTTP admin surface for the kitsu coordination layer.

pub mod app;
