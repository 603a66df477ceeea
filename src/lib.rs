//! Plex Smart Refresher
//!
//! Finds recently added library items with incomplete metadata and asks the
//! media server to re-fetch it, on demand or once a day.

pub mod app;
pub mod cli;
pub mod config;
pub mod db;
pub mod jobs;
pub mod services;
