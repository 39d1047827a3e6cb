pub mod client_settings;

pub use client_settings::{ClientSettings, MAX_RECENT_SERVERS};
