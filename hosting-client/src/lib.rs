pub mod cache;
pub mod client;
pub mod model;

pub use client::HostingClient;
