// Steerlink: remote steering controller over a WebRTC data channel

pub mod config;
pub mod debug;
pub mod input;
pub mod network;
