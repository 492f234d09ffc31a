// src/lib.rs - Serial G-code host: queue, flow control, toolpath
pub mod config;
pub mod gcode;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod transport;
pub mod web;
