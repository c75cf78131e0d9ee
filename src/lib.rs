//! Synchronized multi-camera capture and ChArUco calibration for rigs that
//! mix frame cameras with event cameras.

pub mod board;
pub mod calibration;
pub mod camera;
pub mod cancel;
pub mod config;
pub mod detection;
pub mod error;
pub mod events;
pub mod frame;
pub mod job;
pub mod render;
pub mod session;
pub mod validator;

#[cfg(test)]
mod sim;
