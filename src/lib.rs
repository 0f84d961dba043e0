//! nodelaunch
//!
//! Brings a freshly started compute instance from a bare OS image to a
//! running agent process over SSH, then hands the agent's stdio back as a
//! byte channel.

pub mod config;
pub mod launch;
pub mod progress;
pub mod provider;
pub mod ssh;

#[cfg(test)]
mod testing;
