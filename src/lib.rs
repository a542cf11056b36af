//! # initsd
//! A minimal PID 1 for initramfs boots. It prepares the base filesystem,
//! loads kernel modules, optionally mounts a rootfs fetched over the network
//! and hands the system over to the first init candidate that starts.

#[cfg(test)]
#[macro_use]
extern crate quickcheck;

pub mod cmdline;
pub mod config;
pub mod logger;
pub mod loopdev;
pub mod modules;
pub mod netboot;
pub mod pipe;
pub mod process;
pub mod rootfs;
pub mod sequencer;
pub mod syscall;
