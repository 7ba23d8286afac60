//! Real time teleoperation of an impedance controlled arm from a handheld AR controller

pub mod command_channel;
pub mod control_loop;
pub mod debouncer;
pub mod input_source;
pub mod pose_mapper;
pub mod teleop_config;
pub mod trigger_notifier;
