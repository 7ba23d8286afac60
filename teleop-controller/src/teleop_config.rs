use crate::command_channel::{ConnectionSettings, GainProfile};
use nalgebra::Vector6;
use serde::{Deserialize, Serialize};
use std::{fs, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("error while accessing configuration")]
    IoError(#[from] std::io::Error),
    #[error("error while parsing json")]
    JsonError(#[from] serde_json::Error),
    #[error("error while parsing yaml")]
    YamlError(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    pub connect_timeout_secs: f64,
    pub liveness_timeout_secs: f64,
    pub max_retries: u32,
    pub retry_backoff_secs: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ControlConfig {
    pub frequency_hz: f64,
    pub position_scale: f64,
    /// Device is held facing the robot and needs the 180° yaw correction
    pub in_front_of_robot: bool,
    pub input_poll_interval_secs: f64,
    pub input_poll_max_interval_secs: f64,
    pub status_interval_secs: f64,
}

/// Task space workspace limits in meters
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct SafetyBounds {
    pub min_z: f64,
    pub max_z: f64,
    pub min_y: f64,
    pub max_y: f64,
    /// x is not teleoperated, it's pinned to this value
    pub fixed_x: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GainsConfig {
    /// x, y, z, rx, ry, rz
    pub base_stiffness: Vector6<f64>,
    /// x, y, z, rx, ry, rz
    pub base_damping: Vector6<f64>,
    pub stiffness_scale: f64,
    pub damping_scale: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TriggerConfig {
    pub endpoint: String,
    pub timeout_secs: f64,
    pub cooldown_secs: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InputConfig {
    pub listen_address: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GripperConfig {
    pub follow_toggle: bool,
    pub open_width: f64,
    pub close_width: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TeleopConfig {
    pub server: ServerConfig,
    pub control: ControlConfig,
    pub bounds: SafetyBounds,
    pub gains: GainsConfig,
    pub trigger: TriggerConfig,
    pub input: InputConfig,
    pub gripper: GripperConfig,
}

lazy_static::lazy_static! {
    static ref INCLUDED: TeleopConfig = {
        let yaml = include_str!("../config/teleop.yaml");
        TeleopConfig::parse_yaml(yaml).expect("included config is valid")
    };
}

impl TeleopConfig {
    /// Teleop comes with an included config file.
    ///
    /// This file is packaged with the binary
    /// This method retrieves this included version
    pub fn included() -> TeleopConfig {
        INCLUDED.clone()
    }

    pub fn parse_json(text: &str) -> Result<TeleopConfig> {
        let config: TeleopConfig = serde_json::from_str(text)?;
        Ok(config)
    }

    pub fn parse_yaml(text: &str) -> Result<TeleopConfig> {
        let config: TeleopConfig = serde_yaml::from_str(text)?;
        Ok(config)
    }

    pub fn serialize_to_yaml(&self) -> Result<String> {
        let yaml = serde_yaml::to_string(self)?;
        Ok(yaml)
    }

    pub fn save_yaml(&self, path: &str) -> Result<()> {
        fs::write(path, self.serialize_to_yaml()?)?;
        Ok(())
    }

    pub fn load_json(path: &str) -> Result<TeleopConfig> {
        let text = fs::read_to_string(path)?;
        let config = TeleopConfig::parse_json(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_yaml(path: &str) -> Result<TeleopConfig> {
        let text = fs::read_to_string(path)?;
        let config = TeleopConfig::parse_yaml(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        fn check(condition: bool, message: &str) -> Result<()> {
            if condition {
                Ok(())
            } else {
                Err(ConfigError::Invalid(message.to_owned()))
            }
        }
        let bounds = &self.bounds;
        check(
            [
                bounds.min_z,
                bounds.max_z,
                bounds.min_y,
                bounds.max_y,
                bounds.fixed_x,
            ]
            .iter()
            .all(|value| value.is_finite()),
            "workspace bounds must be finite",
        )?;
        check(bounds.min_z <= bounds.max_z, "min_z is above max_z")?;
        check(bounds.min_y <= bounds.max_y, "min_y is above max_y")?;
        check(
            self.control.frequency_hz.is_finite() && self.control.frequency_hz > 0.0,
            "control frequency must be positive",
        )?;
        check(
            self.control.position_scale.is_finite() && self.control.position_scale > 0.0,
            "position scale must be positive",
        )?;
        for (name, secs) in [
            ("connect_timeout_secs", self.server.connect_timeout_secs),
            ("liveness_timeout_secs", self.server.liveness_timeout_secs),
            ("retry_backoff_secs", self.server.retry_backoff_secs),
            ("input_poll_interval_secs", self.control.input_poll_interval_secs),
            (
                "input_poll_max_interval_secs",
                self.control.input_poll_max_interval_secs,
            ),
            ("status_interval_secs", self.control.status_interval_secs),
            ("timeout_secs", self.trigger.timeout_secs),
            ("cooldown_secs", self.trigger.cooldown_secs),
        ] {
            if Duration::try_from_secs_f64(secs).is_err() {
                return Err(ConfigError::Invalid(format!(
                    "{} must be a non negative number of seconds",
                    name
                )));
            }
        }
        check(
            Duration::try_from_secs_f64(1.0 / self.control.frequency_hz)
                .map_or(false, |period| !period.is_zero()),
            "control period is out of range",
        )?;
        check(
            self.control.input_poll_interval_secs > 0.0,
            "input poll interval must be positive",
        )?;
        check(
            self.control.input_poll_max_interval_secs >= self.control.input_poll_interval_secs,
            "input poll max interval is below the poll interval",
        )?;
        check(
            self.server.connect_timeout_secs > 0.0,
            "connect timeout must be positive",
        )?;
        check(
            self.server.liveness_timeout_secs > 0.0,
            "liveness timeout must be positive",
        )?;
        Ok(())
    }

    pub fn gain_profile(&self) -> GainProfile {
        GainProfile::new(
            self.gains.base_stiffness * self.gains.stiffness_scale,
            self.gains.base_damping * self.gains.damping_scale,
        )
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            endpoint: format!("http://{}:{}", self.server.address, self.server.port),
            connect_timeout: Duration::from_secs_f64(self.server.connect_timeout_secs),
            liveness_timeout: Duration::from_secs_f64(self.server.liveness_timeout_secs),
            max_retries: self.server.max_retries,
            retry_backoff: Duration::from_secs_f64(self.server.retry_backoff_secs),
        }
    }

    pub fn control_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.control.frequency_hz)
    }

    pub fn input_poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.control.input_poll_interval_secs)
    }

    pub fn input_poll_max_interval(&self) -> Duration {
        Duration::from_secs_f64(self.control.input_poll_max_interval_secs)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs_f64(self.control.status_interval_secs)
    }

    pub fn trigger_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.trigger.timeout_secs)
    }

    pub fn button_cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.trigger.cooldown_secs)
    }
}
