use nalgebra as na;
use teleop_controller::command_channel::{GainProfile, TaskPose};
use thiserror::Error;

pub mod grpc_client;
pub mod grpc_server;

pub mod teleop_service {
    tonic::include_proto!("teleop_service");
}

impl From<na::Vector3<f64>> for teleop_service::Vector {
    fn from(source: na::Vector3<f64>) -> Self {
        teleop_service::Vector {
            x: source.x,
            y: source.y,
            z: source.z,
        }
    }
}

impl From<teleop_service::Vector> for na::Vector3<f64> {
    fn from(vector: teleop_service::Vector) -> Self {
        na::Vector3::new(vector.x, vector.y, vector.z)
    }
}

impl From<TaskPose> for teleop_service::Pose {
    fn from(source: TaskPose) -> Self {
        teleop_service::Pose {
            position: Some(source.position.into()),
            orientation: Some(source.orientation.into()),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed message: {0}")]
pub struct MalformedMessage(pub &'static str);

impl TryFrom<teleop_service::Pose> for TaskPose {
    type Error = MalformedMessage;

    fn try_from(source: teleop_service::Pose) -> Result<Self, Self::Error> {
        let position = source
            .position
            .ok_or(MalformedMessage("pose without position"))?;
        let orientation = source
            .orientation
            .ok_or(MalformedMessage("pose without orientation"))?;
        Ok(TaskPose::new(position.into(), orientation.into()))
    }
}

impl From<GainProfile> for teleop_service::Gains {
    fn from(source: GainProfile) -> Self {
        teleop_service::Gains {
            stiffness: source.stiffness.iter().copied().collect(),
            damping: source.damping.iter().copied().collect(),
        }
    }
}

impl TryFrom<teleop_service::Gains> for GainProfile {
    type Error = MalformedMessage;

    fn try_from(source: teleop_service::Gains) -> Result<Self, Self::Error> {
        if source.stiffness.len() != 6 || source.damping.len() != 6 {
            return Err(MalformedMessage("gains need 6 stiffness and 6 damping values"));
        }
        Ok(GainProfile::new(
            na::Vector6::from_column_slice(&source.stiffness),
            na::Vector6::from_column_slice(&source.damping),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gains_keep_axis_order() {
        let gains = GainProfile::new(
            na::Vector6::new(1.0, 2.0, 3.0, 4.0, 5.0, 6.0),
            na::Vector6::new(7.0, 8.0, 9.0, 10.0, 11.0, 12.0),
        );
        let message: teleop_service::Gains = gains.into();
        assert_eq!(message.stiffness, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(GainProfile::try_from(message).unwrap(), gains);
    }

    #[test]
    fn short_gains_are_malformed() {
        let message = teleop_service::Gains {
            stiffness: vec![1.0; 3],
            damping: vec![1.0; 6],
        };
        assert!(GainProfile::try_from(message).is_err());
    }

    #[test]
    fn pose_without_orientation_is_malformed() {
        let message = teleop_service::Pose {
            position: Some(na::Vector3::new(0.1, 0.2, 0.3).into()),
            orientation: None,
        };
        assert!(TaskPose::try_from(message).is_err());
    }
}
