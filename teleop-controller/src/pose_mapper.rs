use crate::command_channel::{TargetPose, TaskPose};
use crate::teleop_config::SafetyBounds;
use nalgebra as na;
use std::f64::consts::PI;

/// Angles this close to a half turn use the canonical axis sign
const HALF_TURN_TOLERANCE: f64 = 1e-9;

/// Controller pose as reported by the motion capture source
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DevicePose {
    pub position: na::Vector3<f64>,
    pub rotation: na::Rotation3<f64>,
}

impl DevicePose {
    pub fn new(position: na::Vector3<f64>, rotation: na::Rotation3<f64>) -> DevicePose {
        DevicePose { position, rotation }
    }

    /// Conjugate with a half turn about z
    ///
    /// Used when the device is held facing the robot
    pub fn facing_robot(&self) -> DevicePose {
        let front_fix = na::Rotation3::from_axis_angle(&na::Vector3::z_axis(), PI);
        DevicePose {
            position: front_fix * self.position,
            rotation: front_fix * self.rotation * front_fix,
        }
    }
}

/// Robot pose captured when the session starts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionAnchor {
    pub position: na::Vector3<f64>,
    pub rotation: na::Rotation3<f64>,
}

impl SessionAnchor {
    pub fn from_task_pose(pose: &TaskPose) -> SessionAnchor {
        SessionAnchor {
            position: pose.position,
            rotation: na::Rotation3::new(pose.orientation),
        }
    }
}

/// Maps device motion onto the robot workspace
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseMapper {
    bounds: SafetyBounds,
    position_scale: f64,
    in_front_of_robot: bool,
}

impl PoseMapper {
    pub fn new(bounds: SafetyBounds, position_scale: f64, in_front_of_robot: bool) -> PoseMapper {
        PoseMapper {
            bounds,
            position_scale,
            in_front_of_robot,
        }
    }

    pub fn bounds(&self) -> &SafetyBounds {
        &self.bounds
    }

    pub fn map(&self, device: &DevicePose, anchor: &SessionAnchor) -> TargetPose {
        let device = if self.in_front_of_robot {
            device.facing_robot()
        } else {
            *device
        };

        let mut position = anchor.position + device.position * self.position_scale;
        position.z = position.z.max(self.bounds.min_z).min(self.bounds.max_z);
        position.y = position.y.max(self.bounds.min_y).min(self.bounds.max_y);
        // x is not teleoperated
        position.x = self.bounds.fixed_x;

        let rotation = device.rotation * anchor.rotation;
        TargetPose::new(position, rotation_vector(&rotation))
    }
}

/// Rotation vector (axis * angle) of a rotation, angle in [0, π]
///
/// At exactly a half turn both axis signs describe the same rotation.
/// The one whose first non zero component is positive is returned.
pub fn rotation_vector(rotation: &na::Rotation3<f64>) -> na::Vector3<f64> {
    let quaternion = na::UnitQuaternion::from_rotation_matrix(rotation);
    match quaternion.axis_angle() {
        Some((axis, angle)) => {
            let mut axis = axis.into_inner();
            if (PI - angle).abs() < HALF_TURN_TOLERANCE && !is_canonical(&axis) {
                axis = -axis;
            }
            axis * angle
        }
        None => na::Vector3::zeros(),
    }
}

fn is_canonical(axis: &na::Vector3<f64>) -> bool {
    axis.iter()
        .find(|component| component.abs() > HALF_TURN_TOLERANCE)
        .map_or(true, |component| *component > 0.0)
}
