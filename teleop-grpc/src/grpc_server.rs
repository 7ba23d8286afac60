use crate::teleop_service;
pub use crate::teleop_service::robot_control_server::{RobotControl, RobotControlServer};
use nalgebra as na;
use std::{sync::Arc, time::Duration};
use teleop_controller::command_channel::{GainProfile, TaskPose};
use tokio::sync::Mutex;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

const JOINT_COUNT: usize = 7;
const MAX_GRIPPER_WIDTH: f64 = 0.1;

/// In memory stand in for the robot side impedance controller
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedRobot {
    pub pose: TaskPose,
    pub joint_positions: Vec<f64>,
    pub joint_velocities: Vec<f64>,
    pub gripper_width: f64,
    pub policy: Option<GainProfile>,
}

impl Default for SimulatedRobot {
    fn default() -> Self {
        SimulatedRobot {
            pose: TaskPose::new(
                na::Vector3::new(0.31, 0.0, 0.49),
                na::Vector3::new(std::f64::consts::PI, 0.0, 0.0),
            ),
            joint_positions: vec![0.0, -0.78, 0.0, -2.36, 0.0, 1.57, 0.78],
            joint_velocities: vec![0.0; JOINT_COUNT],
            gripper_width: 0.085,
            policy: None,
        }
    }
}

pub type SharedRobot = Arc<Mutex<SimulatedRobot>>;

pub struct RobotControlHandler {
    robot: SharedRobot,
}

impl RobotControlHandler {
    pub fn new(robot: SharedRobot) -> Self {
        RobotControlHandler { robot }
    }

    pub fn robot(&self) -> SharedRobot {
        Arc::clone(&self.robot)
    }
}

fn all_finite(values: &[f64]) -> bool {
    values.iter().all(|value| value.is_finite())
}

#[tonic::async_trait]
impl RobotControl for RobotControlHandler {
    async fn read_pose(
        &self,
        _: Request<teleop_service::Empty>,
    ) -> Result<Response<teleop_service::Pose>, Status> {
        let robot = self.robot.lock().await;
        Ok(Response::new(robot.pose.into()))
    }

    async fn read_joint_positions(
        &self,
        _: Request<teleop_service::Empty>,
    ) -> Result<Response<teleop_service::JointVector>, Status> {
        let robot = self.robot.lock().await;
        Ok(Response::new(teleop_service::JointVector {
            values: robot.joint_positions.clone(),
        }))
    }

    async fn read_joint_velocities(
        &self,
        _: Request<teleop_service::Empty>,
    ) -> Result<Response<teleop_service::JointVector>, Status> {
        let robot = self.robot.lock().await;
        Ok(Response::new(teleop_service::JointVector {
            values: robot.joint_velocities.clone(),
        }))
    }

    async fn move_to_joint_positions(
        &self,
        request: Request<teleop_service::JointMove>,
    ) -> Result<Response<teleop_service::Empty>, Status> {
        let inner = request.into_inner();
        if inner.positions.len() != JOINT_COUNT || !all_finite(&inner.positions) {
            return Err(Status::invalid_argument(format!(
                "expected {} finite joint positions",
                JOINT_COUNT
            )));
        }
        if !(inner.duration_secs.is_finite() && inner.duration_secs >= 0.0) {
            return Err(Status::invalid_argument("invalid duration"));
        }
        {
            // joint moves replace whatever policy was running
            let mut robot = self.robot.lock().await;
            robot.policy = None;
        }
        tokio::time::sleep(Duration::from_secs_f64(inner.duration_secs)).await;
        let mut robot = self.robot.lock().await;
        robot.joint_positions = inner.positions;
        info!("Moved to joint positions {:?}", robot.joint_positions);
        Ok(Response::new(teleop_service::Empty {}))
    }

    async fn start_impedance(
        &self,
        request: Request<teleop_service::Gains>,
    ) -> Result<Response<teleop_service::Empty>, Status> {
        let gains = GainProfile::try_from(request.into_inner())
            .map_err(|error| Status::invalid_argument(error.to_string()))?;
        let valid = gains
            .stiffness
            .iter()
            .chain(gains.damping.iter())
            .all(|gain| gain.is_finite() && *gain >= 0.0);
        if !valid {
            return Err(Status::invalid_argument("gains must be finite and non negative"));
        }
        let mut robot = self.robot.lock().await;
        robot.policy = Some(gains);
        info!("Started impedance control with stiffness {:?}", gains.stiffness.as_slice());
        Ok(Response::new(teleop_service::Empty {}))
    }

    async fn update_target_pose(
        &self,
        request: Request<teleop_service::Pose>,
    ) -> Result<Response<teleop_service::Empty>, Status> {
        let target = TaskPose::try_from(request.into_inner())
            .map_err(|error| Status::invalid_argument(error.to_string()))?;
        if !all_finite(&target.to_array()) {
            return Err(Status::invalid_argument("target pose must be finite"));
        }
        let mut robot = self.robot.lock().await;
        if robot.policy.is_none() {
            return Err(Status::failed_precondition("no impedance policy running"));
        }
        robot.pose = target;
        debug!("Target pose {:?}", target.to_array());
        Ok(Response::new(teleop_service::Empty {}))
    }

    async fn terminate_policy(
        &self,
        _: Request<teleop_service::Empty>,
    ) -> Result<Response<teleop_service::Empty>, Status> {
        let mut robot = self.robot.lock().await;
        if robot.policy.take().is_some() {
            info!("Policy terminated");
        }
        Ok(Response::new(teleop_service::Empty {}))
    }

    async fn read_gripper_width(
        &self,
        _: Request<teleop_service::Empty>,
    ) -> Result<Response<teleop_service::GripperWidth>, Status> {
        let robot = self.robot.lock().await;
        Ok(Response::new(teleop_service::GripperWidth {
            width: robot.gripper_width,
        }))
    }

    async fn set_gripper_width(
        &self,
        request: Request<teleop_service::GripperWidth>,
    ) -> Result<Response<teleop_service::Empty>, Status> {
        let width = request.into_inner().width;
        if !(width.is_finite() && (0.0..=MAX_GRIPPER_WIDTH).contains(&width)) {
            return Err(Status::invalid_argument(format!(
                "gripper width must be within 0 and {}",
                MAX_GRIPPER_WIDTH
            )));
        }
        let mut robot = self.robot.lock().await;
        robot.gripper_width = width;
        Ok(Response::new(teleop_service::Empty {}))
    }
}
