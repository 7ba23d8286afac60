use crate::teleop_service::{self, robot_control_client::RobotControlClient};
use async_trait::async_trait;
use std::time::Duration;
use teleop_controller::command_channel::{
    CommandError, CommandReply, ConnectionSettings, RobotCommand, RobotConnector, RobotSession,
    TaskPose,
};
use tonic::{
    transport::{Channel, Endpoint},
    Code, Request, Status,
};
use tracing::debug;

/// Transport faults are retried by the command channel, everything else is a rejection
pub fn status_to_error(status: Status) -> CommandError {
    match status.code() {
        Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled | Code::Aborted | Code::Unknown => {
            CommandError::Connection(format!("{:?}: {}", status.code(), status.message()))
        }
        _ => CommandError::RemoteRejection(format!("{:?}: {}", status.code(), status.message())),
    }
}

fn malformed(error: crate::MalformedMessage) -> CommandError {
    CommandError::RemoteRejection(error.to_string())
}

/// Opens gRPC sessions with a robot control service
#[derive(Debug, Default, Clone, Copy)]
pub struct GrpcConnector;

#[async_trait]
impl RobotConnector for GrpcConnector {
    async fn connect(
        &self,
        settings: &ConnectionSettings,
    ) -> Result<Box<dyn RobotSession>, CommandError> {
        let endpoint = Endpoint::from_shared(settings.endpoint.clone())
            .map_err(|error| {
                CommandError::Connection(format!("invalid endpoint {}: {}", settings.endpoint, error))
            })?
            .connect_timeout(settings.connect_timeout)
            .http2_keep_alive_interval(settings.liveness_timeout / 2)
            .keep_alive_timeout(settings.liveness_timeout)
            .keep_alive_while_idle(true);
        let channel = endpoint
            .connect()
            .await
            .map_err(|error| CommandError::Connection(format!("{}: {}", settings.endpoint, error)))?;
        debug!("gRPC channel open to {}", settings.endpoint);
        Ok(Box::new(GrpcSession {
            client: RobotControlClient::new(channel),
            liveness_timeout: settings.liveness_timeout,
        }))
    }
}

pub struct GrpcSession {
    client: RobotControlClient<Channel>,
    liveness_timeout: Duration,
}

fn with_deadline<T>(message: T, deadline: Duration) -> Request<T> {
    let mut request = Request::new(message);
    request.set_timeout(deadline);
    request
}

#[async_trait]
impl RobotSession for GrpcSession {
    async fn call(&mut self, command: &RobotCommand) -> Result<CommandReply, CommandError> {
        let empty = teleop_service::Empty {};
        // joint moves get their duration on top of the liveness deadline
        let deadline = self.liveness_timeout;
        let reply = match command {
            RobotCommand::ReadPose => {
                let pose = self
                    .client
                    .read_pose(with_deadline(empty, deadline))
                    .await
                    .map_err(status_to_error)?
                    .into_inner();
                CommandReply::Pose(TaskPose::try_from(pose).map_err(malformed)?)
            }
            RobotCommand::ReadJointPositions => {
                let joints = self
                    .client
                    .read_joint_positions(with_deadline(empty, deadline))
                    .await
                    .map_err(status_to_error)?
                    .into_inner();
                CommandReply::Joints(joints.values)
            }
            RobotCommand::ReadJointVelocities => {
                let joints = self
                    .client
                    .read_joint_velocities(with_deadline(empty, deadline))
                    .await
                    .map_err(status_to_error)?
                    .into_inner();
                CommandReply::Joints(joints.values)
            }
            RobotCommand::MoveToJointPositions {
                positions,
                duration,
            } => {
                let request = with_deadline(
                    teleop_service::JointMove {
                        positions: positions.clone(),
                        duration_secs: duration.as_secs_f64(),
                    },
                    deadline + *duration,
                );
                self.client
                    .move_to_joint_positions(request)
                    .await
                    .map_err(status_to_error)?;
                CommandReply::Done
            }
            RobotCommand::StartImpedance(gains) => {
                let request = with_deadline(teleop_service::Gains::from(*gains), deadline);
                self.client
                    .start_impedance(request)
                    .await
                    .map_err(status_to_error)?;
                CommandReply::Done
            }
            RobotCommand::UpdateTargetPose(target) => {
                let request = with_deadline(teleop_service::Pose::from(*target), deadline);
                self.client
                    .update_target_pose(request)
                    .await
                    .map_err(status_to_error)?;
                CommandReply::Done
            }
            RobotCommand::TerminatePolicy => {
                self.client
                    .terminate_policy(with_deadline(empty, deadline))
                    .await
                    .map_err(status_to_error)?;
                CommandReply::Done
            }
            RobotCommand::ReadGripperWidth => {
                let width = self
                    .client
                    .read_gripper_width(with_deadline(empty, deadline))
                    .await
                    .map_err(status_to_error)?
                    .into_inner();
                CommandReply::Width(width.width)
            }
            RobotCommand::SetGripperWidth(width) => {
                let request =
                    with_deadline(teleop_service::GripperWidth { width: *width }, deadline);
                self.client
                    .set_gripper_width(request)
                    .await
                    .map_err(status_to_error)?;
                CommandReply::Done
            }
        };
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpc_server::{RobotControlHandler, RobotControlServer, SharedRobot, SimulatedRobot};
    use approx::assert_relative_eq;
    use nalgebra as na;
    use std::{sync::Arc, time::Duration};
    use teleop_controller::command_channel::{CommandChannel, ConnectionState, GainProfile};
    use tokio::sync::Mutex;
    use tokio_stream::wrappers::TcpListenerStream;
    use tonic::transport::Server;

    fn settings(endpoint: String) -> ConnectionSettings {
        ConnectionSettings {
            endpoint,
            connect_timeout: Duration::from_secs(2),
            liveness_timeout: Duration::from_secs(5),
            max_retries: 2,
            retry_backoff: Duration::from_millis(10),
        }
    }

    async fn spawn_simulator() -> (String, SharedRobot) {
        let robot = Arc::new(Mutex::new(SimulatedRobot::default()));
        let handler = RobotControlHandler::new(Arc::clone(&robot));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(
            Server::builder()
                .add_service(RobotControlServer::new(handler))
                .serve_with_incoming(TcpListenerStream::new(listener)),
        );
        (format!("http://{}", address), robot)
    }

    fn gains() -> GainProfile {
        GainProfile::new(
            na::Vector6::new(300.0, 300.0, 300.0, 6.0, 6.0, 6.0),
            na::Vector6::new(18.5, 18.5, 18.5, 1.0, 1.0, 1.0),
        )
    }

    #[tokio::test]
    async fn full_session_against_simulator() {
        let (endpoint, robot) = spawn_simulator().await;
        let mut channel = CommandChannel::new(Box::new(GrpcConnector), settings(endpoint));
        channel.connect().await.unwrap();
        assert_eq!(channel.state(), ConnectionState::Connected);

        channel.start_impedance(&gains()).await.unwrap();
        let start = channel.read_pose().await.unwrap();
        assert_relative_eq!(start.position, na::Vector3::new(0.31, 0.0, 0.49));

        let target = TaskPose::new(
            na::Vector3::new(0.29, 0.04, 0.484),
            na::Vector3::new(3.0, 0.1, 0.0),
        );
        channel.update_target_pose(&target).await.unwrap();
        assert_eq!(channel.read_pose().await.unwrap(), target);

        channel.set_gripper_width(0.055).await.unwrap();
        assert_eq!(channel.read_gripper_width().await.unwrap(), 0.055);
        assert_eq!(channel.read_joint_positions().await.unwrap().len(), 7);
        assert_eq!(channel.read_joint_velocities().await.unwrap().len(), 7);

        channel.terminate_policy().await.unwrap();
        assert!(robot.lock().await.policy.is_none());
        channel.close().await;
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn update_without_policy_is_rejected() {
        let (endpoint, _robot) = spawn_simulator().await;
        let mut channel = CommandChannel::new(Box::new(GrpcConnector), settings(endpoint));
        let error = channel
            .update_target_pose(&TaskPose::default())
            .await
            .unwrap_err();
        assert!(matches!(error, CommandError::RemoteRejection(_)));
        assert_eq!(channel.reconnects(), 0);
    }

    #[tokio::test]
    async fn joint_move_with_wrong_arity_is_rejected() {
        let (endpoint, _robot) = spawn_simulator().await;
        let mut channel = CommandChannel::new(Box::new(GrpcConnector), settings(endpoint));
        let error = channel
            .move_to_joint_positions(vec![0.0; 3], Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(!error.is_transport());
    }

    #[tokio::test]
    async fn joint_move_reaches_simulator() {
        let (endpoint, robot) = spawn_simulator().await;
        let mut channel = CommandChannel::new(Box::new(GrpcConnector), settings(endpoint));
        channel
            .move_to_joint_positions(vec![0.2; 7], Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(robot.lock().await.joint_positions, vec![0.2; 7]);
    }

    #[tokio::test]
    async fn joint_move_outlasting_liveness_timeout_succeeds() {
        let (endpoint, robot) = spawn_simulator().await;
        let mut settings = settings(endpoint);
        settings.liveness_timeout = Duration::from_millis(500);
        let mut channel = CommandChannel::new(Box::new(GrpcConnector), settings);
        channel
            .move_to_joint_positions(vec![0.3; 7], Duration::from_millis(800))
            .await
            .unwrap();
        assert_eq!(channel.reconnects(), 0);
        assert_eq!(robot.lock().await.joint_positions, vec![0.3; 7]);
    }

    #[tokio::test]
    async fn unreachable_service_is_connection_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);
        let mut channel = CommandChannel::new(
            Box::new(GrpcConnector),
            settings(format!("http://{}", address)),
        );
        let error = channel.read_pose().await.unwrap_err();
        assert!(error.is_transport());
        assert_eq!(channel.reconnects(), 2);
        assert_eq!(channel.state(), ConnectionState::Faulted);
    }

    #[test]
    fn status_codes_map_to_error_kinds() {
        assert!(status_to_error(Status::unavailable("down")).is_transport());
        assert!(status_to_error(Status::deadline_exceeded("slow")).is_transport());
        assert!(!status_to_error(Status::failed_precondition("no policy")).is_transport());
        assert!(!status_to_error(Status::invalid_argument("bad pose")).is_transport());
    }
}
