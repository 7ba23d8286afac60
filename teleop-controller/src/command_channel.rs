use async_trait::async_trait;
use nalgebra as na;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    /// Transport unreachable, timed out or dropped. Retried by the channel.
    #[error("connection to robot service failed: {0}")]
    Connection(String),
    /// Robot service refused a well formed command. Never retried.
    #[error("robot service rejected command: {0}")]
    RemoteRejection(String),
}

impl CommandError {
    pub fn is_transport(&self) -> bool {
        matches!(self, CommandError::Connection(_))
    }
}

type Result<T> = std::result::Result<T, CommandError>;

/// End effector pose in task space
///
/// Orientation is a rotation vector (axis * angle)
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TaskPose {
    pub position: na::Vector3<f64>,
    pub orientation: na::Vector3<f64>,
}

/// Pose sent to the impedance controller every tick
pub type TargetPose = TaskPose;

impl TaskPose {
    pub fn new(position: na::Vector3<f64>, orientation: na::Vector3<f64>) -> TaskPose {
        TaskPose {
            position,
            orientation,
        }
    }

    /// x, y, z, rx, ry, rz
    pub fn to_array(&self) -> [f64; 6] {
        [
            self.position.x,
            self.position.y,
            self.position.z,
            self.orientation.x,
            self.orientation.y,
            self.orientation.z,
        ]
    }

    pub fn from_slice(values: &[f64]) -> Option<TaskPose> {
        match values {
            [x, y, z, rx, ry, rz] => Some(TaskPose::new(
                na::Vector3::new(*x, *y, *z),
                na::Vector3::new(*rx, *ry, *rz),
            )),
            _ => None,
        }
    }
}

/// Cartesian impedance gains
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainProfile {
    pub stiffness: na::Vector6<f64>,
    pub damping: na::Vector6<f64>,
}

impl GainProfile {
    pub fn new(stiffness: na::Vector6<f64>, damping: na::Vector6<f64>) -> GainProfile {
        GainProfile { stiffness, damping }
    }
}

/// Operations exposed by the remote robot control service
#[derive(Debug, Clone, PartialEq)]
pub enum RobotCommand {
    ReadPose,
    ReadJointPositions,
    ReadJointVelocities,
    MoveToJointPositions {
        positions: Vec<f64>,
        duration: Duration,
    },
    StartImpedance(GainProfile),
    UpdateTargetPose(TargetPose),
    TerminatePolicy,
    ReadGripperWidth,
    SetGripperWidth(f64),
}

impl RobotCommand {
    pub fn name(&self) -> &'static str {
        match self {
            RobotCommand::ReadPose => "read_pose",
            RobotCommand::ReadJointPositions => "read_joint_positions",
            RobotCommand::ReadJointVelocities => "read_joint_velocities",
            RobotCommand::MoveToJointPositions { .. } => "move_to_joint_positions",
            RobotCommand::StartImpedance(_) => "start_impedance",
            RobotCommand::UpdateTargetPose(_) => "update_target_pose",
            RobotCommand::TerminatePolicy => "terminate_policy",
            RobotCommand::ReadGripperWidth => "read_gripper_width",
            RobotCommand::SetGripperWidth(_) => "set_gripper_width",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandReply {
    Done,
    Pose(TaskPose),
    Joints(Vec<f64>),
    Width(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    pub endpoint: String,
    pub connect_timeout: Duration,
    /// How long a silent link is tolerated before it is considered dead
    pub liveness_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Faulted,
}

/// One live session with the robot control service
#[async_trait]
pub trait RobotSession: Send {
    async fn call(&mut self, command: &RobotCommand) -> Result<CommandReply>;
    /// Release the session. Must not fail.
    async fn close(&mut self) {}
}

/// Opens sessions with the robot control service
#[async_trait]
pub trait RobotConnector: Send + Sync {
    async fn connect(&self, settings: &ConnectionSettings) -> Result<Box<dyn RobotSession>>;
}

/// Fault tolerant proxy to the robot control service
///
/// Transport faults are retried with a reconnect and a fixed backoff.
/// Rejections from the service are returned straight away.
pub struct CommandChannel {
    connector: Box<dyn RobotConnector>,
    settings: ConnectionSettings,
    session: Option<Box<dyn RobotSession>>,
    state: ConnectionState,
    reconnects: u64,
}

impl CommandChannel {
    pub fn new(connector: Box<dyn RobotConnector>, settings: ConnectionSettings) -> CommandChannel {
        CommandChannel {
            connector,
            settings,
            session: None,
            state: ConnectionState::Disconnected,
            reconnects: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Number of times the session was reopened after a fault
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    /// Open a session, dropping the current one first.
    pub async fn connect(&mut self) -> Result<()> {
        self.release().await;
        let connect_timeout = self.settings.connect_timeout;
        let session = match timeout(connect_timeout, self.connector.connect(&self.settings)).await
        {
            Ok(Ok(session)) => session,
            Ok(Err(error)) => {
                self.state = ConnectionState::Faulted;
                return Err(error);
            }
            Err(_) => {
                self.state = ConnectionState::Faulted;
                return Err(CommandError::Connection(format!(
                    "{} not reachable within {:?}",
                    self.settings.endpoint, connect_timeout
                )));
            }
        };
        self.session = Some(session);
        self.state = ConnectionState::Connected;
        debug!("Connected to {}", self.settings.endpoint);
        Ok(())
    }

    /// Release the session. Safe to call repeatedly.
    pub async fn close(&mut self) {
        self.release().await;
        self.state = ConnectionState::Disconnected;
    }

    async fn release(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
    }

    async fn attempt(&mut self, command: &RobotCommand) -> Result<CommandReply> {
        if self.session.is_none() || self.state == ConnectionState::Faulted {
            self.connect().await?;
        }
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| CommandError::Connection("no session".to_owned()))?;
        match session.call(command).await {
            Ok(reply) => Ok(reply),
            Err(error) => {
                if error.is_transport() {
                    self.state = ConnectionState::Faulted;
                }
                Err(error)
            }
        }
    }

    /// Invoke a remote operation
    ///
    /// At most `max_retries` retries follow the first attempt. Each retry
    /// waits out the backoff and reopens the session.
    pub async fn dispatch(&mut self, command: &RobotCommand) -> Result<CommandReply> {
        let mut error = match self.attempt(command).await {
            Ok(reply) => return Ok(reply),
            Err(error) => error,
        };
        for retry in 1..=self.settings.max_retries {
            if !error.is_transport() {
                break;
            }
            warn!(
                "{} failed: {}. Retry {}/{}",
                command.name(),
                error,
                retry,
                self.settings.max_retries
            );
            sleep(self.settings.retry_backoff).await;
            self.reconnects += 1;
            if let Err(connect_error) = self.connect().await {
                error = connect_error;
                continue;
            }
            match self.attempt(command).await {
                Ok(reply) => {
                    info!("{} succeeded after reconnect", command.name());
                    return Ok(reply);
                }
                Err(retry_error) => error = retry_error,
            }
        }
        Err(error)
    }

    pub async fn read_pose(&mut self) -> Result<TaskPose> {
        match self.dispatch(&RobotCommand::ReadPose).await? {
            CommandReply::Pose(pose) => Ok(pose),
            other => Err(unexpected_reply("read_pose", &other)),
        }
    }

    pub async fn read_joint_positions(&mut self) -> Result<Vec<f64>> {
        match self.dispatch(&RobotCommand::ReadJointPositions).await? {
            CommandReply::Joints(joints) => Ok(joints),
            other => Err(unexpected_reply("read_joint_positions", &other)),
        }
    }

    pub async fn read_joint_velocities(&mut self) -> Result<Vec<f64>> {
        match self.dispatch(&RobotCommand::ReadJointVelocities).await? {
            CommandReply::Joints(joints) => Ok(joints),
            other => Err(unexpected_reply("read_joint_velocities", &other)),
        }
    }

    pub async fn move_to_joint_positions(
        &mut self,
        positions: Vec<f64>,
        duration: Duration,
    ) -> Result<()> {
        self.dispatch(&RobotCommand::MoveToJointPositions {
            positions,
            duration,
        })
        .await?;
        Ok(())
    }

    pub async fn start_impedance(&mut self, gains: &GainProfile) -> Result<()> {
        self.dispatch(&RobotCommand::StartImpedance(*gains)).await?;
        Ok(())
    }

    pub async fn update_target_pose(&mut self, target: &TargetPose) -> Result<()> {
        self.dispatch(&RobotCommand::UpdateTargetPose(*target)).await?;
        Ok(())
    }

    pub async fn terminate_policy(&mut self) -> Result<()> {
        self.dispatch(&RobotCommand::TerminatePolicy).await?;
        Ok(())
    }

    pub async fn read_gripper_width(&mut self) -> Result<f64> {
        match self.dispatch(&RobotCommand::ReadGripperWidth).await? {
            CommandReply::Width(width) => Ok(width),
            other => Err(unexpected_reply("read_gripper_width", &other)),
        }
    }

    pub async fn set_gripper_width(&mut self, width: f64) -> Result<()> {
        self.dispatch(&RobotCommand::SetGripperWidth(width)).await?;
        Ok(())
    }
}

fn unexpected_reply(operation: &str, reply: &CommandReply) -> CommandError {
    CommandError::RemoteRejection(format!("unexpected reply to {}: {:?}", operation, reply))
}


#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;
    use std::sync::atomic::Ordering;

    #[tokio::test(start_paused = true)]
    async fn dispatch_connects_lazily() {
        let robot = MockRobot::new();
        let mut channel = channel(&robot, 2);
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        channel.terminate_policy().await.unwrap();
        assert_eq!(channel.state(), ConnectionState::Connected);
        assert_eq!(robot.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn single_transport_fault_recovers_with_one_reconnect() {
        let robot = MockRobot::new();
        *robot.pose.lock().unwrap() = TaskPose::new(
            na::Vector3::new(0.3, 0.0, 0.5),
            na::Vector3::new(3.0, 0.0, 0.0),
        );
        let mut channel = channel(&robot, 2);
        channel.connect().await.unwrap();
        robot.transport_failures.store(1, Ordering::SeqCst);

        let pose = channel.read_pose().await.unwrap();

        assert_eq!(pose.position, na::Vector3::new(0.3, 0.0, 0.5));
        assert_eq!(channel.reconnects(), 1);
        assert_eq!(robot.connects.load(Ordering::SeqCst), 2);
        assert_eq!(robot.calls.load(Ordering::SeqCst), 2);
        assert_eq!(channel.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_fault_gives_up_after_max_retries() {
        let robot = MockRobot::new();
        let mut channel = channel(&robot, 2);
        channel.connect().await.unwrap();
        robot.transport_failures.store(usize::MAX, Ordering::SeqCst);

        let error = channel.terminate_policy().await.unwrap_err();

        assert!(error.is_transport());
        assert_eq!(channel.reconnects(), 2);
        // first attempt plus one per retry
        assert_eq!(robot.calls.load(Ordering::SeqCst), 3);
        assert_eq!(channel.state(), ConnectionState::Faulted);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_wait_out_backoff() {
        let robot = MockRobot::new();
        let mut channel = channel(&robot, 2);
        channel.connect().await.unwrap();
        robot.transport_failures.store(usize::MAX, Ordering::SeqCst);

        let start = tokio::time::Instant::now();
        let _ = channel.terminate_policy().await;
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reconnect_counts_as_attempt() {
        let robot = MockRobot::new();
        let mut channel = channel(&robot, 2);
        channel.connect().await.unwrap();
        robot.transport_failures.store(1, Ordering::SeqCst);
        robot.connect_failures.store(1, Ordering::SeqCst);

        channel.terminate_policy().await.unwrap();

        assert_eq!(channel.reconnects(), 2);
        assert_eq!(robot.count("terminate_policy"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_is_not_retried() {
        let robot = MockRobot::new();
        let mut channel = channel(&robot, 2);
        robot.rejected_updates.store(1, Ordering::SeqCst);

        let error = channel
            .update_target_pose(&TaskPose::default())
            .await
            .unwrap_err();

        assert!(matches!(error, CommandError::RemoteRejection(_)));
        assert_eq!(robot.calls.load(Ordering::SeqCst), 1);
        assert_eq!(channel.reconnects(), 0);
        assert_eq!(channel.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_fails_immediately() {
        let robot = MockRobot::new();
        let mut channel = channel(&robot, 0);
        robot.transport_failures.store(1, Ordering::SeqCst);

        assert!(channel.read_gripper_width().await.is_err());
        assert_eq!(robot.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent() {
        let robot = MockRobot::new();
        let mut channel = channel(&robot, 2);
        channel.connect().await.unwrap();
        channel.close().await;
        channel.close().await;
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_releases_previous_session() {
        let robot = MockRobot::new();
        let mut channel = channel(&robot, 2);
        channel.connect().await.unwrap();
        channel.connect().await.unwrap();
        assert_eq!(robot.connects.load(Ordering::SeqCst), 2);
        assert_eq!(channel.state(), ConnectionState::Connected);
    }

    struct HangingConnector;

    #[async_trait]
    impl RobotConnector for HangingConnector {
        async fn connect(&self, _: &ConnectionSettings) -> Result<Box<dyn RobotSession>> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connect_times_out() {
        let mut channel = CommandChannel::new(Box::new(HangingConnector), settings(2));
        let error = channel.connect().await.unwrap_err();
        assert!(error.is_transport());
        assert_eq!(channel.state(), ConnectionState::Faulted);
    }

    #[test]
    fn task_pose_array_layout() {
        let pose = TaskPose::from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(pose.to_array(), [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert!(TaskPose::from_slice(&[1.0, 2.0]).is_none());
    }
}
