use crate::command_channel::{CommandChannel, CommandError, GainProfile, TargetPose};
use crate::debouncer::Debouncer;
use crate::input_source::{InputError, InputSample, InputSource};
use crate::pose_mapper::{PoseMapper, SessionAnchor};
use crate::teleop_config::{GripperConfig, TeleopConfig};
use crate::trigger_notifier::TriggerNotifier;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

type Result<T> = std::result::Result<T, CommandError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Init,
    Running,
    Recovering,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoopStatistics {
    pub ticks: u64,
    /// Ticks whose work took longer than the control period
    pub overruns: u64,
    pub dispatched: u64,
    pub dispatch_failures: u64,
    pub recoveries: u64,
    pub triggers: u64,
}

/// Fixed rate teleoperation loop
///
/// Every tick samples the controller, maps it into task space and streams the
/// target to the impedance controller. Remote faults never end the loop.
pub struct ControlLoop {
    channel: CommandChannel,
    input: Box<dyn InputSource>,
    notifier: Box<dyn TriggerNotifier>,
    mapper: PoseMapper,
    debouncer: Debouncer,
    gains: GainProfile,
    gripper: GripperConfig,
    period: Duration,
    poll_interval: Duration,
    poll_max_interval: Duration,
    status_interval: Duration,
    state: LoopState,
    anchor: Option<SessionAnchor>,
    last_target: Option<TargetPose>,
    last_toggle: Option<bool>,
    rejecting_samples: bool,
    statistics: LoopStatistics,
}

impl ControlLoop {
    pub fn new(
        config: &TeleopConfig,
        channel: CommandChannel,
        input: Box<dyn InputSource>,
        notifier: Box<dyn TriggerNotifier>,
    ) -> ControlLoop {
        ControlLoop {
            channel,
            input,
            notifier,
            mapper: PoseMapper::new(
                config.bounds,
                config.control.position_scale,
                config.control.in_front_of_robot,
            ),
            debouncer: Debouncer::new(config.button_cooldown()),
            gains: config.gain_profile(),
            gripper: config.gripper.clone(),
            period: config.control_period(),
            poll_interval: config.input_poll_interval(),
            poll_max_interval: config.input_poll_max_interval(),
            status_interval: config.status_interval(),
            state: LoopState::Init,
            anchor: None,
            last_target: None,
            last_toggle: None,
            rejecting_samples: false,
            statistics: LoopStatistics::default(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn anchor(&self) -> Option<&SessionAnchor> {
        self.anchor.as_ref()
    }

    pub fn last_target(&self) -> Option<&TargetPose> {
        self.last_target.as_ref()
    }

    pub fn statistics(&self) -> LoopStatistics {
        self.statistics
    }

    /// Start impedance control, capture the session anchor and wait for the device
    ///
    /// Returns false if interrupted before the device showed up
    pub async fn initialize(&mut self, keep_running: &AtomicBool) -> Result<bool> {
        self.state = LoopState::Init;
        self.channel.connect().await?;
        self.channel.start_impedance(&self.gains).await?;
        let start_pose = self.channel.read_pose().await?;
        info!(
            "Session anchored at position {:?} orientation {:?}",
            start_pose.position.as_slice(),
            start_pose.orientation.as_slice()
        );
        self.anchor = Some(SessionAnchor::from_task_pose(&start_pose));

        if !self.wait_for_input(keep_running).await {
            return Ok(false);
        }
        info!("Controller connected, teleoperation running");
        self.state = LoopState::Running;
        Ok(true)
    }

    async fn wait_for_input(&mut self, keep_running: &AtomicBool) -> bool {
        let mut backoff = self.poll_interval;
        let mut announced = false;
        while keep_running.load(Ordering::Relaxed) {
            match self.input.latest().device_pose() {
                Ok(_) => return true,
                Err(error) => {
                    if !announced {
                        info!("Waiting for controller: {}", error);
                        announced = true;
                    }
                }
            }
            sleep(backoff).await;
            backoff = (backoff * 2).min(self.poll_max_interval);
        }
        false
    }

    /// One control cycle
    pub async fn tick(&mut self, now: Instant) {
        self.statistics.ticks += 1;
        let sample = self.input.latest();
        match self.state {
            LoopState::Init => {}
            LoopState::Running => {
                self.follow_device(&sample).await;
                if self.state == LoopState::Running {
                    self.follow_toggle(&sample).await;
                }
            }
            LoopState::Recovering => self.recover().await,
        }
        if self.debouncer.should_fire(sample.button, now) {
            info!("Button pressed, sending trigger");
            self.statistics.triggers += 1;
            self.notifier.notify();
        }
    }

    async fn follow_device(&mut self, sample: &InputSample) {
        let anchor = match &self.anchor {
            Some(anchor) => *anchor,
            None => return,
        };
        let device = match sample.device_pose() {
            Ok(device) => device,
            Err(InputError::Unavailable) => {
                debug!("Controller data unavailable, holding last target");
                return;
            }
            Err(error) => {
                if !self.rejecting_samples {
                    warn!("Ignoring controller samples: {}", error);
                    self.rejecting_samples = true;
                }
                return;
            }
        };
        if self.rejecting_samples {
            info!("Controller samples valid again");
            self.rejecting_samples = false;
        }
        let target = self.mapper.map(&device, &anchor);
        match self.channel.update_target_pose(&target).await {
            Ok(()) => {
                self.statistics.dispatched += 1;
                self.last_target = Some(target);
            }
            Err(error) => {
                warn!("Failed to update target pose: {}. Reinitializing", error);
                self.statistics.dispatch_failures += 1;
                self.state = LoopState::Recovering;
            }
        }
    }

    async fn recover(&mut self) {
        match self.channel.start_impedance(&self.gains).await {
            Ok(()) => {
                info!("Impedance control restarted");
                self.statistics.recoveries += 1;
                self.state = LoopState::Running;
            }
            Err(error) => warn!("Failed to restart impedance control: {}", error),
        }
    }

    async fn follow_toggle(&mut self, sample: &InputSample) {
        if !self.gripper.follow_toggle || self.last_toggle == Some(sample.toggle) {
            return;
        }
        let width = if sample.toggle {
            self.gripper.close_width
        } else {
            self.gripper.open_width
        };
        // a failed move is retried next tick
        match self.channel.set_gripper_width(width).await {
            Ok(()) => self.last_toggle = Some(sample.toggle),
            Err(error) => warn!("Failed to move gripper: {}", error),
        }
    }

    fn log_status(&self) {
        match &self.last_target {
            Some(target) => info!(
                "{:?} target [{:.3}, {:.3}, {:.3}] overruns {} recoveries {}",
                self.state,
                target.position.x,
                target.position.y,
                target.position.z,
                self.statistics.overruns,
                self.statistics.recoveries
            ),
            None => info!("{:?} no target sent yet", self.state),
        }
    }

    /// Stop the policy and release the channel. Failures are only logged.
    pub async fn shutdown(&mut self) {
        if let Err(error) = self.channel.terminate_policy().await {
            warn!("Failed to terminate policy: {}", error);
        }
        self.channel.close().await;
    }

    /// Run until `keep_running` is cleared
    pub async fn run(mut self, keep_running: Arc<AtomicBool>) -> Result<LoopStatistics> {
        match self.initialize(&keep_running).await {
            Ok(true) => (),
            Ok(false) => {
                self.shutdown().await;
                return Ok(self.statistics);
            }
            Err(error) => {
                self.channel.close().await;
                return Err(error);
            }
        }

        // deadlines stay on the nominal grid, overrunning ticks skip missed slots
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_status = tokio::time::Instant::now();
        while keep_running.load(Ordering::Relaxed) {
            ticker.tick().await;
            let started = tokio::time::Instant::now();
            self.tick(started.into_std()).await;
            if started.elapsed() > self.period {
                self.statistics.overruns += 1;
            }
            if last_status.elapsed() >= self.status_interval {
                self.log_status();
                last_status = tokio::time::Instant::now();
            }
        }

        info!("Stopping teleoperation");
        self.shutdown().await;
        Ok(self.statistics)
    }
}
