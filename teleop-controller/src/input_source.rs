use crate::pose_mapper::DevicePose;
use nalgebra as na;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::{net::UdpSocket, sync::watch, task};
use tracing::{debug, info};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InputError {
    #[error("no device data received yet")]
    Unavailable,
    #[error("device reported a non finite pose")]
    NonFinite,
}

/// Latest state reported by the handheld controller
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InputSample {
    #[serde(default)]
    pub position: Option<[f64; 3]>,
    /// Row major
    #[serde(default)]
    pub rotation: Option<[[f64; 3]; 3]>,
    #[serde(default)]
    pub button: bool,
    #[serde(default)]
    pub toggle: bool,
}

impl InputSample {
    pub fn device_pose(&self) -> Result<DevicePose, InputError> {
        let (position, rotation) = match (self.position, self.rotation) {
            (Some(position), Some(rotation)) => (position, rotation),
            _ => return Err(InputError::Unavailable),
        };
        let position = na::Vector3::from(position);
        let matrix = na::Matrix3::from_fn(|row, column| rotation[row][column]);
        if !position.iter().chain(matrix.iter()).all(|value| value.is_finite()) {
            return Err(InputError::NonFinite);
        }
        // tracking data drifts slightly off orthonormal
        let rotation = na::Rotation3::from_matrix(&matrix);
        Ok(DevicePose::new(position, rotation))
    }
}

/// Polled source of controller samples. Polling never blocks.
pub trait InputSource: Send {
    fn latest(&mut self) -> InputSample;
}

impl InputSource for watch::Receiver<InputSample> {
    fn latest(&mut self) -> InputSample {
        self.borrow_and_update().clone()
    }
}

/// Receives controller state as JSON datagrams
pub struct UdpPoseReceiver {
    receiver: watch::Receiver<InputSample>,
    local_addr: SocketAddr,
    join_handle: task::JoinHandle<()>,
}

impl UdpPoseReceiver {
    pub async fn bind(address: &str) -> std::io::Result<UdpPoseReceiver> {
        let socket = UdpSocket::bind(address).await?;
        let local_addr = socket.local_addr()?;
        let (sender, receiver) = watch::channel(InputSample::default());
        info!("Listening for controller data on {}", local_addr);
        let join_handle = tokio::spawn(async move {
            let mut buffer = [0_u8; 4096];
            loop {
                let (len, peer) = match socket.recv_from(&mut buffer).await {
                    Ok(received) => received,
                    Err(error) => {
                        debug!("Failed to receive controller datagram {}", error);
                        continue;
                    }
                };
                match serde_json::from_slice::<InputSample>(&buffer[..len]) {
                    Ok(sample) => {
                        if sender.send(sample).is_err() {
                            return;
                        }
                    }
                    Err(error) => debug!("Malformed controller message from {}: {}", peer, error),
                }
            }
        });
        Ok(UdpPoseReceiver {
            receiver,
            local_addr,
            join_handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscribe(&self) -> watch::Receiver<InputSample> {
        self.receiver.clone()
    }
}

impl InputSource for UdpPoseReceiver {
    fn latest(&mut self) -> InputSample {
        self.receiver.latest()
    }
}

impl Drop for UdpPoseReceiver {
    fn drop(&mut self) {
        self.join_handle.abort();
    }
}
