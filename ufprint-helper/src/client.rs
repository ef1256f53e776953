use std::{
    io,
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use log::{error, info, warn};
use tokio::{net::UnixStream, time::timeout};
use ufprint::{
    config::HelperConfig,
    device::{ConfirmationToken, DeviceId, FingerLabel},
    enroll::FingerAdmin,
    error::{ProtocolError, Result},
    policy::{PolicyTarget, TargetStatus},
};

use crate::{
    channel::{read_message, write_message},
    messages::{HelperOp, HelperRequest, HelperResponse, HelperResult, Payload},
};

/// Unprivileged end of the helper channel. One connection per request.
pub struct HelperClient {
    socket_path: PathBuf,
    timeout: Duration,
    next_id: AtomicU64,
}

impl HelperClient {
    pub fn new<P>(socket_path: P, timeout: Duration) -> Self
    where
        P: Into<PathBuf>,
    {
        Self {
            socket_path: socket_path.into(),
            timeout,
            next_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn from_config(config: &HelperConfig) -> Self {
        Self::new(&config.socket_path, config.timeout())
    }

    async fn exchange(&self, request: &HelperRequest) -> Result<HelperResponse> {
        let mut stream = match UnixStream::connect(&self.socket_path).await {
            Ok(v) => v,
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused) => {
                error!("helper is not running at {} ({e})", self.socket_path.display());
                return Err(ProtocolError::Unavailable.into());
            }
            Err(e) => return Err(e.into()),
        };

        write_message(&mut stream, request).await?;

        let response: HelperResponse = read_message(&mut stream).await?;

        Ok(response)
    }

    async fn call(&self, op: HelperOp) -> Result<Payload> {
        let request = HelperRequest::new(self.next_id.fetch_add(1, Ordering::Relaxed), op);

        request.validate()?;

        info!("sending {} id={}", request.op, request.id);

        let response = match timeout(self.timeout, self.exchange(&request)).await {
            Ok(v) => v?,
            Err(_) => {
                warn!("no answer to id={} after {:?}", request.id, self.timeout);
                return Err(ProtocolError::Timeout.into());
            }
        };

        if response.id != request.id {
            error!("response id {} does not match request id {}", response.id, request.id);
            return Err(ProtocolError::SchemaInvalid.into());
        }

        info!("id={} {}", response.id, response.result);

        match response.result {
            HelperResult::Success(payload) => Ok(payload),
            HelperResult::Denied => Err(request.op.denied_error()),
            HelperResult::Failed(kind) => Err(kind.into()),
        }
    }

    async fn call_done(&self, op: HelperOp) -> Result<()> {
        let Payload::Done = self.call(op).await? else {
            return Err(ProtocolError::SchemaInvalid.into());
        };

        Ok(())
    }

    pub async fn enable_target(&self, target: PolicyTarget) -> Result<()> {
        self.call_done(HelperOp::EnableTarget(target)).await
    }

    pub async fn disable_target(&self, target: PolicyTarget) -> Result<()> {
        self.call_done(HelperOp::DisableTarget(target)).await
    }

    pub async fn set_target(&self, target: PolicyTarget, enabled: bool) -> Result<()> {
        if enabled {
            self.enable_target(target).await
        } else {
            self.disable_target(target).await
        }
    }

    pub async fn query_target_status(&self, target: PolicyTarget) -> Result<TargetStatus> {
        let Payload::Status(status) = self.call(HelperOp::QueryTargetStatus(target)).await? else {
            return Err(ProtocolError::SchemaInvalid.into());
        };

        Ok(status)
    }
}

impl FingerAdmin for HelperClient {
    async fn delete_finger(&self, device: &DeviceId, finger: FingerLabel, confirmation: ConfirmationToken) -> Result<()> {
        self.call_done(HelperOp::AdminDeleteFinger {
            device: device.clone(),
            finger,
            confirmation,
        })
        .await
    }

    async fn delete_all_fingers(&self, device: &DeviceId, confirmation: ConfirmationToken) -> Result<()> {
        self.call_done(HelperOp::AdminDeleteAllFingers {
            device: device.clone(),
            confirmation,
        })
        .await
    }
}
