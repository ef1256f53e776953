use std::future::Future;

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, task::AbortHandle};
use zbus::{Connection, proxy, zvariant::OwnedObjectPath};

use crate::{
    device::{Device, DeviceId, EnrolledFinger, FingerLabel, ScanType},
    error::{DeleteError, Error, Result},
};

const FPRINTD_ERROR_PREFIX: &str = "net.reactivated.Fprint.Error.";
const ENROLL_EVENT_BACKLOG: usize = 32;

#[proxy(
    interface = "net.reactivated.Fprint.Manager",
    default_service = "net.reactivated.Fprint",
    default_path = "/net/reactivated/Fprint/Manager",
    gen_blocking = false
)]
trait FprintManager {
    #[zbus(name = "GetDevices")]
    fn get_devices(&self) -> zbus::Result<Vec<OwnedObjectPath>>;
}

#[proxy(
    interface = "net.reactivated.Fprint.Device",
    default_service = "net.reactivated.Fprint",
    gen_blocking = false
)]
trait FprintDevice {
    #[zbus(name = "Claim")]
    fn claim(&self, username: &str) -> zbus::Result<()>;
    #[zbus(name = "Release")]
    fn release(&self) -> zbus::Result<()>;
    #[zbus(name = "ListEnrolledFingers")]
    fn list_enrolled_fingers(&self, username: &str) -> zbus::Result<Vec<String>>;
    #[zbus(name = "EnrollStart")]
    fn enroll_start(&self, finger_name: &str) -> zbus::Result<()>;
    #[zbus(name = "EnrollStop")]
    fn enroll_stop(&self) -> zbus::Result<()>;
    #[zbus(name = "DeleteEnrolledFinger")]
    fn delete_enrolled_finger(&self, finger_name: &str) -> zbus::Result<()>;
    #[zbus(name = "DeleteEnrolledFingers2")]
    fn delete_enrolled_fingers2(&self) -> zbus::Result<()>;

    #[zbus(signal, name = "EnrollStatus")]
    fn enroll_status(&self, result: &str, done: bool) -> zbus::Result<()>;

    #[zbus(property, name = "name")]
    fn name(&self) -> zbus::Result<String>;
    #[zbus(property, name = "num-enroll-stages")]
    fn num_enroll_stages(&self) -> zbus::Result<i32>;
    #[zbus(property, name = "scan-type")]
    fn scan_type(&self) -> zbus::Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailReason {
    DeviceFailure,
    DataFull,
    Duplicate,
    DeviceDisconnected,
    ServiceLost,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollEvent {
    ScanGood,
    ScanRetryTooShort,
    ScanRetrySwipeDirection,
    ScanRetryCenterFinger,
    ScanRetryRemoveFinger,
    /// generic retry, also used for status codes we don't know
    ScanRetry,
    Completed,
    Failed(FailReason),
    DeviceDisconnected,
}

impl EnrollEvent {
    /// Decode an `EnrollStatus` signal.
    #[must_use]
    pub fn from_status(result: &str, done: bool) -> Self {
        match result {
            "enroll-stage-passed" => Self::ScanGood,
            "enroll-swipe-too-short" => Self::ScanRetryTooShort,
            "enroll-too-fast" => Self::ScanRetrySwipeDirection,
            "enroll-finger-not-centered" => Self::ScanRetryCenterFinger,
            "enroll-remove-and-retry" => Self::ScanRetryRemoveFinger,
            "enroll-retry-scan" => Self::ScanRetry,
            "enroll-completed" => Self::Completed,
            "enroll-failed" => Self::Failed(FailReason::DeviceFailure),
            "enroll-data-full" => Self::Failed(FailReason::DataFull),
            "enroll-duplicate" => Self::Failed(FailReason::Duplicate),
            "enroll-unknown-error" => Self::Failed(FailReason::Unknown),
            "enroll-disconnected" => Self::DeviceDisconnected,
            other if done => {
                warn!("unknown terminal enroll status {other}");
                Self::Failed(FailReason::Unknown)
            }
            other => {
                warn!("unknown enroll status {other}, treating as retry");
                Self::ScanRetry
            }
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_) | Self::DeviceDisconnected)
    }
}

/// Live subscription to the progress of one enrollment. Dropping it removes
/// the bus match rule.
#[derive(Debug)]
pub struct EnrollSubscription {
    events: mpsc::Receiver<EnrollEvent>,
    forwarder: Option<AbortHandle>,
}

impl EnrollSubscription {
    #[must_use]
    pub fn new(events: mpsc::Receiver<EnrollEvent>, forwarder: Option<AbortHandle>) -> Self {
        Self { events, forwarder }
    }

    pub async fn next(&mut self) -> Option<EnrollEvent> {
        self.events.recv().await
    }
}

impl Drop for EnrollSubscription {
    fn drop(&mut self) {
        self.events.close();
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

pub trait BiometricService: Send + Sync {
    fn list_devices(&self) -> impl Future<Output = Result<Vec<Device>>> + Send;

    fn list_fingers(&self, device: &Device) -> impl Future<Output = Result<Vec<EnrolledFinger>>> + Send;

    fn start_enroll(
        &self,
        device: &Device,
        finger: FingerLabel,
    ) -> impl Future<Output = Result<EnrollSubscription>> + Send;

    fn stop_enroll(&self, device: &Device) -> impl Future<Output = Result<()>> + Send;

    /// Admin path. Only the privileged helper calls this.
    fn delete_finger(
        &self,
        device: &Device,
        finger: FingerLabel,
    ) -> impl Future<Output = core::result::Result<(), DeleteError>> + Send;

    /// Admin path. Only the privileged helper calls this.
    fn delete_all_fingers(&self, device: &Device) -> impl Future<Output = core::result::Result<(), DeleteError>> + Send;

    /// Same service acting on `user`'s prints. Other users need privilege.
    #[must_use]
    fn for_user(&self, user: &str) -> Self
    where
        Self: Sized;
}

pub async fn find_device<B>(service: &B, id: &DeviceId) -> Result<Device>
where
    B: BiometricService,
{
    service
        .list_devices()
        .await?
        .into_iter()
        .find(|d| &d.id == id)
        .ok_or_else(|| Error::DeviceNotFound(id.to_string()))
}

fn fprintd_error_name(e: &zbus::Error) -> Option<&str> {
    match e {
        zbus::Error::MethodError(name, _, _) => name.as_str().strip_prefix(FPRINTD_ERROR_PREFIX),
        _ => None,
    }
}

fn delete_error(e: &zbus::Error) -> DeleteError {
    error!("fprintd delete failed ({e})");

    match fprintd_error_name(e) {
        Some("NoEnrolledPrints" | "PrintsNotDeleted") => DeleteError::NotFound,
        Some("AlreadyInUse" | "ClaimDevice" | "Internal") => DeleteError::DeviceBusy,
        Some("PermissionDenied") => DeleteError::Denied,
        _ => DeleteError::Unavailable,
    }
}

#[derive(Clone)]
pub struct FprintdClient {
    conn: Connection,
    user: String,
    default_stages: u32,
}

impl FprintdClient {
    pub async fn system(default_stages: u32) -> Result<Self> {
        let conn = Connection::system().await?;

        Ok(Self {
            conn,
            user: String::new(),
            default_stages,
        })
    }

    async fn manager(&self) -> Result<FprintManagerProxy<'_>> {
        Ok(FprintManagerProxy::new(&self.conn).await?)
    }

    async fn device_proxy(&self, id: &DeviceId) -> Result<FprintDeviceProxy<'static>> {
        let proxy = FprintDeviceProxy::builder(&self.conn)
            .path(id.as_str().to_string())?
            .cache_properties(zbus::proxy::CacheProperties::No)
            .build()
            .await?;

        Ok(proxy)
    }

    async fn describe(&self, path: &OwnedObjectPath) -> Result<Device> {
        let id: DeviceId = path.as_str().parse()?;
        let proxy = self.device_proxy(&id).await?;

        let name = proxy.name().await?;

        let scan_type = match proxy.scan_type().await?.as_str() {
            "swipe" => ScanType::Swipe,
            _ => ScanType::Press,
        };

        let enroll_stages = match u32::try_from(proxy.num_enroll_stages().await?) {
            Ok(v) if v > 0 => v,
            _ => {
                debug!("{id} reports no stage count, using {}", self.default_stages);
                self.default_stages
            }
        };

        // fprintd stores one print per finger name and user
        let max_templates = u32::try_from(FingerLabel::ALL.len())?;

        Ok(Device {
            id,
            name,
            scan_type,
            enroll_stages,
            max_templates,
        })
    }

    async fn release_quietly(proxy: &FprintDeviceProxy<'_>) {
        if let Err(e) = proxy.release().await {
            warn!("unable to release device ({e})");
        }
    }

    async fn with_claimed<F, Fut>(&self, device: &Device, op: F) -> core::result::Result<(), DeleteError>
    where
        F: FnOnce(FprintDeviceProxy<'static>) -> Fut,
        Fut: Future<Output = zbus::Result<()>>,
    {
        let proxy = FprintDeviceProxy::builder(&self.conn)
            .path(device.id.as_str().to_string())
            .map_err(|e| delete_error(&e))?
            .cache_properties(zbus::proxy::CacheProperties::No)
            .build()
            .await
            .map_err(|e| delete_error(&e))?;

        proxy.claim(&self.user).await.map_err(|e| delete_error(&e))?;

        let ret = op(proxy.clone()).await.map_err(|e| delete_error(&e));

        Self::release_quietly(&proxy).await;

        ret
    }
}

impl BiometricService for FprintdClient {
    async fn list_devices(&self) -> Result<Vec<Device>> {
        let paths = self.manager().await?.get_devices().await?;

        let mut devices = Vec::with_capacity(paths.len());

        for path in &paths {
            match self.describe(path).await {
                Ok(d) => devices.push(d),
                Err(e) => error!("unable to describe {} ({e})", path.as_str()),
            }
        }

        info!("found {} device(s)", devices.len());

        Ok(devices)
    }

    async fn list_fingers(&self, device: &Device) -> Result<Vec<EnrolledFinger>> {
        let proxy = self.device_proxy(&device.id).await?;

        let names = match proxy.list_enrolled_fingers(&self.user).await {
            Ok(v) => v,
            Err(e) if fprintd_error_name(&e) == Some("NoEnrolledPrints") => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut fingers = Vec::with_capacity(names.len());

        for name in &names {
            match name.parse::<FingerLabel>() {
                Ok(finger) => fingers.push(EnrolledFinger {
                    device: device.id.clone(),
                    finger,
                    index: fingers.len(),
                }),
                Err(e) => warn!("ignoring enrolled print ({e})"),
            }
        }

        Ok(fingers)
    }

    async fn start_enroll(&self, device: &Device, finger: FingerLabel) -> Result<EnrollSubscription> {
        let proxy = FprintDeviceProxy::builder(&self.conn)
            .path(device.id.as_str().to_string())?
            .cache_properties(zbus::proxy::CacheProperties::No)
            .build()
            .await?;

        proxy.claim(&self.user).await?;

        //
        // subscribe before starting so the first status can't be missed
        //
        let mut signals = match proxy.receive_enroll_status().await {
            Ok(v) => v,
            Err(e) => {
                Self::release_quietly(&proxy).await;
                return Err(e.into());
            }
        };

        if let Err(e) = proxy.enroll_start(finger.as_str()).await {
            error!("enroll start failed for {finger} ({e})");
            Self::release_quietly(&proxy).await;
            return Err(e.into());
        }

        info!("enrolling {finger} on {}", device.id);

        let (tx, rx) = mpsc::channel(ENROLL_EVENT_BACKLOG);

        let forwarder = tokio::spawn(async move {
            while let Some(signal) = signals.next().await {
                let event = match signal.args() {
                    Ok(args) => EnrollEvent::from_status(args.result(), *args.done()),
                    Err(e) => {
                        warn!("undecodable enroll status ({e})");
                        EnrollEvent::ScanRetry
                    }
                };

                if tx.send(event).await.is_err() || event.is_terminal() {
                    break;
                }
            }
            debug!("enroll status subscription closed");
        });

        Ok(EnrollSubscription::new(rx, Some(forwarder.abort_handle())))
    }

    async fn stop_enroll(&self, device: &Device) -> Result<()> {
        let proxy = self.device_proxy(&device.id).await?;

        let stopped = proxy.enroll_stop().await;

        Self::release_quietly(&proxy).await;

        match stopped {
            Ok(()) => Ok(()),
            // the daemon already ended the enrollment on its own
            Err(e) if fprintd_error_name(&e) == Some("NoActionInProgress") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_finger(&self, device: &Device, finger: FingerLabel) -> core::result::Result<(), DeleteError> {
        info!("deleting {finger} on {}", device.id);

        self.with_claimed(device, |proxy| async move { proxy.delete_enrolled_finger(finger.as_str()).await })
            .await
    }

    async fn delete_all_fingers(&self, device: &Device) -> core::result::Result<(), DeleteError> {
        info!("deleting all prints on {}", device.id);

        self.with_claimed(device, |proxy| async move { proxy.delete_enrolled_fingers2().await })
            .await
    }

    fn for_user(&self, user: &str) -> Self {
        Self {
            conn: self.conn.clone(),
            user: user.to_string(),
            default_stages: self.default_stages,
        }
    }
}
