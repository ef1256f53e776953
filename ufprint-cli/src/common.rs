use anyhow::Result;
use log::info;
use ufprint::{
    config::Config,
    device::{Device, DeviceId, ScanType},
    enroll::{EnrollState, Guidance},
    error::Error,
    fprintd::{BiometricService, FailReason, FprintdClient, find_device},
};

pub async fn fprintd(config: &Config) -> Result<FprintdClient> {
    let client = FprintdClient::system(config.enroll.default_stages).await?;
    Ok(client)
}

/// The requested reader, or the first one the daemon lists.
pub async fn pick_device<B>(service: &B, id: Option<&DeviceId>) -> Result<Device>
where
    B: BiometricService,
{
    let device = match id {
        Some(id) => find_device(service, id).await?,
        None => {
            let Some(device) = service.list_devices().await?.into_iter().next() else {
                return Err(Error::NoDevice.into());
            };
            device
        }
    };

    info!("using {} ({})", device.name, device.id);

    Ok(device)
}

#[must_use]
pub fn guidance_text(guidance: Guidance, scan_type: ScanType) -> String {
    let verb = match scan_type {
        ScanType::Press => "place",
        ScanType::Swipe => "swipe",
    };

    match guidance {
        Guidance::ScanCaptured { scan, required } if scan >= required => {
            format!("Scan {scan}/{required} captured, {verb} your finger once more to verify")
        }
        Guidance::ScanCaptured { scan, required } => {
            format!("Scan {scan}/{required} captured, lift and {verb} your finger again")
        }
        Guidance::RetryTooShort => "Swipe was too short, try again".to_string(),
        Guidance::RetrySwipeDirection => "Swipe was too fast or crooked, try again".to_string(),
        Guidance::RetryCenterFinger => "Finger was not centered on the reader, try again".to_string(),
        Guidance::RetryRemoveFinger => "Remove your finger and try again".to_string(),
        Guidance::Retry => "Could not read that scan, try again".to_string(),
    }
}

#[must_use]
pub fn fail_text(reason: FailReason) -> &'static str {
    match reason {
        FailReason::DeviceFailure => "the reader reported a failure",
        FailReason::DataFull => "the reader has no room for more fingerprints",
        FailReason::Duplicate => "this finger is already enrolled",
        FailReason::DeviceDisconnected => "the reader was disconnected",
        FailReason::ServiceLost => "lost contact with the fingerprint service",
        FailReason::Unknown => "unknown error",
    }
}

#[must_use]
pub fn state_text(state: EnrollState) -> String {
    match state {
        EnrollState::Idle => "idle".to_string(),
        EnrollState::AwaitingFirstScan => "waiting for the first scan".to_string(),
        EnrollState::Scanning(n) => format!("{n} scan(s) captured"),
        EnrollState::Verifying => "verifying".to_string(),
        EnrollState::Completed => "completed".to_string(),
        EnrollState::Failed(reason) => format!("failed, {}", fail_text(reason)),
        EnrollState::Cancelled => "cancelled".to_string(),
    }
}
