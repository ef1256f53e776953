use anyhow::{Result, bail};
use clap::Args;
use log::{error, warn};
use ufprint::{
    config::Config,
    device::{DeviceId, FingerLabel},
    enroll::{EnrollState, Enroller},
    error::{Error, SessionError},
};

use crate::common::{fail_text, fprintd, guidance_text, pick_device, state_text};

#[derive(Args)]
pub struct EnrollArgs {
    /// finger to enroll, e.g. right-index
    pub finger: FingerLabel,

    /// device object path, defaults to the first reader
    #[arg(short, long)]
    pub device: Option<DeviceId>,
}

pub async fn command_enroll(config: &Config, args: EnrollArgs) -> Result<()> {
    let service = fprintd(config).await?;

    let device = pick_device(&service, args.device.as_ref()).await?;

    let mut enroller = Enroller::new(service);

    let handle = match enroller.start(&device, args.finger).await {
        Ok(v) => v,
        Err(Error::Session(SessionError::InvalidFinger)) => {
            bail!("{} is already enrolled on {}", args.finger.display_name(), device.name)
        }
        Err(e) => return Err(e.into()),
    };

    println!("Enrolling {} on {}", args.finger.display_name(), device.name);
    println!("Scan your finger {} times, Ctrl-C to cancel", device.enroll_stages);

    let ctrl_c = tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("unable to wait for Ctrl-C ({e})");
            return;
        }

        if let Err(e) = handle.cancel() {
            warn!("nothing to cancel ({e})");
        }
    });

    let state = loop {
        let update = enroller.next_update().await?;

        match update.guidance {
            Some(g) if g.is_retry() => eprintln!("{}", guidance_text(g, device.scan_type)),
            Some(g) => println!("{}", guidance_text(g, device.scan_type)),
            None => {}
        }

        if update.state.is_terminal() {
            break update.state;
        }
    };

    ctrl_c.abort();

    match state {
        EnrollState::Completed => {
            println!("{} enrolled", args.finger.display_name());
            Ok(())
        }
        EnrollState::Cancelled => {
            println!("Enrollment cancelled");
            Ok(())
        }
        EnrollState::Failed(reason) => bail!("Enrollment failed, {}", fail_text(reason)),
        other => bail!("Enrollment ended {}", state_text(other)),
    }
}
