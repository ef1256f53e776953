use anyhow::{Result, bail};
use clap::Args;
use dialoguer::{Confirm, theme::ColorfulTheme};
use log::warn;
use ufprint::{
    config::Config,
    device::{ConfirmationToken, DeviceId, FingerLabel},
    enroll::{Enroller, lockout_risk},
    fprintd::BiometricService,
    policy::{PolicyTarget, TargetStatus},
};
use ufprint_helper::client::HelperClient;

use crate::common::{fprintd, pick_device};

#[derive(Args)]
pub struct DeleteArgs {
    /// finger to delete, e.g. right-index
    pub finger: FingerLabel,

    /// device object path, defaults to the first reader
    #[arg(short, long)]
    pub device: Option<DeviceId>,

    /// don't ask
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Args)]
pub struct DeleteAllArgs {
    /// device object path, defaults to the first reader
    #[arg(short, long)]
    pub device: Option<DeviceId>,

    /// don't ask
    #[arg(short, long)]
    pub yes: bool,
}

fn confirm(prompt: &str) -> Result<bool> {
    let ret = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(ret)
}

/// Whatever statuses the helper is willing to tell us.
async fn known_statuses(client: &HelperClient) -> Vec<TargetStatus> {
    let mut statuses = Vec::with_capacity(PolicyTarget::ALL.len());

    for target in PolicyTarget::ALL {
        match client.query_target_status(target).await {
            Ok(v) => statuses.push(v),
            Err(e) => warn!("unable to query {target} ({e})"),
        }
    }

    statuses
}

/// Both the plain confirmation and, when the last print is about to go while
/// fingerprint login is on, the lockout one.
fn confirmed(what: &str, risky: bool, yes: bool) -> Result<bool> {
    if risky {
        println!("Warning: this removes your last fingerprint while fingerprint authentication is enabled");
    }

    if yes {
        return Ok(true);
    }

    if !confirm(&format!("Delete {what}?"))? {
        return Ok(false);
    }

    if risky && !confirm("Delete it anyway? Disable fingerprint authentication first to be safe")? {
        return Ok(false);
    }

    Ok(true)
}

pub async fn command_delete(config: &Config, args: DeleteArgs) -> Result<()> {
    let service = fprintd(config).await?;
    let device = pick_device(&service, args.device.as_ref()).await?;

    let enrolled = service.list_fingers(&device).await?;

    if !enrolled.iter().any(|f| f.finger == args.finger) {
        bail!("{} is not enrolled on {}", args.finger.display_name(), device.name);
    }

    let client = HelperClient::from_config(&config.helper);

    let risky = lockout_risk(&enrolled, Some(args.finger), &known_statuses(&client).await);

    let what = args.finger.display_name();

    if !confirmed(&what, risky, args.yes)? {
        println!("Nothing deleted");
        return Ok(());
    }

    let token = ConfirmationToken::for_finger(args.finger);

    Enroller::new(service)
        .delete(&client, &device.id, args.finger, Some(token))
        .await?;

    println!("{what} deleted");

    Ok(())
}

pub async fn command_delete_all(config: &Config, args: DeleteAllArgs) -> Result<()> {
    let service = fprintd(config).await?;
    let device = pick_device(&service, args.device.as_ref()).await?;

    let enrolled = service.list_fingers(&device).await?;

    if enrolled.is_empty() {
        println!("No fingerprints enrolled on {}", device.name);
        return Ok(());
    }

    let client = HelperClient::from_config(&config.helper);

    let risky = lockout_risk(&enrolled, None, &known_statuses(&client).await);

    let what = format!("all {} fingerprint(s) on {}", enrolled.len(), device.name);

    if !confirmed(&what, risky, args.yes)? {
        println!("Nothing deleted");
        return Ok(());
    }

    let token = ConfirmationToken::for_all(&device.id);

    Enroller::new(service)
        .delete_all(&client, &device.id, Some(token))
        .await?;

    println!("Fingerprints deleted");

    Ok(())
}
