use anyhow::Result;
use clap::Args;
use tabled::{Table, Tabled, settings::Style};
use ufprint::{
    config::Config,
    device::{Device, DeviceId, EnrolledFinger, ScanType},
    fprintd::BiometricService,
};

use crate::common::{fprintd, pick_device};

#[derive(Args)]
pub struct DeviceArgs {
    /// device object path, defaults to the first reader
    #[arg(short, long)]
    pub device: Option<DeviceId>,
}

#[derive(Tabled)]
struct DeviceTable<'a> {
    id: &'a str,
    name: &'a str,
    scan: &'static str,
    stages: u32,
}

#[derive(Tabled)]
struct FingerTable {
    index: usize,
    finger: String,
    label: &'static str,
}

fn display_devices(devices: &[Device]) {
    let rows: Vec<DeviceTable<'_>> = devices
        .iter()
        .map(|d| DeviceTable {
            id: d.id.as_str(),
            name: &d.name,
            scan: match d.scan_type {
                ScanType::Press => "press",
                ScanType::Swipe => "swipe",
            },
            stages: d.enroll_stages,
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::modern());

    println!("{table}");
}

fn display_fingers(fingers: &[EnrolledFinger]) {
    let rows: Vec<FingerTable> = fingers
        .iter()
        .map(|f| FingerTable {
            index: f.index,
            finger: f.finger.display_name(),
            label: f.finger.as_str(),
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::modern());

    println!("{table}");
}

pub async fn command_devices(config: &Config) -> Result<()> {
    let service = fprintd(config).await?;

    let devices = service.list_devices().await?;

    if devices.is_empty() {
        println!("No fingerprint reader found");
    } else {
        display_devices(&devices);
    }

    Ok(())
}

pub async fn command_fingers(config: &Config, args: DeviceArgs) -> Result<()> {
    let service = fprintd(config).await?;

    let device = pick_device(&service, args.device.as_ref()).await?;

    let fingers = service.list_fingers(&device).await?;

    if fingers.is_empty() {
        println!("No fingerprints enrolled on {}", device.name);
    } else {
        display_fingers(&fingers);
    }

    Ok(())
}
