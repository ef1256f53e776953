use anyhow::{Result, bail};
use clap::Args;
use tabled::{Table, Tabled, settings::Style};
use ufprint::{
    config::Config,
    error::{Error, PolicyError},
    policy::{PolicyTarget, TargetStatus},
};
use ufprint_helper::client::HelperClient;

#[derive(Args)]
pub struct TargetArgs {
    /// login, terminal (sudo) or privilege-escalation (polkit)
    pub target: PolicyTarget,
}

#[derive(Tabled)]
struct StatusTable {
    target: &'static str,
    file: String,
    status: String,
}

async fn set_target(config: &Config, target: PolicyTarget, enabled: bool) -> Result<()> {
    let client = HelperClient::from_config(&config.helper);

    match client.set_target(target, enabled).await {
        Ok(()) => {}
        Err(Error::Policy(PolicyError::PolicyCorrupted)) => {
            let path = config.policy.pam_dir.join(target.file_name());
            bail!(
                "{} has a repeated or misplaced pam_fprintd line, fix it by hand and retry",
                path.display()
            )
        }
        Err(e) => return Err(e.into()),
    }

    let state = if enabled { "enabled" } else { "disabled" };
    println!("Fingerprint authentication {state} for {target}");

    Ok(())
}

pub async fn command_enable(config: &Config, args: TargetArgs) -> Result<()> {
    set_target(config, args.target, true).await
}

pub async fn command_disable(config: &Config, args: TargetArgs) -> Result<()> {
    set_target(config, args.target, false).await
}

pub async fn command_status(config: &Config) -> Result<()> {
    let client = HelperClient::from_config(&config.helper);

    let mut rows = Vec::with_capacity(PolicyTarget::ALL.len());

    for target in PolicyTarget::ALL {
        let status = match client.query_target_status(target).await {
            Ok(TargetStatus::Enabled) => "enabled".to_string(),
            Ok(TargetStatus::Disabled) => "disabled".to_string(),
            Ok(TargetStatus::Malformed) => "malformed, review manually".to_string(),
            Err(e) => format!("unknown ({e})"),
        };

        rows.push(StatusTable {
            target: target.as_str(),
            file: config.policy.pam_dir.join(target.file_name()).display().to_string(),
            status,
        });
    }

    let mut table = Table::new(rows);
    table.with(Style::modern());

    println!("{table}");

    Ok(())
}
