use std::{fs, sync::Arc};

use anyhow::{Result, bail};
use log::{error, info, warn};
use tokio::{
    select,
    signal::unix::{SignalKind, signal},
    sync::watch,
};
use ufprint::{config::Config, fprintd::FprintdClient, policy::PolicyStore};
use ufprint_helper::{
    authority::PolkitAuthority,
    dispatcher::{HelperDispatcher, bind_socket},
};

async fn signal_handlers() -> Result<()> {
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    loop {
        select! {
            _ = sighup.recv() => {
                info!("ignoring SIGHUP");
            }
            _ = sigint.recv() => {
                info!("received SIGINT. We're leaving");
                break Ok(())
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM. We're leaving");
                break Ok(())
            }
        }
    }
}

pub async fn command_helper(config: &Config) -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        bail!("The helper must run as root");
    }

    let service = FprintdClient::system(config.enroll.default_stages).await?;
    let authority = PolkitAuthority::system().await?;
    let store = PolicyStore::from_config(&config.policy);

    let socket_path = &config.helper.socket_path;
    let listener = bind_socket(socket_path)?;

    let dispatcher = Arc::new(HelperDispatcher::new(authority, service, store));

    let (quit_tx, quit_rx) = watch::channel(false);

    let mut server = tokio::spawn(dispatcher.accept_loop(listener, quit_rx));

    let ret = loop {
        select! {
            ret = signal_handlers() => {
                ret?;
                quit_tx.send(true)?;
            }
            ret = &mut server => {
                warn!("dispatcher returned, we're done");
                break ret;
            }
        }
    };

    if let Err(e) = fs::remove_file(socket_path) {
        error!("unable to remove {} ({e})", socket_path.display());
    }

    ret??;

    Ok(())
}
