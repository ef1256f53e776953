use std::{
    fs::{self, Permissions},
    io,
    os::{fd::AsRawFd, unix::fs::PermissionsExt},
    path::Path,
    sync::Arc,
};

use log::{error, info, warn};
use nix::unistd::{Uid, User};
use tokio::{
    net::{UnixListener, UnixStream},
    select,
    sync::{OwnedRwLockWriteGuard, RwLock, watch::Receiver},
};
use ufprint::{
    device::{DeviceId, FingerLabel},
    error::{DeleteError, Error, PolicyError, ProtocolError, Result},
    fprintd::{BiometricService, find_device},
    policy::{PolicyStore, PolicyTarget},
};

use crate::{
    authority::{Authority, Subject, authorize},
    channel::{read_message, write_message},
    messages::{ErrorKind, HelperOp, HelperRequest, HelperResponse, HelperResult, Payload},
};

const SOCKET_MODE: u32 = 0o666;

////////////////////////////////////////////////////////////////////////////////
// PRIVATE
////////////////////////////////////////////////////////////////////////////////

/// Collapse an internal error into what may cross the boundary. Details stay
/// in our log.
fn failure(e: &Error) -> HelperResult {
    match e {
        Error::Policy(PolicyError::Denied) | Error::Delete(DeleteError::Denied) => HelperResult::Denied,
        Error::Policy(p) => HelperResult::Failed((*p).into()),
        Error::Delete(d) => HelperResult::Failed((*d).into()),
        Error::DeviceNotFound(_) => HelperResult::Failed(ErrorKind::NotFound),
        Error::Protocol(ProtocolError::Timeout) => {
            info!("caller left before the change started, nothing changed");
            HelperResult::Failed(ErrorKind::Unavailable)
        }
        Error::Bus(_) => {
            error!("{e}");
            HelperResult::Failed(ErrorKind::BiometricUnavailable)
        }
        other => {
            error!("{other}");
            HelperResult::Failed(ErrorKind::Unavailable)
        }
    }
}

/// True once the peer closed its end. A pipelined request still counts as
/// somebody waiting.
fn peer_hung_up(client: &UnixStream) -> bool {
    let mut byte = 0u8;

    let ret = unsafe {
        libc::recv(
            client.as_raw_fd(),
            (&raw mut byte).cast::<libc::c_void>(),
            1,
            libc::MSG_PEEK | libc::MSG_DONTWAIT,
        )
    };

    match ret {
        0 => true,
        n if n > 0 => false,
        _ => io::Error::last_os_error().kind() != io::ErrorKind::WouldBlock,
    }
}

fn username(uid: u32) -> Result<String> {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => Ok(user.name),
        Ok(None) => Err(Error::UnknownUser(uid)),
        Err(e) => Err(io::Error::from(e).into()),
    }
}

////////////////////////////////////////////////////////////////////////////////
// PUBLIC
////////////////////////////////////////////////////////////////////////////////

/// Bind the helper socket, replacing a stale one. Anyone may connect, each
/// request is authorized on its own.
pub fn bind_socket<P>(path: P) -> Result<UnixListener>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    if path.exists() {
        warn!("removing stale socket {}", path.display());
        fs::remove_file(path)?;
    }

    info!("binding {}", path.display());

    let listener = UnixListener::bind(path)?;

    fs::set_permissions(path, Permissions::from_mode(SOCKET_MODE))?;

    Ok(listener)
}

pub struct HelperDispatcher<A, B> {
    authority: A,
    service: B,
    policy: Arc<RwLock<PolicyStore>>,
}

impl<A, B> HelperDispatcher<A, B>
where
    A: Authority + 'static,
    B: BiometricService + 'static,
{
    pub fn new(authority: A, service: B, policy: PolicyStore) -> Self {
        Self {
            authority,
            service,
            policy: Arc::new(RwLock::new(policy)),
        }
    }

    /// Exclusive store access for a mutation. Refused when the caller already
    /// gave up, a change only ever starts while someone waits for its answer.
    async fn writer<F>(&self, waiting: &F) -> Result<OwnedRwLockWriteGuard<PolicyStore>>
    where
        F: Fn() -> bool,
    {
        let store = self.policy.clone().write_owned().await;

        if !waiting() {
            return Err(ProtocolError::Timeout.into());
        }

        Ok(store)
    }

    async fn set_target<F>(&self, target: PolicyTarget, enabled: bool, waiting: &F) -> Result<Payload>
    where
        F: Fn() -> bool,
    {
        let store = self.writer(waiting).await?;

        tokio::task::spawn_blocking(move || store.set_target(target, enabled)).await??;

        Ok(Payload::Done)
    }

    async fn query_target(&self, target: PolicyTarget) -> Result<Payload> {
        let store = self.policy.clone().read_owned().await;

        let status = tokio::task::spawn_blocking(move || store.read_target(target)).await??;

        Ok(Payload::Status(status))
    }

    async fn delete<F>(
        &self,
        subject: &Subject,
        device: &DeviceId,
        finger: Option<FingerLabel>,
        waiting: &F,
    ) -> Result<Payload>
    where
        F: Fn() -> bool,
    {
        let _writer = self.writer(waiting).await?;

        // only act on a device the daemon lists right now
        let device = find_device(&self.service, device).await?;

        let service = self.service.for_user(&username(subject.uid)?);

        match finger {
            Some(finger) => service.delete_finger(&device, finger).await?,
            None => service.delete_all_fingers(&device).await?,
        }

        Ok(Payload::Done)
    }

    async fn execute<F>(&self, subject: &Subject, op: &HelperOp, waiting: &F) -> Result<Payload>
    where
        F: Fn() -> bool,
    {
        match op {
            HelperOp::EnableTarget(t) => self.set_target(*t, true, waiting).await,
            HelperOp::DisableTarget(t) => self.set_target(*t, false, waiting).await,
            HelperOp::QueryTargetStatus(t) => self.query_target(*t).await,
            HelperOp::AdminDeleteFinger { device, finger, .. } => {
                self.delete(subject, device, Some(*finger), waiting).await
            }
            HelperOp::AdminDeleteAllFingers { device, .. } => self.delete(subject, device, None, waiting).await,
        }
    }

    /// Answer a request from a caller known to wait for it.
    pub async fn handle_request(&self, subject: &Subject, request: HelperRequest) -> HelperResponse {
        self.serve(subject, request, &|| true).await
    }

    async fn serve<F>(&self, subject: &Subject, request: HelperRequest, waiting: &F) -> HelperResponse
    where
        F: Fn() -> bool + Sync,
    {
        let id = request.id;

        if let Err(kind) = request.validate() {
            warn!("{subject} sent an invalid request id={id} ({kind:?})");
            return HelperResponse::new(id, HelperResult::Failed(kind));
        }

        let action = request.op.action();

        let handle = match authorize(&self.authority, subject, action).await {
            Ok(Some(h)) => h,
            Ok(None) => return HelperResponse::new(id, HelperResult::Denied),
            Err(e) => {
                error!("authority check failed ({e})");
                return HelperResponse::new(id, HelperResult::Failed(ErrorKind::Unavailable));
            }
        };

        if !handle.redeem(action, subject) {
            return HelperResponse::new(id, HelperResult::Denied);
        }

        let result = match self.execute(subject, &request.op, waiting).await {
            Ok(payload) => HelperResult::Success(payload),
            Err(e) => failure(&e),
        };

        info!("{subject} {} -> {result}", request.op);

        HelperResponse::new(id, result)
    }

    async fn client_handler(self: Arc<Self>, mut client: UnixStream) -> Result<()> {
        let subject = Subject::from_peer(&client)?;

        info!("client {subject}");

        loop {
            let request: HelperRequest = match read_message(&mut client).await {
                Ok(v) => v,
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break Ok(()),
                Err(e) => {
                    warn!("undecodable request from {subject} ({e})");
                    write_message(&mut client, &HelperResponse::undecodable()).await?;
                    break Ok(());
                }
            };

            let response = self.serve(&subject, request, &|| !peer_hung_up(&client)).await;

            write_message(&mut client, &response).await?;
        }
    }

    pub async fn accept_loop(self: Arc<Self>, listener: UnixListener, mut quit_rx: Receiver<bool>) -> Result<()> {
        loop {
            select! {
                // this'll get signaled after a SIGTERM and we'll break out
                _ = quit_rx.changed() => break,
                accept_ret = listener.accept() => {
                    let (client, _) = match accept_ret {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept failure ({e})");
                            return Err(e.into());
                        }
                    };

                    let dispatcher = self.clone();

                    tokio::spawn(async move {
                        if let Err(e) = dispatcher.client_handler(client).await {
                            warn!("client dropped ({e})");
                        }
                    });
                },
            }
        }

        info!("waiting for in-flight changes");
        self.drain().await;

        Ok(())
    }

    /// Returns once no mutation is running.
    pub async fn drain(&self) {
        let _store = self.policy.write().await;
    }
}
