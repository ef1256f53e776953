use std::{collections::HashMap, fmt::Display, fs, future::Future, os::fd::AsRawFd};

use log::{info, warn};
use tokio::net::UnixStream;
use ufprint::error::{Error, Result};
use zbus::{Connection, proxy, zvariant::Value};

const ALLOW_USER_INTERACTION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    PolicyQuery,
    PolicyModify,
    FingersDelete,
}

impl Action {
    #[must_use]
    pub fn id(self) -> &'static str {
        match self {
            Self::PolicyQuery => "org.ufprint.policy.query",
            Self::PolicyModify => "org.ufprint.policy.modify",
            Self::FingersDelete => "org.ufprint.fingers.delete",
        }
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// The process on the other end of a helper connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
    /// field 22 of /proc/<pid>/stat, guards against pid reuse
    pub start_time: u64,
}

fn peer_credentials(client: &UnixStream) -> Result<libc::ucred> {
    let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = libc::socklen_t::try_from(std::mem::size_of::<libc::ucred>())?;

    let ret = unsafe {
        libc::getsockopt(
            client.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            (&raw mut cred).cast::<libc::c_void>(),
            &raw mut len,
        )
    };

    if ret == 0 {
        Ok(cred)
    } else {
        Err(Error::ClientPidNotFound)
    }
}

fn process_start_time(pid: u32) -> Result<u64> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat"))?;

    // comm may contain spaces and parens, fields resume after the last ')'
    let (_, fields) = stat.rsplit_once(')').ok_or(Error::ProcessStartTime(pid))?;

    fields
        .split_whitespace()
        .nth(19)
        .and_then(|v| v.parse().ok())
        .ok_or(Error::ProcessStartTime(pid))
}

impl Subject {
    pub fn from_peer(client: &UnixStream) -> Result<Self> {
        let cred = peer_credentials(client)?;

        let pid = u32::try_from(cred.pid)?;
        let start_time = process_start_time(pid)?;

        Ok(Self {
            pid,
            uid: cred.uid,
            gid: cred.gid,
            start_time,
        })
    }
}

impl Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pid={} uid={}", self.pid, self.uid)
    }
}

/// Proof of one granted action for one subject. Redeeming consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct AuthorizationHandle {
    action: Action,
    pid: u32,
    start_time: u64,
}

impl AuthorizationHandle {
    #[must_use]
    pub fn new(action: Action, subject: &Subject) -> Self {
        Self {
            action,
            pid: subject.pid,
            start_time: subject.start_time,
        }
    }

    #[must_use]
    pub fn redeem(self, action: Action, subject: &Subject) -> bool {
        self.action == action && self.pid == subject.pid && self.start_time == subject.start_time
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Decision {
    Granted(AuthorizationHandle),
    Denied,
    InteractionRequired,
}

pub trait Authority: Send + Sync {
    fn check(
        &self,
        subject: &Subject,
        action: Action,
        allow_interaction: bool,
    ) -> impl Future<Output = Result<Decision>> + Send;
}

/// Ask quietly first, then let the authority prompt if it wants to.
pub async fn authorize<A>(authority: &A, subject: &Subject, action: Action) -> Result<Option<AuthorizationHandle>>
where
    A: Authority,
{
    let decision = match authority.check(subject, action, false).await? {
        Decision::InteractionRequired => {
            info!("{action} needs interaction for {subject}");
            authority.check(subject, action, true).await?
        }
        other => other,
    };

    match decision {
        Decision::Granted(handle) => Ok(Some(handle)),
        Decision::Denied | Decision::InteractionRequired => {
            warn!("{action} denied for {subject}");
            Ok(None)
        }
    }
}

#[proxy(
    interface = "org.freedesktop.PolicyKit1.Authority",
    default_service = "org.freedesktop.PolicyKit1",
    default_path = "/org/freedesktop/PolicyKit1/Authority",
    gen_blocking = false
)]
trait PolicyKit {
    #[zbus(name = "CheckAuthorization")]
    fn check_authorization(
        &self,
        subject: &(&str, HashMap<&str, Value<'_>>),
        action_id: &str,
        details: HashMap<&str, &str>,
        flags: u32,
        cancellation_id: &str,
    ) -> zbus::Result<(bool, bool, HashMap<String, String>)>;
}

pub struct PolkitAuthority {
    conn: Connection,
}

impl PolkitAuthority {
    pub async fn system() -> Result<Self> {
        let conn = Connection::system().await?;
        Ok(Self { conn })
    }
}

impl Authority for PolkitAuthority {
    async fn check(&self, subject: &Subject, action: Action, allow_interaction: bool) -> Result<Decision> {
        let proxy = PolicyKitProxy::new(&self.conn).await?;

        let uid = i32::try_from(subject.uid)?;

        let mut details = HashMap::new();
        details.insert("pid", Value::from(subject.pid));
        details.insert("start-time", Value::from(subject.start_time));
        details.insert("uid", Value::from(uid));

        let flags = if allow_interaction { ALLOW_USER_INTERACTION } else { 0 };

        let (authorized, challenge, _) = proxy
            .check_authorization(&("unix-process", details), action.id(), HashMap::new(), flags, "")
            .await?;

        let decision = match (authorized, challenge) {
            (true, _) => Decision::Granted(AuthorizationHandle::new(action, subject)),
            (false, true) => Decision::InteractionRequired,
            (false, false) => Decision::Denied,
        };

        Ok(decision)
    }
}
