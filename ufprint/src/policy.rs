use std::{
    fmt::Display,
    fs::{self, File, Permissions},
    io::{self, Write},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    str::FromStr,
};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::{
    config::PolicyConfig,
    error::{Error, PolicyError},
};

/// A target is fingerprint-enabled when its file holds exactly one of these,
/// right before the auth stack.
pub const MARKER_LINE: &str = "auth sufficient pam_fprintd.so";

const LOGIN_GATES: [&str; 2] = ["pam_nologin.so", "pam_securetty.so"];
const PAM_HEADER: &str = "#%PAM-1.0\n";
const DEFAULT_MODE: u32 = 0o644;
const TEMP_PREFIX: &str = ".ufprint-";

type PolicyResult<T> = core::result::Result<T, PolicyError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyTarget {
    Login,
    Terminal,
    PrivilegeEscalation,
}

impl PolicyTarget {
    pub const ALL: [Self; 3] = [Self::Login, Self::Terminal, Self::PrivilegeEscalation];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Terminal => "terminal",
            Self::PrivilegeEscalation => "privilege-escalation",
        }
    }

    /// PAM service file backing the target.
    #[must_use]
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Terminal => "sudo",
            Self::PrivilegeEscalation => "polkit-1",
        }
    }
}

impl FromStr for PolicyTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "login" => Ok(Self::Login),
            "terminal" | "sudo" => Ok(Self::Terminal),
            "privilege-escalation" | "polkit" | "polkit-1" => Ok(Self::PrivilegeEscalation),
            other => Err(Error::UnknownTarget(other.to_string())),
        }
    }
}

impl Display for PolicyTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetStatus {
    Enabled,
    Disabled,
    Malformed,
}

impl TargetStatus {
    fn wanted(enabled: bool) -> Self {
        if enabled { Self::Enabled } else { Self::Disabled }
    }
}

////////////////////////////////////////////////////////////////////////////////
// PRIVATE
////////////////////////////////////////////////////////////////////////////////

fn is_marker(line: &str) -> bool {
    line.starts_with(MARKER_LINE)
}

fn is_auth_line(line: &str) -> bool {
    let mut words = line.split_whitespace();

    match words.next() {
        Some("auth" | "-auth") => true,
        Some("@include") => words.next().is_some_and(|w| w.contains("auth")),
        _ => false,
    }
}

fn is_login_gate(line: &str) -> bool {
    is_auth_line(line)
        && line
            .split_whitespace()
            .filter_map(|w| w.rsplit('/').next())
            .any(|w| LOGIN_GATES.contains(&w))
}

fn leading_block_end(lines: &[&str]) -> usize {
    lines
        .iter()
        .position(|l| {
            let l = l.trim();
            !l.is_empty() && !l.starts_with('#')
        })
        .unwrap_or(lines.len())
}

/// Where the marker belongs in a file that does not carry it.
fn canonical_index(target: PolicyTarget, lines: &[&str]) -> usize {
    let floor = match target {
        PolicyTarget::Login => lines.iter().rposition(|l| is_login_gate(l)).map_or(0, |i| i + 1),
        _ => 0,
    };

    match lines[floor..].iter().position(|l| is_auth_line(l)) {
        Some(i) => floor + i,
        None if floor > 0 => floor,
        None => leading_block_end(lines),
    }
}

fn io_failure(path: &Path, e: &io::Error) -> PolicyError {
    error!("{} ({e})", path.display());
    PolicyError::IoFailure
}

fn replace_failure(path: &Path, e: &io::Error) -> PolicyError {
    error!("atomic replace of {} failed ({e})", path.display());
    PolicyError::AtomicReplaceFailed
}

struct Snapshot {
    content: String,
    mode: u32,
}

////////////////////////////////////////////////////////////////////////////////
// PUBLIC
////////////////////////////////////////////////////////////////////////////////

#[must_use]
pub fn status_of(target: PolicyTarget, content: &str) -> TargetStatus {
    let lines: Vec<&str> = content.split_inclusive('\n').collect();

    let markers: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| is_marker(l))
        .map(|(i, _)| i)
        .collect();

    match markers.as_slice() {
        [] => TargetStatus::Disabled,
        [at] => {
            if lines[*at].trim_end() != MARKER_LINE {
                return TargetStatus::Malformed;
            }

            let mut rest = lines.clone();
            rest.remove(*at);

            if canonical_index(target, &rest) == *at {
                TargetStatus::Enabled
            } else {
                TargetStatus::Malformed
            }
        }
        _ => TargetStatus::Malformed,
    }
}

/// New file content with the marker present (`enabled`) or absent. Input that
/// already matches is returned unchanged.
pub fn apply_marker(target: PolicyTarget, content: &str, enabled: bool) -> PolicyResult<String> {
    let lines: Vec<&str> = content.split_inclusive('\n').collect();

    match (status_of(target, content), enabled) {
        (TargetStatus::Malformed, _) => Err(PolicyError::PolicyCorrupted),
        (TargetStatus::Enabled, true) | (TargetStatus::Disabled, false) => Ok(content.to_string()),
        (TargetStatus::Disabled, true) => {
            let at = canonical_index(target, &lines);

            let mut out = String::with_capacity(content.len() + MARKER_LINE.len() + 2);
            lines[..at].iter().for_each(|l| out.push_str(l));

            // the marker is always a whole line of its own
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }

            out.push_str(MARKER_LINE);
            out.push('\n');

            lines[at..].iter().for_each(|l| out.push_str(l));

            Ok(out)
        }
        (TargetStatus::Enabled, false) => {
            let at = lines.iter().position(|l| is_marker(l)).ok_or(PolicyError::PolicyCorrupted)?;

            let mut out = String::with_capacity(content.len());
            lines
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != at)
                .for_each(|(_, l)| out.push_str(l));

            Ok(out)
        }
    }
}

/// Temp file holding the next version of a policy file. Dropping it without
/// [`StagedCommit::commit`] removes the temp file and leaves the target as is.
#[derive(Debug)]
pub struct StagedCommit {
    temp: NamedTempFile,
    target: PathBuf,
}

impl StagedCommit {
    pub fn commit(self) -> PolicyResult<()> {
        let Self { temp, target } = self;

        temp.persist(&target).map_err(|e| replace_failure(&target, &e.error))?;

        let Some(dir) = target.parent() else {
            return Ok(());
        };

        if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
            warn!("unable to sync {} ({e})", dir.display());
        }

        Ok(())
    }
}

/// Files are only ever replaced through a same-directory temp file and a
/// rename.
#[derive(Debug, Clone)]
pub struct PolicyStore {
    pam_dir: PathBuf,
    vendor_dir: PathBuf,
}

impl PolicyStore {
    pub fn new<P, Q>(pam_dir: P, vendor_dir: Q) -> Self
    where
        P: Into<PathBuf>,
        Q: Into<PathBuf>,
    {
        Self {
            pam_dir: pam_dir.into(),
            vendor_dir: vendor_dir.into(),
        }
    }

    #[must_use]
    pub fn from_config(config: &PolicyConfig) -> Self {
        Self::new(&config.pam_dir, &config.vendor_dir)
    }

    #[must_use]
    pub fn path(&self, target: PolicyTarget) -> PathBuf {
        self.pam_dir.join(target.file_name())
    }

    fn load(&self, target: PolicyTarget) -> PolicyResult<Option<Snapshot>> {
        let path = self.path(target);

        let meta = match fs::symlink_metadata(&path) {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_failure(&path, &e)),
        };

        if !meta.file_type().is_file() {
            error!("{} is not a regular file", path.display());
            return Err(PolicyError::PolicyCorrupted);
        }

        let bytes = fs::read(&path).map_err(|e| io_failure(&path, &e))?;

        let content = String::from_utf8(bytes).map_err(|_| {
            error!("{} is not valid utf-8", path.display());
            PolicyError::PolicyCorrupted
        })?;

        Ok(Some(Snapshot {
            content,
            mode: meta.permissions().mode() & 0o7777,
        }))
    }

    fn seed(&self, target: PolicyTarget) -> PolicyResult<String> {
        if target != PolicyTarget::PrivilegeEscalation {
            error!("{} is missing, refusing to create it", self.path(target).display());
            return Err(PolicyError::IoFailure);
        }

        let vendor = self.vendor_dir.join(target.file_name());

        match fs::read_to_string(&vendor) {
            Ok(v) => {
                info!("seeding {target} from {}", vendor.display());
                Ok(v)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(PAM_HEADER.to_string()),
            Err(e) => Err(io_failure(&vendor, &e)),
        }
    }

    pub fn read_target(&self, target: PolicyTarget) -> PolicyResult<TargetStatus> {
        let status = match self.load(target)? {
            Some(snapshot) => status_of(target, &snapshot.content),
            None => TargetStatus::Disabled,
        };

        debug!("{target} is {status:?}");

        Ok(status)
    }

    /// Write `content` next to the target without touching the target yet.
    pub fn stage(&self, target: PolicyTarget, content: &str, mode: u32) -> PolicyResult<StagedCommit> {
        let path = self.path(target);

        let mut temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&self.pam_dir)
            .map_err(|e| replace_failure(&path, &e))?;

        temp.write_all(content.as_bytes())
            .and_then(|()| temp.as_file().set_permissions(Permissions::from_mode(mode)))
            .and_then(|()| temp.as_file().sync_all())
            .map_err(|e| replace_failure(&path, &e))?;

        Ok(StagedCommit { temp, target: path })
    }

    pub fn set_target(&self, target: PolicyTarget, enabled: bool) -> PolicyResult<()> {
        let wanted = TargetStatus::wanted(enabled);

        let (current, mode, existed) = match self.load(target)? {
            Some(snapshot) => (snapshot.content, snapshot.mode, true),
            None if !enabled => {
                debug!("{target} has no file, nothing to disable");
                return Ok(());
            }
            None => (self.seed(target)?, DEFAULT_MODE, false),
        };

        match status_of(target, &current) {
            TargetStatus::Malformed => {
                error!("{} has a misplaced or repeated fingerprint line", self.path(target).display());
                return Err(PolicyError::PolicyCorrupted);
            }
            status if status == wanted && existed => {
                debug!("{target} already {status:?}");
                return Ok(());
            }
            _ => {}
        }

        let next = apply_marker(target, &current, enabled)?;

        self.stage(target, &next, mode)?.commit()?;

        let after = self.read_target(target)?;

        if after != wanted {
            error!("{target} reads {after:?} after commit, expected {wanted:?}");
            return Err(PolicyError::VerificationFailed);
        }

        info!("fingerprint {} for {target}", if enabled { "enabled" } else { "disabled" });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::os::unix::fs::MetadataExt;

    use super::*;

    const SUDO: &str = "#%PAM-1.0\n\
        # sudo\n\
        \n\
        auth       include      system-auth\n\
        account    include      system-auth\n\
        session    include      system-auth\n";

    const LOGIN: &str = "#%PAM-1.0\n\
        auth       requisite    pam_nologin.so\n\
        auth       include      system-local-login\n\
        account    include      system-local-login\n";

    fn store() -> (tempfile::TempDir, PolicyStore) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("pam.d")).unwrap();
        fs::create_dir(dir.path().join("vendor")).unwrap();
        let store = PolicyStore::new(dir.path().join("pam.d"), dir.path().join("vendor"));
        (dir, store)
    }

    fn temp_leftovers(store: &PolicyStore) -> usize {
        fs::read_dir(&store.pam_dir)
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().starts_with(TEMP_PREFIX))
            .count()
    }

    #[test]
    fn enable_then_disable_is_byte_identical() {
        let (_dir, store) = store();
        let path = store.path(PolicyTarget::Terminal);
        fs::write(&path, SUDO).unwrap();

        store.set_target(PolicyTarget::Terminal, true).unwrap();
        assert_eq!(store.read_target(PolicyTarget::Terminal).unwrap(), TargetStatus::Enabled);

        let enabled = fs::read_to_string(&path).unwrap();
        let marker = enabled.lines().position(|l| l == MARKER_LINE).unwrap();
        let first_auth = enabled.lines().position(|l| l.starts_with("auth       include")).unwrap();
        assert_eq!(marker + 1, first_auth);

        store.set_target(PolicyTarget::Terminal, false).unwrap();
        assert_eq!(store.read_target(PolicyTarget::Terminal).unwrap(), TargetStatus::Disabled);
        assert_eq!(fs::read_to_string(&path).unwrap(), SUDO);
        assert_eq!(temp_leftovers(&store), 0);
    }

    #[test]
    fn same_state_twice_writes_nothing() {
        let (_dir, store) = store();
        let path = store.path(PolicyTarget::Terminal);
        fs::write(&path, SUDO).unwrap();

        store.set_target(PolicyTarget::Terminal, true).unwrap();
        let inode = fs::metadata(&path).unwrap().ino();
        let bytes = fs::read(&path).unwrap();

        store.set_target(PolicyTarget::Terminal, true).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().ino(), inode);
        assert_eq!(fs::read(&path).unwrap(), bytes);

        store.set_target(PolicyTarget::Terminal, false).unwrap();
        let inode = fs::metadata(&path).unwrap().ino();
        store.set_target(PolicyTarget::Terminal, false).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().ino(), inode);
    }

    #[test]
    fn two_markers_are_corrupted() {
        let (_dir, store) = store();
        let path = store.path(PolicyTarget::Terminal);
        let content = format!("#%PAM-1.0\n{MARKER_LINE}\n{MARKER_LINE}\nauth include system-auth\n");
        fs::write(&path, &content).unwrap();

        assert_eq!(store.read_target(PolicyTarget::Terminal).unwrap(), TargetStatus::Malformed);
        assert_eq!(
            store.set_target(PolicyTarget::Terminal, false),
            Err(PolicyError::PolicyCorrupted)
        );
        assert_eq!(
            store.set_target(PolicyTarget::Terminal, true),
            Err(PolicyError::PolicyCorrupted)
        );
        assert_eq!(fs::read_to_string(&path).unwrap(), content);
    }

    #[test]
    fn misplaced_or_modified_marker_is_malformed() {
        let below = format!("auth include system-auth\n{MARKER_LINE}\n");
        assert_eq!(status_of(PolicyTarget::Terminal, &below), TargetStatus::Malformed);

        let with_args = format!("{MARKER_LINE} max-tries=3\nauth include system-auth\n");
        assert_eq!(status_of(PolicyTarget::Terminal, &with_args), TargetStatus::Malformed);

        let commented = format!("#{MARKER_LINE}\nauth include system-auth\n");
        assert_eq!(status_of(PolicyTarget::Terminal, &commented), TargetStatus::Disabled);
    }

    #[test]
    fn login_gates_stay_above_marker() {
        let enabled = apply_marker(PolicyTarget::Login, LOGIN, true).unwrap();
        let lines: Vec<&str> = enabled.lines().collect();

        assert!(lines[1].contains("pam_nologin.so"));
        assert_eq!(lines[2], MARKER_LINE);
        assert_eq!(status_of(PolicyTarget::Login, &enabled), TargetStatus::Enabled);

        // the same placement is wrong for a target without gates
        assert_eq!(status_of(PolicyTarget::Terminal, &enabled), TargetStatus::Malformed);
    }

    #[test]
    fn debian_include_counts_as_auth() {
        let content = "#\n@include common-auth\n@include common-account\n";
        let enabled = apply_marker(PolicyTarget::Terminal, content, true).unwrap();

        assert_eq!(enabled, format!("#\n{MARKER_LINE}\n@include common-auth\n@include common-account\n"));
    }

    #[test]
    fn unterminated_file_round_trips() {
        let content = "#%PAM-1.0\n# nothing here";
        let enabled = apply_marker(PolicyTarget::Terminal, content, true).unwrap();

        assert_eq!(enabled, format!("{content}\n{MARKER_LINE}\n"));
        assert_eq!(status_of(PolicyTarget::Terminal, &enabled), TargetStatus::Enabled);
        assert_eq!(
            apply_marker(PolicyTarget::Terminal, &enabled, false).unwrap(),
            format!("{content}\n")
        );

        let empty = apply_marker(PolicyTarget::Terminal, "", true).unwrap();
        assert_eq!(empty, format!("{MARKER_LINE}\n"));
        assert_eq!(apply_marker(PolicyTarget::Terminal, &empty, false).unwrap(), "");
    }

    #[test]
    fn hand_written_unterminated_marker_leaves_other_lines() {
        let content = format!("#%PAM-1.0\n{MARKER_LINE}");
        assert_eq!(status_of(PolicyTarget::Terminal, &content), TargetStatus::Enabled);

        let disabled = apply_marker(PolicyTarget::Terminal, &content, false).unwrap();
        assert_eq!(disabled, "#%PAM-1.0\n");

        let content = format!("#%PAM-1.0\n{MARKER_LINE}\nauth include system-auth");
        let disabled = apply_marker(PolicyTarget::Terminal, &content, false).unwrap();
        assert_eq!(disabled, "#%PAM-1.0\nauth include system-auth");
    }

    #[test]
    fn missing_polkit_file_is_seeded() {
        let (dir, store) = store();
        let vendor = "#%PAM-1.0\nauth include system-auth\naccount include system-auth\n";
        fs::write(dir.path().join("vendor/polkit-1"), vendor).unwrap();

        assert_eq!(
            store.read_target(PolicyTarget::PrivilegeEscalation).unwrap(),
            TargetStatus::Disabled
        );

        store.set_target(PolicyTarget::PrivilegeEscalation, true).unwrap();

        let path = store.path(PolicyTarget::PrivilegeEscalation);
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            format!("#%PAM-1.0\n{MARKER_LINE}\nauth include system-auth\naccount include system-auth\n")
        );
        assert_eq!(fs::metadata(&path).unwrap().mode() & 0o7777, DEFAULT_MODE);
    }

    #[test]
    fn missing_polkit_without_vendor_gets_header() {
        let (_dir, store) = store();

        store.set_target(PolicyTarget::PrivilegeEscalation, true).unwrap();

        let path = store.path(PolicyTarget::PrivilegeEscalation);
        assert_eq!(fs::read_to_string(path).unwrap(), format!("{PAM_HEADER}{MARKER_LINE}\n"));
    }

    #[test]
    fn missing_files_elsewhere() {
        let (_dir, store) = store();

        store.set_target(PolicyTarget::Terminal, false).unwrap();
        assert!(!store.path(PolicyTarget::Terminal).exists());

        assert_eq!(store.set_target(PolicyTarget::Login, true), Err(PolicyError::IoFailure));
        assert!(!store.path(PolicyTarget::Login).exists());
    }

    #[test]
    fn dropped_stage_leaves_original() {
        let (_dir, store) = store();
        let path = store.path(PolicyTarget::Terminal);
        fs::write(&path, SUDO).unwrap();

        let next = apply_marker(PolicyTarget::Terminal, SUDO, true).unwrap();
        let staged = store.stage(PolicyTarget::Terminal, &next, DEFAULT_MODE).unwrap();
        assert_eq!(temp_leftovers(&store), 1);

        drop(staged);

        assert_eq!(fs::read_to_string(&path).unwrap(), SUDO);
        assert_eq!(temp_leftovers(&store), 0);
    }

    #[test]
    fn commit_keeps_mode() {
        let (_dir, store) = store();
        let path = store.path(PolicyTarget::Terminal);
        fs::write(&path, SUDO).unwrap();
        fs::set_permissions(&path, Permissions::from_mode(0o600)).unwrap();

        store.set_target(PolicyTarget::Terminal, true).unwrap();

        assert_eq!(fs::metadata(&path).unwrap().mode() & 0o7777, 0o600);
    }

    #[test]
    fn symlinked_target_is_refused() {
        let (dir, store) = store();
        let real = dir.path().join("elsewhere");
        fs::write(&real, SUDO).unwrap();
        std::os::unix::fs::symlink(&real, store.path(PolicyTarget::Terminal)).unwrap();

        assert_eq!(
            store.set_target(PolicyTarget::Terminal, true),
            Err(PolicyError::PolicyCorrupted)
        );
        assert_eq!(fs::read_to_string(&real).unwrap(), SUDO);
    }

    #[test]
    fn target_names() {
        assert_eq!("sudo".parse::<PolicyTarget>().unwrap(), PolicyTarget::Terminal);
        assert_eq!(
            "privilege-escalation".parse::<PolicyTarget>().unwrap(),
            PolicyTarget::PrivilegeEscalation
        );
        assert!("ssh".parse::<PolicyTarget>().is_err());
        assert_eq!(
            serde_json::to_string(&PolicyTarget::PrivilegeEscalation).unwrap(),
            "\"privilege-escalation\""
        );
    }
}
