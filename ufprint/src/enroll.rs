use std::{future::Future, sync::Arc};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{
    device::{ConfirmationToken, Device, DeviceId, EnrolledFinger, FingerLabel},
    error::{DeleteError, Result, SessionError},
    fprintd::{BiometricService, EnrollEvent, EnrollSubscription, FailReason},
    policy::TargetStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnrollState {
    Idle,
    AwaitingFirstScan,
    /// accepted scans so far
    Scanning(u32),
    Verifying,
    Completed,
    Failed(FailReason),
    Cancelled,
}

impl EnrollState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_) | Self::Cancelled)
    }
}

/// What the user should do next. Presentation turns these into text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Guidance {
    ScanCaptured { scan: u32, required: u32 },
    RetryTooShort,
    RetrySwipeDirection,
    RetryCenterFinger,
    RetryRemoveFinger,
    Retry,
}

impl Guidance {
    #[must_use]
    pub fn is_retry(self) -> bool {
        !matches!(self, Self::ScanCaptured { .. })
    }
}

/// Folds daemon events into a state and guidance. Never touches the bus.
#[derive(Debug)]
pub struct EnrollmentSession {
    device: Device,
    finger: FingerLabel,
    state: EnrollState,
    scans: u32,
    threshold: u32,
    last_guidance: Option<Guidance>,
    history: Vec<Guidance>,
}

impl EnrollmentSession {
    #[must_use]
    pub fn new(device: Device, finger: FingerLabel) -> Self {
        let threshold = device.enroll_stages.max(1);

        Self {
            device,
            finger,
            state: EnrollState::Idle,
            scans: 0,
            threshold,
            last_guidance: None,
            history: Vec::new(),
        }
    }

    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    #[must_use]
    pub fn finger(&self) -> FingerLabel {
        self.finger
    }

    #[must_use]
    pub fn state(&self) -> EnrollState {
        self.state
    }

    #[must_use]
    pub fn scans(&self) -> u32 {
        self.scans
    }

    #[must_use]
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    #[must_use]
    pub fn last_guidance(&self) -> Option<Guidance> {
        self.last_guidance
    }

    #[must_use]
    pub fn history(&self) -> &[Guidance] {
        &self.history
    }

    fn ensure_live(&self) -> core::result::Result<(), SessionError> {
        match self.state {
            EnrollState::Idle => Err(SessionError::NoActiveSession),
            s if s.is_terminal() => Err(SessionError::NoActiveSession),
            _ => Ok(()),
        }
    }

    fn guide(&mut self, guidance: Guidance) -> Option<Guidance> {
        self.last_guidance = Some(guidance);
        self.history.push(guidance);
        Some(guidance)
    }

    pub fn begin(&mut self) -> core::result::Result<(), SessionError> {
        if self.state != EnrollState::Idle {
            return Err(SessionError::AlreadyEnrolling);
        }
        self.state = EnrollState::AwaitingFirstScan;
        Ok(())
    }

    /// Fold one daemon event into the session.
    pub fn apply(&mut self, event: EnrollEvent) -> core::result::Result<Option<Guidance>, SessionError> {
        self.ensure_live()?;

        let guidance = match event {
            EnrollEvent::ScanGood => {
                self.scans += 1;

                if self.state != EnrollState::Verifying {
                    self.state = if self.scans >= self.threshold {
                        EnrollState::Verifying
                    } else {
                        EnrollState::Scanning(self.scans)
                    };
                }

                self.guide(Guidance::ScanCaptured {
                    scan: self.scans,
                    required: self.threshold,
                })
            }
            EnrollEvent::ScanRetryTooShort => self.guide(Guidance::RetryTooShort),
            EnrollEvent::ScanRetrySwipeDirection => self.guide(Guidance::RetrySwipeDirection),
            EnrollEvent::ScanRetryCenterFinger => self.guide(Guidance::RetryCenterFinger),
            EnrollEvent::ScanRetryRemoveFinger => self.guide(Guidance::RetryRemoveFinger),
            EnrollEvent::ScanRetry => self.guide(Guidance::Retry),
            EnrollEvent::Completed => {
                if self.state != EnrollState::Verifying {
                    warn!(
                        "daemon completed {} after {}/{} scans",
                        self.finger, self.scans, self.threshold
                    );
                }
                self.state = EnrollState::Completed;
                None
            }
            EnrollEvent::Failed(reason) => {
                self.state = EnrollState::Failed(reason);
                None
            }
            EnrollEvent::DeviceDisconnected => {
                self.state = EnrollState::Failed(FailReason::DeviceDisconnected);
                None
            }
        };

        Ok(guidance)
    }

    pub fn cancel(&mut self) -> core::result::Result<(), SessionError> {
        self.ensure_live()?;
        self.state = EnrollState::Cancelled;
        Ok(())
    }

    /// The event source went away without a verdict.
    pub fn lose_service(&mut self) -> core::result::Result<(), SessionError> {
        self.ensure_live()?;
        self.state = EnrollState::Failed(FailReason::ServiceLost);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionUpdate {
    pub state: EnrollState,
    pub scans: u32,
    pub guidance: Option<Guidance>,
}

impl SessionUpdate {
    fn of(session: &EnrollmentSession, guidance: Option<Guidance>) -> Self {
        Self {
            state: session.state(),
            scans: session.scans(),
            guidance,
        }
    }
}

/// Cancels the enrollment it was handed out for. Cloneable so a signal
/// handler can hold one; cancelling twice is a no-op.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) -> core::result::Result<(), SessionError> {
        if *self.tx.borrow() {
            return Ok(());
        }

        self.tx.send(true).map_err(|_| SessionError::NoActiveSession)
    }
}

/// Privileged deletion path, served by the helper.
pub trait FingerAdmin: Send + Sync {
    fn delete_finger(
        &self,
        device: &DeviceId,
        finger: FingerLabel,
        confirmation: ConfirmationToken,
    ) -> impl Future<Output = Result<()>> + Send;

    fn delete_all_fingers(
        &self,
        device: &DeviceId,
        confirmation: ConfirmationToken,
    ) -> impl Future<Output = Result<()>> + Send;
}

struct ActiveEnrollment {
    session: EnrollmentSession,
    subscription: EnrollSubscription,
    cancel_rx: watch::Receiver<bool>,
    _cancel_tx: Arc<watch::Sender<bool>>,
}

enum Wake {
    Cancel,
    Event(Option<EnrollEvent>),
}

/// Single-slot owner of the process's enrollment.
pub struct Enroller<B> {
    service: B,
    active: Option<ActiveEnrollment>,
}

impl<B> Enroller<B>
where
    B: BiometricService,
{
    pub fn new(service: B) -> Self {
        Self { service, active: None }
    }

    #[must_use]
    pub fn session(&self) -> Option<&EnrollmentSession> {
        self.active.as_ref().map(|a| &a.session)
    }

    #[must_use]
    pub fn is_enrolling(&self) -> bool {
        self.active.is_some()
    }

    pub async fn start(&mut self, device: &Device, finger: FingerLabel) -> Result<CancelHandle> {
        if self.active.is_some() {
            return Err(SessionError::AlreadyEnrolling.into());
        }

        let enrolled = self.service.list_fingers(device).await?;

        if u32::try_from(enrolled.len())? >= device.max_templates {
            return Err(SessionError::DeviceFull.into());
        }

        if enrolled.iter().any(|f| f.finger == finger) {
            return Err(SessionError::InvalidFinger.into());
        }

        let mut session = EnrollmentSession::new(device.clone(), finger);
        session.begin()?;

        let subscription = self.service.start_enroll(device, finger).await?;

        let (tx, cancel_rx) = watch::channel(false);
        let tx = Arc::new(tx);

        info!("enrollment of {finger} started, {} scans needed", session.threshold());

        self.active = Some(ActiveEnrollment {
            session,
            subscription,
            cancel_rx,
            _cancel_tx: tx.clone(),
        });

        Ok(CancelHandle { tx })
    }

    /// Wait for the next state change. Terminal updates release the session.
    pub async fn next_update(&mut self) -> Result<SessionUpdate> {
        let Some(active) = self.active.as_mut() else {
            return Err(SessionError::NoActiveSession.into());
        };

        let wake = tokio::select! {
            biased;
            _ = active.cancel_rx.wait_for(|c| *c) => Wake::Cancel,
            event = active.subscription.next() => Wake::Event(event),
        };

        let guidance = match wake {
            Wake::Cancel => {
                active.session.cancel()?;
                None
            }
            Wake::Event(Some(event)) => {
                debug!("enroll event {event:?}");
                active.session.apply(event)?
            }
            Wake::Event(None) => {
                warn!("enroll status stream ended early");
                active.session.lose_service()?;
                None
            }
        };

        let update = SessionUpdate::of(&active.session, guidance);

        if update.state.is_terminal() {
            self.finish().await;
        }

        Ok(update)
    }

    /// Cancel from the owning task.
    pub async fn cancel(&mut self) -> Result<SessionUpdate> {
        let Some(active) = self.active.as_mut() else {
            return Err(SessionError::NoActiveSession.into());
        };

        active.session.cancel()?;
        let update = SessionUpdate::of(&active.session, None);

        self.finish().await;

        Ok(update)
    }

    async fn finish(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        let ActiveEnrollment { session, subscription, .. } = active;
        drop(subscription);

        if let Err(e) = self.service.stop_enroll(session.device()).await {
            warn!("unable to stop enrollment ({e})");
        }

        info!("enrollment of {} ended {:?}", session.finger(), session.state());
    }

    pub async fn delete<A>(
        &self,
        admin: &A,
        device: &DeviceId,
        finger: FingerLabel,
        confirmation: Option<ConfirmationToken>,
    ) -> Result<()>
    where
        A: FingerAdmin,
    {
        let Some(token) = confirmation.filter(|t| t.confirms_finger(finger)) else {
            return Err(DeleteError::ConfirmationRequired.into());
        };

        self.ensure_idle(device)?;

        admin.delete_finger(device, finger, token).await
    }

    pub async fn delete_all<A>(&self, admin: &A, device: &DeviceId, confirmation: Option<ConfirmationToken>) -> Result<()>
    where
        A: FingerAdmin,
    {
        let Some(token) = confirmation.filter(|t| t.confirms_all(device)) else {
            return Err(DeleteError::ConfirmationRequired.into());
        };

        self.ensure_idle(device)?;

        admin.delete_all_fingers(device, token).await
    }

    fn ensure_idle(&self, device: &DeviceId) -> Result<()> {
        match self.session() {
            Some(s) if &s.device().id == device => Err(DeleteError::DeviceBusy.into()),
            _ => Ok(()),
        }
    }
}

/// True when removing `finger` (or every finger with `None`) leaves no print
/// while fingerprint authentication is still enabled somewhere.
#[must_use]
pub fn lockout_risk(enrolled: &[EnrolledFinger], finger: Option<FingerLabel>, statuses: &[TargetStatus]) -> bool {
    let remaining = match finger {
        Some(finger) => enrolled.iter().filter(|f| f.finger != finger).count(),
        None => 0,
    };

    remaining == 0 && statuses.contains(&TargetStatus::Enabled)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use tokio::sync::mpsc;

    use super::*;
    use crate::{device::ScanType, error::Error};

    const DEVICE: &str = "/net/reactivated/Fprint/Device/0";

    fn device(stages: u32) -> Device {
        Device {
            id: DEVICE.parse().unwrap(),
            name: "Mock reader".to_string(),
            scan_type: ScanType::Press,
            enroll_stages: stages,
            max_templates: 10,
        }
    }

    #[derive(Default)]
    struct MockState {
        enrolled: Mutex<Vec<FingerLabel>>,
        feed: Mutex<Option<mpsc::Sender<EnrollEvent>>>,
        list_calls: AtomicUsize,
        stop_calls: AtomicUsize,
    }

    #[derive(Clone, Default)]
    struct MockService {
        state: Arc<MockState>,
    }

    impl MockService {
        fn push(&self, events: &[EnrollEvent]) {
            let feed = self.state.feed.lock().unwrap();
            let tx = feed.as_ref().unwrap();
            for e in events {
                tx.try_send(*e).unwrap();
            }
        }

        fn hang_up(&self) {
            self.state.feed.lock().unwrap().take();
        }

        fn subscription_live(&self) -> bool {
            self.state.feed.lock().unwrap().as_ref().is_some_and(|tx| !tx.is_closed())
        }

        fn stops(&self) -> usize {
            self.state.stop_calls.load(Ordering::SeqCst)
        }
    }

    impl BiometricService for MockService {
        async fn list_devices(&self) -> Result<Vec<Device>> {
            Ok(vec![device(4)])
        }

        async fn list_fingers(&self, device: &Device) -> Result<Vec<EnrolledFinger>> {
            self.state.list_calls.fetch_add(1, Ordering::SeqCst);

            let enrolled = self.state.enrolled.lock().unwrap();

            Ok(enrolled
                .iter()
                .enumerate()
                .map(|(index, finger)| EnrolledFinger {
                    device: device.id.clone(),
                    finger: *finger,
                    index,
                })
                .collect())
        }

        async fn start_enroll(&self, _device: &Device, _finger: FingerLabel) -> Result<EnrollSubscription> {
            let (tx, rx) = mpsc::channel(64);
            self.state.feed.lock().unwrap().replace(tx);
            Ok(EnrollSubscription::new(rx, None))
        }

        async fn stop_enroll(&self, _device: &Device) -> Result<()> {
            self.state.stop_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn delete_finger(&self, _device: &Device, _finger: FingerLabel) -> core::result::Result<(), DeleteError> {
            Ok(())
        }

        async fn delete_all_fingers(&self, _device: &Device) -> core::result::Result<(), DeleteError> {
            Ok(())
        }

        fn for_user(&self, _user: &str) -> Self {
            self.clone()
        }
    }

    #[derive(Default)]
    struct CountingAdmin {
        calls: AtomicUsize,
    }

    impl FingerAdmin for CountingAdmin {
        async fn delete_finger(&self, _device: &DeviceId, _finger: FingerLabel, _confirmation: ConfirmationToken) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn delete_all_fingers(&self, _device: &DeviceId, _confirmation: ConfirmationToken) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn run_to_end(enroller: &mut Enroller<MockService>) -> Vec<SessionUpdate> {
        let mut updates = Vec::new();
        loop {
            let update = enroller.next_update().await.unwrap();
            updates.push(update);
            if update.state.is_terminal() {
                return updates;
            }
        }
    }

    #[test]
    fn verifying_exactly_at_threshold() {
        for threshold in 1..=6 {
            let mut session = EnrollmentSession::new(device(threshold), FingerLabel::RightIndex);
            session.begin().unwrap();

            for n in 1..=threshold {
                assert_ne!(session.state(), EnrollState::Verifying);
                session.apply(EnrollEvent::ScanGood).unwrap();
                assert_eq!(session.scans(), n);
            }

            assert_eq!(session.state(), EnrollState::Verifying);

            session.apply(EnrollEvent::Completed).unwrap();
            assert_eq!(session.state(), EnrollState::Completed);
        }
    }

    #[test]
    fn retries_do_not_count() {
        let mut session = EnrollmentSession::new(device(3), FingerLabel::LeftThumb);
        session.begin().unwrap();

        session.apply(EnrollEvent::ScanGood).unwrap();
        let guidance = session.apply(EnrollEvent::ScanRetryCenterFinger).unwrap();

        assert_eq!(guidance, Some(Guidance::RetryCenterFinger));
        assert_eq!(session.state(), EnrollState::Scanning(1));
        assert_eq!(session.scans(), 1);
        assert_eq!(session.last_guidance(), Some(Guidance::RetryCenterFinger));
    }

    #[test]
    fn terminal_state_is_final() {
        let mut session = EnrollmentSession::new(device(3), FingerLabel::LeftThumb);

        assert_eq!(session.apply(EnrollEvent::ScanGood), Err(SessionError::NoActiveSession));

        session.begin().unwrap();
        session.apply(EnrollEvent::DeviceDisconnected).unwrap();

        assert_eq!(session.state(), EnrollState::Failed(FailReason::DeviceDisconnected));
        assert_eq!(session.apply(EnrollEvent::ScanGood), Err(SessionError::NoActiveSession));
        assert_eq!(session.cancel(), Err(SessionError::NoActiveSession));
    }

    #[test]
    fn zero_stage_device_still_needs_one_scan() {
        let session = EnrollmentSession::new(device(0), FingerLabel::LeftThumb);
        assert_eq!(session.threshold(), 1);
    }

    #[tokio::test]
    async fn retries_then_scans_complete() {
        let mock = MockService::default();
        let mut enroller = Enroller::new(mock.clone());

        enroller.start(&device(4), FingerLabel::RightIndex).await.unwrap();

        mock.push(&[EnrollEvent::ScanRetryTooShort; 3]);
        mock.push(&[EnrollEvent::ScanGood; 4]);
        mock.push(&[EnrollEvent::Completed]);

        let history = enroller.session().map(|s| s.history().len());
        assert_eq!(history, Some(0));

        let updates = run_to_end(&mut enroller).await;
        let guidance: Vec<Guidance> = updates.iter().filter_map(|u| u.guidance).collect();

        assert_eq!(updates.last().unwrap().state, EnrollState::Completed);
        assert_eq!(guidance.len(), 7);
        assert!(guidance[..3].iter().all(|g| *g == Guidance::RetryTooShort));
        for (i, g) in guidance[3..].iter().enumerate() {
            let scan = u32::try_from(i).unwrap() + 1;
            assert_eq!(*g, Guidance::ScanCaptured { scan, required: 4 });
        }
        assert_eq!(updates[6].state, EnrollState::Verifying);

        assert!(!enroller.is_enrolling());
        assert_eq!(mock.stops(), 1);
    }

    #[tokio::test]
    async fn double_cancel_stops_once() {
        let mock = MockService::default();
        let mut enroller = Enroller::new(mock.clone());

        let handle = enroller.start(&device(4), FingerLabel::RightIndex).await.unwrap();
        mock.push(&[EnrollEvent::ScanGood]);

        let other = handle.clone();
        let (a, b) = tokio::join!(async { handle.cancel() }, async { other.cancel() });
        assert!(a.is_ok());
        assert!(b.is_ok());

        let update = enroller.next_update().await.unwrap();
        assert_eq!(update.state, EnrollState::Cancelled);
        assert_eq!(mock.stops(), 1);

        assert!(handle.cancel().is_ok());
        assert!(matches!(
            enroller.next_update().await,
            Err(Error::Session(SessionError::NoActiveSession))
        ));
        assert_eq!(mock.stops(), 1);
    }

    #[tokio::test]
    async fn cancel_while_scanning_stops_once() {
        let mock = MockService::default();
        let mut enroller = Enroller::new(mock.clone());

        let handle = enroller.start(&device(4), FingerLabel::RightIndex).await.unwrap();
        mock.push(&[EnrollEvent::ScanGood, EnrollEvent::ScanGood]);

        enroller.next_update().await.unwrap();
        let update = enroller.next_update().await.unwrap();
        assert_eq!(update.state, EnrollState::Scanning(2));

        handle.cancel().unwrap();

        let update = enroller.next_update().await.unwrap();
        assert_eq!(update.state, EnrollState::Cancelled);
        assert_eq!(update.scans, 2);
        assert!(!enroller.is_enrolling());
        assert_eq!(mock.stops(), 1);
    }

    #[tokio::test]
    async fn cancel_while_verifying_stops_once() {
        let mock = MockService::default();
        let mut enroller = Enroller::new(mock.clone());

        enroller.start(&device(2), FingerLabel::LeftThumb).await.unwrap();
        mock.push(&[EnrollEvent::ScanGood, EnrollEvent::ScanGood]);

        enroller.next_update().await.unwrap();
        let update = enroller.next_update().await.unwrap();
        assert_eq!(update.state, EnrollState::Verifying);

        let update = enroller.cancel().await.unwrap();
        assert_eq!(update.state, EnrollState::Cancelled);
        assert!(!enroller.is_enrolling());
        assert_eq!(mock.stops(), 1);

        assert!(matches!(
            enroller.cancel().await,
            Err(Error::Session(SessionError::NoActiveSession))
        ));
        assert_eq!(mock.stops(), 1);
    }

    #[tokio::test]
    async fn full_device_refuses_enrollment() {
        let mock = MockService::default();
        let mut enroller = Enroller::new(mock.clone());

        let mut full = device(4);
        full.max_templates = 2;

        mock.state
            .enrolled
            .lock()
            .unwrap()
            .extend([FingerLabel::LeftIndex, FingerLabel::RightIndex]);

        let ret = enroller.start(&full, FingerLabel::RightThumb).await;
        assert!(matches!(ret, Err(Error::Session(SessionError::DeviceFull))));
        assert!(!enroller.is_enrolling());

        mock.state.enrolled.lock().unwrap().pop();
        enroller.start(&full, FingerLabel::RightThumb).await.unwrap();
    }

    #[test]
    fn only_captures_are_progress() {
        assert!(!Guidance::ScanCaptured { scan: 1, required: 3 }.is_retry());
        assert!(Guidance::RetryTooShort.is_retry());
        assert!(Guidance::Retry.is_retry());
    }

    #[tokio::test]
    async fn handle_outliving_session_reports_no_session() {
        let mock = MockService::default();
        let mut enroller = Enroller::new(mock.clone());

        let handle = enroller.start(&device(1), FingerLabel::RightIndex).await.unwrap();
        mock.push(&[EnrollEvent::ScanGood, EnrollEvent::Completed]);
        run_to_end(&mut enroller).await;

        assert_eq!(handle.cancel(), Err(SessionError::NoActiveSession));
    }

    #[tokio::test]
    async fn direct_cancel_without_session() {
        let mut enroller = Enroller::new(MockService::default());

        assert!(matches!(
            enroller.cancel().await,
            Err(Error::Session(SessionError::NoActiveSession))
        ));
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let mock = MockService::default();
        let mut enroller = Enroller::new(mock.clone());

        enroller.start(&device(4), FingerLabel::RightIndex).await.unwrap();
        let again = enroller.start(&device(4), FingerLabel::LeftIndex).await;

        assert!(matches!(again, Err(Error::Session(SessionError::AlreadyEnrolling))));
    }

    #[tokio::test]
    async fn enrolled_finger_is_rejected_from_fresh_listing() {
        let mock = MockService::default();
        let mut enroller = Enroller::new(mock.clone());

        mock.state.enrolled.lock().unwrap().push(FingerLabel::RightIndex);

        let ret = enroller.start(&device(4), FingerLabel::RightIndex).await;
        assert!(matches!(ret, Err(Error::Session(SessionError::InvalidFinger))));

        mock.state.enrolled.lock().unwrap().clear();
        enroller.start(&device(4), FingerLabel::RightIndex).await.unwrap();

        assert_eq!(mock.state.list_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn disconnect_releases_subscription() {
        let mock = MockService::default();
        let mut enroller = Enroller::new(mock.clone());

        enroller.start(&device(4), FingerLabel::RightIndex).await.unwrap();
        mock.push(&[EnrollEvent::ScanGood, EnrollEvent::DeviceDisconnected]);

        assert!(mock.subscription_live());

        let updates = run_to_end(&mut enroller).await;

        assert_eq!(
            updates.last().unwrap().state,
            EnrollState::Failed(FailReason::DeviceDisconnected)
        );
        assert!(!mock.subscription_live());
    }

    #[tokio::test]
    async fn stream_end_is_service_lost() {
        let mock = MockService::default();
        let mut enroller = Enroller::new(mock.clone());

        enroller.start(&device(4), FingerLabel::RightIndex).await.unwrap();
        mock.push(&[EnrollEvent::ScanGood]);
        mock.hang_up();

        let updates = run_to_end(&mut enroller).await;

        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].state, EnrollState::Failed(FailReason::ServiceLost));
        assert_eq!(mock.stops(), 1);
    }

    #[tokio::test]
    async fn delete_without_token_never_reaches_admin() {
        let enroller = Enroller::new(MockService::default());
        let admin = CountingAdmin::default();
        let device: DeviceId = DEVICE.parse().unwrap();

        let ret = enroller.delete(&admin, &device, FingerLabel::RightIndex, None).await;
        assert!(matches!(ret, Err(Error::Delete(DeleteError::ConfirmationRequired))));

        let wrong = ConfirmationToken::for_finger(FingerLabel::LeftIndex);
        let ret = enroller
            .delete(&admin, &device, FingerLabel::RightIndex, Some(wrong))
            .await;
        assert!(matches!(ret, Err(Error::Delete(DeleteError::ConfirmationRequired))));

        assert_eq!(admin.calls.load(Ordering::SeqCst), 0);

        let token = ConfirmationToken::for_finger(FingerLabel::RightIndex);
        enroller
            .delete(&admin, &device, FingerLabel::RightIndex, Some(token))
            .await
            .unwrap();
        assert_eq!(admin.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delete_during_enrollment_is_busy() {
        let mut enroller = Enroller::new(MockService::default());
        let admin = CountingAdmin::default();
        let device_id: DeviceId = DEVICE.parse().unwrap();

        enroller.start(&device(4), FingerLabel::RightIndex).await.unwrap();

        let token = ConfirmationToken::for_all(&device_id);
        let ret = enroller.delete_all(&admin, &device_id, Some(token)).await;

        assert!(matches!(ret, Err(Error::Delete(DeleteError::DeviceBusy))));
        assert_eq!(admin.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn last_finger_with_policy_enabled_is_risky() {
        let device: DeviceId = DEVICE.parse().unwrap();
        let one = vec![EnrolledFinger {
            device,
            finger: FingerLabel::RightIndex,
            index: 0,
        }];

        let on = [TargetStatus::Disabled, TargetStatus::Enabled];
        let off = [TargetStatus::Disabled, TargetStatus::Disabled];

        assert!(lockout_risk(&one, Some(FingerLabel::RightIndex), &on));
        assert!(!lockout_risk(&one, Some(FingerLabel::LeftIndex), &on));
        assert!(!lockout_risk(&one, Some(FingerLabel::RightIndex), &off));
        assert!(lockout_risk(&one, None, &on));
    }
}
