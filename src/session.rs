//! The device-linking session: one linear pass from container start to a
//! verified, loopback-bound bridge.
//!
//! A session owns the bridge container for its duration and walks a fixed
//! state machine. `Failed` and `Skipped` are terminal and reachable from any
//! non-terminal state; `Done` is the sole success terminal. The one invariant
//! enforced on every exit path: if the session ever published the container
//! on all interfaces, no `Failed` or `Skipped` exit leaves it running there —
//! the exposed container is torn down before the terminal transition. Only a
//! secured `Done`, or an explicit `Linked`-with-warning when the re-bind
//! itself failed, may end a remote session with the container up.

use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

use crate::bind::{self, BindAddress};
use crate::container::{
    BridgeMode, ContainerManager, ContainerSpec, ContainerStartError, CONTAINER_NAME,
};
use crate::probe::{self, QrProber, ReadinessOutcome};
use crate::runtime::{self, ContainerRuntime};
use crate::settings::{self, Settings};
use crate::verify::{self, LinkVerifier, VerificationResult};

/// Where a linking session currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Starting,
    AwaitingQr,
    QrReady,
    AwaitingScan,
    Verifying,
    Linked,
    Securing,
    Done,
    Failed,
    Skipped,
}

/// Everything that can go wrong during a session. None of these abort the
/// surrounding install; each carries enough context for a remediation hint.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("container runtime unavailable:\n{0}")]
    PrerequisiteMissing(String),

    #[error(transparent)]
    ContainerStart(#[from] ContainerStartError),

    #[error("pairing code was not ready within {0:?}")]
    ReadinessTimeout(Duration),

    #[error("bridge container stopped while waiting for the pairing code")]
    Aborted,

    #[error("no linked device detected after {attempts} checks")]
    VerificationTimeout { attempts: u32 },

    /// The link itself is valid; the bridge is still reachable on a
    /// non-loopback interface. Must never be conflated with an ordinary
    /// failure.
    #[error("failed to re-bind the bridge to loopback: {0}")]
    Securing(String),
}

/// Human interaction surface for the pairing steps. The scan wait is the
/// session's single unbounded suspension point: it blocks on an explicit
/// acknowledgment and can be abandoned only by process interruption.
pub trait Operator {
    /// Ask whether linking should run at all. Declining skips the session.
    fn confirm_start(&mut self) -> bool;

    /// Show the operator where the pairing code lives, plus the raw pairing
    /// URI when the bridge supplied one.
    fn present_code(&mut self, qr_url: &str, pairing_uri: Option<&str>);

    /// Block until the operator confirms the code was scanned.
    fn confirm_scanned(&mut self);
}

/// Tunables for one session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub remote: bool,
    pub container_name: String,
    pub image: String,
    /// Host directory mounted as the credential store.
    pub volume: PathBuf,
    /// Base URL for reaching the bridge API from this host.
    pub api_base: String,
    pub device_name: String,
    /// Host substituted into the pairing URL shown to the operator when the
    /// bridge is exposed; polling always goes through `api_base`.
    pub advertise_host: Option<String>,
    pub readiness_timeout: Duration,
    pub poll_interval: Duration,
    pub verify_attempts: u32,
    pub verify_interval: Duration,
    /// Settings document to receive the verified number, when present.
    pub settings_path: Option<PathBuf>,
}

impl SessionOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            remote: settings.remote,
            container_name: CONTAINER_NAME.to_string(),
            image: settings.image.clone(),
            volume: settings.volume_dir(),
            api_base: settings.api_base.clone(),
            device_name: settings.device_name.clone(),
            advertise_host: settings.remote.then(bind::advertised_host),
            readiness_timeout: probe::DEFAULT_MAX_WAIT,
            poll_interval: probe::DEFAULT_INTERVAL,
            verify_attempts: verify::DEFAULT_ATTEMPTS,
            verify_interval: verify::DEFAULT_RETRY_INTERVAL,
            settings_path: Some(Settings::path()),
        }
    }

    /// Pairing endpoint for this install.
    pub fn qr_url(&self) -> String {
        format!(
            "{}/v1/qrcodelink?device_name={}",
            self.api_base, self.device_name
        )
    }

    /// Accounts endpoint for this install.
    pub fn accounts_url(&self) -> String {
        format!("{}/v1/accounts", self.api_base)
    }

    fn container_spec(&self, bind: BindAddress) -> ContainerSpec {
        ContainerSpec {
            name: self.container_name.clone(),
            image: self.image.clone(),
            bind,
            volume: self.volume.clone(),
            mode: BridgeMode::Normal,
            post_link_mode: BridgeMode::JsonRpc,
        }
    }
}

/// One linking attempt. Created per attempt, discarded at session end.
pub struct LinkSession {
    opts: SessionOptions,
    state: LinkState,
    bind: Option<BindAddress>,
    started_at: Instant,
    linked_number: Option<String>,
    failure: Option<LinkError>,
    expose_warning: bool,
    exposed_still_running: bool,
}

impl LinkSession {
    pub fn new(opts: SessionOptions) -> Self {
        Self {
            opts,
            state: LinkState::Idle,
            bind: None,
            started_at: Instant::now(),
            linked_number: None,
            failure: None,
            expose_warning: false,
            exposed_still_running: false,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn options(&self) -> &SessionOptions {
        &self.opts
    }

    /// E.164 number of the linked device, once verified.
    pub fn linked_number(&self) -> Option<&str> {
        self.linked_number.as_deref()
    }

    pub fn failure(&self) -> Option<&LinkError> {
        self.failure.as_ref()
    }

    /// Set when securing failed and the exposure was not closed cleanly.
    pub fn expose_warning(&self) -> bool {
        self.expose_warning
    }

    /// After a securing failure: whether the container was still observed
    /// running. Securing stops the container before the loopback relaunch,
    /// so a rejected relaunch usually leaves the bridge down rather than
    /// exposed; the caller's warning should say which.
    pub fn exposed_container_running(&self) -> bool {
        self.exposed_still_running
    }

    /// Drive the session to a terminal state. Strictly sequential: container
    /// start precedes the first readiness poll, and verification never starts
    /// before the scan acknowledgment.
    pub async fn run(&mut self, rt: &dyn ContainerRuntime, operator: &mut dyn Operator) -> LinkState {
        if let Err(hint) = runtime::require_available(rt) {
            self.failure = Some(LinkError::PrerequisiteMissing(hint));
            self.state = LinkState::Skipped;
            return self.state;
        }
        if !operator.confirm_start() {
            info!("linking declined; pairing deferred");
            self.state = LinkState::Skipped;
            return self.state;
        }

        let manager = ContainerManager::new(rt);
        let bind = bind::decide(self.opts.remote);
        self.bind = Some(bind);
        if bind.is_exposed() {
            warn!("publishing the bridge on all interfaces until the link completes");
        }

        self.state = LinkState::Starting;
        self.started_at = Instant::now();
        let spec = self.opts.container_spec(bind);
        info!("starting bridge container {} ({})", spec.name, spec.image);
        if let Err(e) = manager.start(&spec) {
            return self.fail(&manager, LinkError::ContainerStart(e));
        }

        self.state = LinkState::AwaitingQr;
        let prober = QrProber::with_timing(self.opts.readiness_timeout, self.opts.poll_interval);
        let qr_url = self.opts.qr_url();
        let outcome = prober
            .poll(&qr_url, || manager.is_running(&spec.name))
            .await;
        let pairing_uri = match outcome {
            ReadinessOutcome::Ready {
                elapsed,
                pairing_uri,
            } => {
                info!("pairing code ready after {:?}", elapsed);
                pairing_uri
            }
            ReadinessOutcome::NotReady => {
                return self.fail(
                    &manager,
                    LinkError::ReadinessTimeout(self.opts.readiness_timeout),
                );
            }
            ReadinessOutcome::Aborted => return self.fail(&manager, LinkError::Aborted),
        };

        self.state = LinkState::QrReady;
        let display_url = match (&self.opts.advertise_host, bind.is_exposed()) {
            (Some(host), true) => bind::advertise_url(&qr_url, host),
            _ => qr_url.clone(),
        };
        operator.present_code(&display_url, pairing_uri.as_deref());

        self.state = LinkState::AwaitingScan;
        operator.confirm_scanned();

        self.state = LinkState::Verifying;
        let verifier = LinkVerifier::new();
        let result = verifier
            .verify_with_retry(
                &self.opts.accounts_url(),
                self.opts.verify_attempts,
                self.opts.verify_interval,
            )
            .await;
        let number = match result {
            VerificationResult::Linked(number) => number,
            VerificationResult::NotLinked => {
                // The credential volume stays intact: linking may have
                // landed just after the check window closed.
                return self.fail(
                    &manager,
                    LinkError::VerificationTimeout {
                        attempts: self.opts.verify_attempts,
                    },
                );
            }
        };

        self.state = LinkState::Linked;
        self.linked_number = Some(number.clone());
        info!("device linked as {} in {:?}", number, self.started_at.elapsed());

        if let Some(path) = self.opts.settings_path.clone() {
            if let Err(e) = settings::apply_verified_number(&path, &number) {
                warn!("could not write verified number to {:?}: {}", path, e);
            }
        }

        if !self.opts.remote {
            self.state = LinkState::Done;
            return self.state;
        }

        self.state = LinkState::Securing;
        info!("re-binding the bridge to loopback");
        match bind::secure(&manager, &spec) {
            Ok(()) => {
                self.bind = Some(BindAddress::Loopback);
                self.state = LinkState::Done;
            }
            Err(e) => {
                // The link stays valid. Stay Linked with the warning flag so
                // the caller surfaces it loudly, and record whether the old
                // container survived the failed re-bind.
                self.expose_warning = true;
                self.exposed_still_running = manager.is_running(&spec.name);
                self.failure = Some(LinkError::Securing(e.to_string()));
                self.state = LinkState::Linked;
            }
        }
        self.state
    }

    /// Terminal failure transition. An exposed container never survives it.
    fn fail(&mut self, manager: &ContainerManager<'_>, error: LinkError) -> LinkState {
        if self.bind.is_some_and(|b| b.is_exposed()) {
            warn!("tearing down the exposed bridge container");
            manager.stop_existing(&self.opts.container_name);
        }
        warn!("linking failed: {}", error);
        self.failure = Some(error);
        self.state = LinkState::Failed;
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{ExitStatus, Output};
    use std::sync::Mutex;

    use crate::runtime::RuntimeState;

    /// Scripted runtime: records every invocation, optionally rejecting
    /// `run` subcommands.
    struct FakeRuntime {
        calls: Mutex<Vec<Vec<String>>>,
        state: u8,
        reject_launch: bool,
    }

    impl FakeRuntime {
        fn available() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                state: 2,
                reject_launch: false,
            }
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ContainerRuntime for FakeRuntime {
        fn run(&self, args: &[&str]) -> Result<Output> {
            let call: Vec<String> = args.iter().map(|s| s.to_string()).collect();
            self.calls.lock().unwrap().push(call);
            let code = if args[0] == "run" && self.reject_launch {
                1
            } else {
                0
            };
            Ok(Output {
                status: ExitStatus::from_raw(code << 8),
                stdout: Vec::new(),
                stderr: if code != 0 {
                    b"docker: port is already allocated".to_vec()
                } else {
                    Vec::new()
                },
            })
        }

        fn state(&self) -> RuntimeState {
            match self.state {
                0 => RuntimeState::NotInstalled,
                1 => RuntimeState::NotRunning,
                _ => RuntimeState::Available,
            }
        }
    }

    struct ScriptedOperator {
        start: bool,
    }

    impl ScriptedOperator {
        fn accepting() -> Self {
            Self { start: true }
        }
    }

    impl Operator for ScriptedOperator {
        fn confirm_start(&mut self) -> bool {
            self.start
        }
        fn present_code(&mut self, _qr_url: &str, _pairing_uri: Option<&str>) {}
        fn confirm_scanned(&mut self) {}
    }

    fn fast_options(remote: bool) -> SessionOptions {
        SessionOptions {
            remote,
            container_name: CONTAINER_NAME.to_string(),
            image: "bbernhard/signal-cli-rest-api:0.93".to_string(),
            volume: PathBuf::from("/tmp/creds"),
            api_base: "http://127.0.0.1:1".to_string(),
            device_name: "test".to_string(),
            advertise_host: None,
            readiness_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
            verify_attempts: 1,
            verify_interval: Duration::from_millis(10),
            settings_path: None,
        }
    }

    #[tokio::test]
    async fn missing_runtime_skips_with_remediation() {
        let rt = FakeRuntime {
            state: 0,
            ..FakeRuntime::available()
        };
        let mut session = LinkSession::new(fast_options(false));
        let state = session.run(&rt, &mut ScriptedOperator::accepting()).await;
        assert_eq!(state, LinkState::Skipped);
        assert!(matches!(
            session.failure(),
            Some(LinkError::PrerequisiteMissing(_))
        ));
        // Nothing was launched.
        assert!(rt.calls().is_empty());
    }

    #[tokio::test]
    async fn decline_skips_without_touching_the_runtime() {
        let rt = FakeRuntime::available();
        let mut session = LinkSession::new(fast_options(false));
        let mut operator = ScriptedOperator { start: false };
        let state = session.run(&rt, &mut operator).await;
        assert_eq!(state, LinkState::Skipped);
        assert!(session.failure().is_none());
        assert!(rt.calls().is_empty());
    }

    #[tokio::test]
    async fn launch_rejection_fails_the_session() {
        let rt = FakeRuntime {
            reject_launch: true,
            ..FakeRuntime::available()
        };
        let mut session = LinkSession::new(fast_options(false));
        let state = session.run(&rt, &mut ScriptedOperator::accepting()).await;
        assert_eq!(state, LinkState::Failed);
        assert!(matches!(
            session.failure(),
            Some(LinkError::ContainerStart(_))
        ));
    }

    #[tokio::test]
    async fn remote_launch_rejection_tears_down_the_container() {
        let rt = FakeRuntime {
            reject_launch: true,
            ..FakeRuntime::available()
        };
        let mut session = LinkSession::new(fast_options(true));
        let state = session.run(&rt, &mut ScriptedOperator::accepting()).await;
        assert_eq!(state, LinkState::Failed);

        // The exposed container is stopped/removed after the failed launch:
        // stop+rm (replacement), run, a log tail for diagnostics, then
        // stop+rm again (teardown).
        let subcommands: Vec<String> = rt.calls().iter().map(|c| c[0].clone()).collect();
        assert_eq!(subcommands, ["stop", "rm", "run", "logs", "stop", "rm"]);
    }

    #[test]
    fn urls_follow_the_bridge_api_shape() {
        let opts = fast_options(false);
        assert_eq!(
            opts.qr_url(),
            "http://127.0.0.1:1/v1/qrcodelink?device_name=test"
        );
        assert_eq!(opts.accounts_url(), "http://127.0.0.1:1/v1/accounts");
    }
}
