//! Session Manager
//!
//! A single supervisor task owns every per-contact resource of the current account:
//! the listening host, one stream task per contact, in-flight dials and the
//! mailboxes. Acceptor, dialer and stream tasks never touch that state; they report
//! back over an internal channel and the supervisor applies the result.
//!
//! The session moves between three states, published on a `watch` channel:
//!
//! ```text
//! Idle --account--> Reloading --host bound--> HostActive
//!  ^                    ^                          |
//!  +------no account----+-----account changed------+
//! ```
//!
//! A reload tears everything down and bumps a generation counter, so reports from
//! tasks of an earlier generation are recognized and ignored.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use peerpost_core::{
    Account, IdentityKeyPair, Message, MessageState, PeerEntry, PeerpostConfig, PeerpostError,
    PublicKeyHex, Result, SessionConfig, SessionError, Timestamp, Topic,
};
use peerpost_store::RecordStore;

use crate::directory::{PeerDirectory, StaticDirectory};
use crate::host::{dial, Connection, Host};
use crate::mailbox::{MailboxReceiver, Mailboxes, OfferError};
use crate::peer::{run_stream, StreamContext};

const COMMAND_BUFFER: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

// ----------------------------------------------------------------------------
// Session State
// ----------------------------------------------------------------------------

/// Externally visible state of the session manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No current account; nothing is listening
    Idle,
    /// A host for `account` is accepting connections on `listen_addr`
    HostActive {
        account: PublicKeyHex,
        listen_addr: SocketAddr,
    },
    /// Tearing down and bringing up a host for a new account
    Reloading,
    /// The supervisor has exited
    Stopped,
}

impl SessionState {
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::HostActive { .. })
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        match self {
            SessionState::HostActive { listen_addr, .. } => Some(*listen_addr),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Internal Messages
// ----------------------------------------------------------------------------

#[derive(Debug)]
enum SessionCommand {
    EnsureStream { contact: PublicKeyHex },
    Shutdown,
}

/// Reports from acceptor, dialer and stream tasks
#[derive(Debug)]
enum Report {
    Connected {
        generation: u64,
        connection: Connection,
    },
    DialFailed {
        generation: u64,
        contact: PublicKeyHex,
        error: PeerpostError,
    },
    StreamEnded {
        generation: u64,
        contact: PublicKeyHex,
        stream_id: u64,
        result: Result<()>,
    },
}

impl Report {
    fn generation(&self) -> u64 {
        match self {
            Report::Connected { generation, .. }
            | Report::DialFailed { generation, .. }
            | Report::StreamEnded { generation, .. } => *generation,
        }
    }
}

struct ActiveHost {
    account: PublicKeyHex,
    identity: Arc<IdentityKeyPair>,
    acceptor: JoinHandle<()>,
}

struct StreamEntry {
    id: u64,
    initiated_locally: bool,
    task: JoinHandle<()>,
}

// ----------------------------------------------------------------------------
// Session Manager
// ----------------------------------------------------------------------------

/// Supervisor task owning the per-contact arena
struct SessionManager {
    store: RecordStore,
    config: SessionConfig,
    directory: Arc<dyn PeerDirectory>,
    mailboxes: Arc<Mailboxes>,

    commands: mpsc::Receiver<SessionCommand>,
    report_sender: mpsc::UnboundedSender<Report>,
    reports: mpsc::UnboundedReceiver<Report>,
    state: watch::Sender<SessionState>,

    active: Option<ActiveHost>,
    streams: HashMap<PublicKeyHex, StreamEntry>,
    dialing: HashMap<PublicKeyHex, JoinHandle<()>>,
    resend_cursors: HashMap<PublicKeyHex, usize>,
    generation: u64,
    next_stream_id: u64,
}

impl SessionManager {
    /// Run until shut down or until every handle is dropped
    async fn run(mut self) -> Result<()> {
        info!("session manager starting");
        let mut account_events = self
            .store
            .broker()
            .subscribe(&[Topic::DatabaseOpened, Topic::CurrentAccountChanged]);

        if !self.reload().await {
            self.stop();
            return Ok(());
        }

        let mut ticker = interval(self.config.reconcile_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let reload = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::EnsureStream { contact }) => {
                        self.ensure_stream(&contact).await;
                        false
                    }
                    Some(SessionCommand::Shutdown) | None => break,
                },

                Some(report) = self.reports.recv() => {
                    self.handle_report(report);
                    false
                }

                Some(event) = account_events.recv() => {
                    trace!(topic = ?event.topic(), cached = event.cached, "account event");
                    self.account_changed()
                }

                _ = ticker.tick() => self.reconcile().await,
            };

            if reload && !self.reload().await {
                break;
            }
        }

        self.stop();
        Ok(())
    }

    // ---- Reload ----

    /// Replace the host with one for the current account
    ///
    /// Returns `false` if shutdown was requested while waiting to retry.
    async fn reload(&mut self) -> bool {
        self.state.send_replace(SessionState::Reloading);
        self.teardown();
        self.generation += 1;
        debug!(generation = self.generation, "session reloading");

        loop {
            let Some(account) = self.current_account() else {
                info!("no current account, session idle");
                self.state.send_replace(SessionState::Idle);
                return true;
            };

            match self.start_host(&account).await {
                Ok(()) => return true,
                Err(e) => {
                    warn!(account = %account.public_key, error = %e, "host unavailable, retrying");
                    tokio::select! {
                        command = self.commands.recv() => match command {
                            Some(SessionCommand::Shutdown) | None => return false,
                            Some(SessionCommand::EnsureStream { contact }) => {
                                debug!(%contact, "stream request dropped during reload");
                            }
                        },
                        _ = sleep(self.config.host_retry_interval()) => {}
                    }
                }
            }
        }
    }

    async fn start_host(&mut self, account: &Account) -> Result<()> {
        let identity = Arc::new(IdentityKeyPair::from_private_key_hex(&account.private_key)?);
        let host = Host::bind(identity.clone(), self.config.listen_addr).await?;
        let listen_addr = host.local_addr();

        let acceptor = tokio::spawn(accept_loop(
            host,
            self.generation,
            self.report_sender.clone(),
            self.config.handshake_timeout(),
        ));
        self.active = Some(ActiveHost {
            account: account.public_key.clone(),
            identity,
            acceptor,
        });
        self.state.send_replace(SessionState::HostActive {
            account: account.public_key.clone(),
            listen_addr,
        });
        info!(account = %account.public_key, %listen_addr, "session active");
        Ok(())
    }

    /// Abort every task and forget every mailbox of the current generation
    fn teardown(&mut self) {
        if let Some(host) = self.active.take() {
            host.acceptor.abort();
        }
        for (_, stream) in self.streams.drain() {
            stream.task.abort();
        }
        for (_, dial) in self.dialing.drain() {
            dial.abort();
        }
        self.resend_cursors.clear();
        self.mailboxes.clear();
    }

    fn stop(&mut self) {
        self.teardown();
        self.state.send_replace(SessionState::Stopped);
        info!("session manager stopped");
    }

    fn current_account(&self) -> Option<Account> {
        match self.store.current_account() {
            Ok(account) => account,
            Err(e) => {
                debug!(error = %e, "current account unavailable");
                None
            }
        }
    }

    fn account_changed(&self) -> bool {
        let current = self.current_account().map(|account| account.public_key);
        current.as_ref() != self.active.as_ref().map(|host| &host.account)
    }

    // ---- Streams ----

    /// Dial `contact` unless a stream or dial already exists
    async fn ensure_stream(&mut self, contact: &PublicKeyHex) {
        let Some(host) = &self.active else {
            return;
        };
        if contact == &host.account
            || self.streams.contains_key(contact)
            || self.dialing.contains_key(contact)
        {
            return;
        }
        let identity = host.identity.clone();

        let Some(address) = self.directory.resolve(contact).await else {
            debug!(%contact, "no known address for contact");
            return;
        };

        let generation = self.generation;
        let timeout = self.config.handshake_timeout();
        let reports = self.report_sender.clone();
        let expected = contact.peer_id();
        let target = contact.clone();
        debug!(%contact, %address, "dialing contact");
        let task = tokio::spawn(async move {
            let report = match dial(&identity, address, &expected, timeout).await {
                Ok(connection) => Report::Connected {
                    generation,
                    connection,
                },
                Err(error) => Report::DialFailed {
                    generation,
                    contact: target,
                    error,
                },
            };
            let _ = reports.send(report);
        });
        self.dialing.insert(contact.clone(), task);
    }

    /// Apply a task report
    fn handle_report(&mut self, report: Report) {
        if report.generation() != self.generation {
            trace!(generation = report.generation(), "dropping stale report");
            return;
        }
        match report {
            Report::Connected { connection, .. } => self.attach(connection),
            Report::DialFailed { contact, error, .. } => {
                self.dialing.remove(&contact);
                debug!(%contact, error = %error, "dial failed");
            }
            Report::StreamEnded {
                contact,
                stream_id,
                result,
                ..
            } => {
                if self.streams.get(&contact).map(|stream| stream.id) == Some(stream_id) {
                    self.streams.remove(&contact);
                }
                match result {
                    Ok(()) => debug!(%contact, stream_id, "stream finished"),
                    Err(e) => debug!(%contact, stream_id, error = %e, "stream ended"),
                }
            }
        }
    }

    /// Adopt an authenticated connection as the stream for its remote
    ///
    /// When both sides dial at once each ends up with two connections; both keep
    /// the one initiated by the side with the lower peer id.
    fn attach(&mut self, connection: Connection) {
        let Some(host) = &self.active else {
            return;
        };
        let remote = connection.remote().clone();
        let contact = remote.public_key.clone();
        let initiated_locally = connection.initiated_locally();
        if initiated_locally {
            self.dialing.remove(&contact);
        }
        if contact == host.account {
            warn!("ignoring connection to own account");
            return;
        }

        if let Some(existing) = self.streams.get(&contact) {
            let prefer_local = host.identity.peer_id() < remote.peer_id;
            if existing.initiated_locally == prefer_local || initiated_locally != prefer_local {
                debug!(%contact, initiated_locally, "dropping duplicate connection");
                return;
            }
            debug!(%contact, "replacing stream with preferred connection");
            existing.task.abort();
        }

        let stream_id = self.next_stream_id;
        self.next_stream_id += 1;
        let ctx = StreamContext {
            store: self.store.clone(),
            identity: host.identity.clone(),
            account: host.account.clone(),
            contact: contact.clone(),
            remote: remote.peer_id,
            mailboxes: self.mailboxes.clone(),
            max_frame_len: self.config.max_frame_len,
        };
        let address = connection.peer_addr();
        let (_, reader, writer) = connection.into_split();

        let generation = self.generation;
        let reports = self.report_sender.clone();
        let ended = contact.clone();
        let task = tokio::spawn(async move {
            let result = run_stream(ctx, reader, writer).await;
            let _ = reports.send(Report::StreamEnded {
                generation,
                contact: ended,
                stream_id,
                result,
            });
        });

        info!(%contact, ?address, initiated_locally, stream_id, "stream established");
        self.streams.insert(
            contact,
            StreamEntry {
                id: stream_id,
                initiated_locally,
                task,
            },
        );
    }

    // ---- Reconciliation ----

    /// Ensure streams to every contact and resend unread own messages
    ///
    /// Returns whether an account change was detected.
    async fn reconcile(&mut self) -> bool {
        let Some(account) = self.active.as_ref().map(|host| host.account.clone()) else {
            return self.account_changed();
        };

        let page_size = self.config.contacts_page_size;
        let mut offset = 0;
        loop {
            let contacts = match self.store.contacts(&account, offset, page_size) {
                Ok(contacts) => contacts,
                Err(e) => {
                    debug!(error = %e, "reconciliation skipped");
                    return false;
                }
            };
            for contact in &contacts {
                if self.account_changed() {
                    info!("account changed during reconciliation");
                    return true;
                }
                self.ensure_stream(&contact.public_key).await;
                if self.streams.contains_key(&contact.public_key) {
                    self.resend_unread(&account, &contact.public_key);
                }
            }
            if contacts.len() < page_size {
                return false;
            }
            offset += page_size;
        }
    }

    /// Queue own messages the contact has not read yet
    ///
    /// Undelivered messages go first. Delivered but unread ones follow, starting
    /// from a per-contact cursor so that each of them gets a turn when they do not
    /// all fit in the outbound mailbox.
    fn resend_unread(&mut self, account: &PublicKeyHex, contact: &PublicKeyHex) {
        let page_size = self.config.messages_page_size;
        let mut undelivered = Vec::new();
        let mut unread = Vec::new();
        let mut offset = 0;
        loop {
            let messages = match self.store.messages(account, contact, offset, page_size) {
                Ok(messages) => messages,
                Err(e) => {
                    debug!(%contact, error = %e, "cannot load messages for resend");
                    return;
                }
            };
            let last_page = messages.len() < page_size;
            for message in messages {
                if !message.is_authored_by(account) {
                    continue;
                }
                match message.state {
                    MessageState::Stateless => undelivered.push(message),
                    MessageState::Received => unread.push(message),
                    MessageState::Read => {}
                }
            }
            if last_page {
                break;
            }
            offset += page_size;
        }
        if undelivered.is_empty() && unread.is_empty() {
            self.resend_cursors.remove(contact);
            return;
        }

        let cursor = self.resend_cursors.entry(contact.clone()).or_insert(0);
        if !unread.is_empty() {
            let len = unread.len();
            unread.rotate_left(*cursor % len);
        }
        let outbound = self.mailboxes.outbound(contact);
        for message in undelivered.into_iter().chain(unread) {
            let received = message.state == MessageState::Received;
            let id = message.id.clone();
            if let Err(e) = outbound.offer(message) {
                debug!(%contact, %id, reason = ?e, "resend deferred");
                return;
            }
            if received {
                *cursor = cursor.wrapping_add(1);
            }
        }
    }
}

// ---- Acceptor ----

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Delay before the next `accept` after consecutive failures
#[derive(Debug)]
struct AcceptBackoff {
    next: Duration,
}

impl AcceptBackoff {
    fn new() -> Self {
        Self {
            next: ACCEPT_BACKOFF_MIN,
        }
    }

    fn failed(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(ACCEPT_BACKOFF_MAX);
        delay
    }

    fn reset(&mut self) {
        self.next = ACCEPT_BACKOFF_MIN;
    }
}

/// Accept and secure inbound connections until aborted
///
/// Accept errors such as running out of file descriptors are transient; they are
/// logged and retried after a growing delay while existing streams keep running.
async fn accept_loop(
    host: Host,
    generation: u64,
    reports: mpsc::UnboundedSender<Report>,
    handshake_timeout: Duration,
) {
    let mut backoff = AcceptBackoff::new();
    loop {
        match host.accept().await {
            Ok((stream, address)) => {
                backoff.reset();
                let identity = host.identity().clone();
                let reports = reports.clone();
                tokio::spawn(async move {
                    match Host::secure_inbound(&identity, stream, handshake_timeout).await {
                        Ok(connection) => {
                            let _ = reports.send(Report::Connected {
                                generation,
                                connection,
                            });
                        }
                        Err(e) => debug!(%address, error = %e, "inbound handshake failed"),
                    }
                });
            }
            Err(error) => {
                let delay = backoff.failed();
                warn!(error = %error, retry_in = ?delay, "accept failed");
                sleep(delay).await;
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Session Builder
// ----------------------------------------------------------------------------

/// Builder for a running session manager
pub struct SessionBuilder {
    store: RecordStore,
    config: SessionConfig,
    directory: Option<Arc<dyn PeerDirectory>>,
}

impl SessionBuilder {
    pub fn new(store: RecordStore) -> Self {
        Self {
            store,
            config: SessionConfig::default(),
            directory: None,
        }
    }

    /// Builder using the `session` section and the `peers` of `config`
    pub fn from_config(store: RecordStore, config: &PeerpostConfig) -> Result<Self> {
        Self::new(store)
            .with_config(config.session.clone())
            .with_peers(&config.peers)
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_directory(mut self, directory: Arc<dyn PeerDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Use a static directory of the given peers
    pub fn with_peers(self, peers: &[PeerEntry]) -> Result<Self> {
        let directory = StaticDirectory::from_entries(peers)?;
        Ok(self.with_directory(Arc::new(directory)))
    }

    /// Spawn the supervisor and return its handle
    pub async fn build_and_start(self) -> Result<SessionHandle> {
        let config = self.config;
        if config.outbound_capacity == 0 || config.inbound_capacity == 0 {
            return Err(PeerpostError::config_error("mailbox capacity cannot be zero"));
        }
        if config.contacts_page_size == 0 || config.messages_page_size == 0 {
            return Err(PeerpostError::config_error("page sizes cannot be zero"));
        }
        if config.reconcile_interval_ms == 0 {
            return Err(PeerpostError::config_error("reconcile interval cannot be zero"));
        }

        let directory = self
            .directory
            .unwrap_or_else(|| Arc::new(StaticDirectory::new()));
        let mailboxes = Arc::new(Mailboxes::new(
            config.inbound_capacity,
            config.outbound_capacity,
        ));
        let (command_sender, commands) = mpsc::channel(COMMAND_BUFFER);
        let (report_sender, reports) = mpsc::unbounded_channel();
        let (state, state_receiver) = watch::channel(SessionState::Idle);

        let manager = SessionManager {
            store: self.store.clone(),
            config,
            directory,
            mailboxes: mailboxes.clone(),
            commands,
            report_sender,
            reports,
            state,
            active: None,
            streams: HashMap::new(),
            dialing: HashMap::new(),
            resend_cursors: HashMap::new(),
            generation: 0,
            next_stream_id: 0,
        };
        let task = tokio::spawn(manager.run());

        Ok(SessionHandle {
            store: self.store,
            mailboxes,
            commands: command_sender,
            state: state_receiver,
            task: Some(task),
        })
    }
}

// ----------------------------------------------------------------------------
// Session Handle
// ----------------------------------------------------------------------------

/// Handle to a running session manager
///
/// Dropping the handle stops the supervisor.
pub struct SessionHandle {
    store: RecordStore,
    mailboxes: Arc<Mailboxes>,
    commands: mpsc::Sender<SessionCommand>,
    state: watch::Receiver<SessionState>,
    task: Option<JoinHandle<Result<()>>>,
}

impl SessionHandle {
    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn state_receiver(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.state.borrow().listen_addr()
    }

    /// Wait until a host is listening and return its address
    pub async fn wait_for_host(&self) -> Result<SocketAddr> {
        let mut state = self.state.clone();
        loop {
            match &*state.borrow_and_update() {
                SessionState::HostActive { listen_addr, .. } => return Ok(*listen_addr),
                SessionState::Stopped => return Err(SessionError::SupervisorStopped.into()),
                _ => {}
            }
            state
                .changed()
                .await
                .map_err(|_| PeerpostError::from(SessionError::SupervisorStopped))?;
        }
    }

    /// Persist a text message to `contact` and schedule its delivery
    pub async fn send_message(
        &self,
        contact: &PublicKeyHex,
        text: impl Into<String>,
        created_at: Timestamp,
    ) -> Result<Message> {
        let account = self.account()?;
        let message = Message::new(account.clone(), contact.clone(), text, created_at);
        self.deliver(&account, message).await
    }

    /// Persist an audio message to `contact` and schedule its delivery
    pub async fn send_audio_message(
        &self,
        contact: &PublicKeyHex,
        audio: Vec<u8>,
        created_at: Timestamp,
    ) -> Result<Message> {
        let account = self.account()?;
        let message =
            Message::new(account.clone(), contact.clone(), "", created_at).with_audio(audio);
        self.deliver(&account, message).await
    }

    /// Mark every message from `contact` as read
    ///
    /// The author learns about it when its next resend is acknowledged.
    pub fn mark_read(&self, contact: &PublicKeyHex) -> Result<usize> {
        let account = self.account()?;
        self.store.mark_prev_messages_as_read(&account, contact)
    }

    /// Receiving end of the inbound mailbox for `contact`
    ///
    /// The receiver closes when the session reloads; fetch it again afterwards.
    pub fn inbound(&self, contact: &PublicKeyHex) -> MailboxReceiver {
        self.mailboxes.inbound(contact).receiver()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the supervisor and every task it owns
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("shutting down session");
        let _ = self.commands.send(SessionCommand::Shutdown).await;

        if let Some(task) = self.task.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
                Ok(Ok(result)) => result?,
                Ok(Err(e)) => {
                    return Err(PeerpostError::channel_error(format!(
                        "session task panicked: {e}"
                    )))
                }
                Err(_) => warn!("session task did not stop in time"),
            }
        }
        Ok(())
    }

    fn account(&self) -> Result<PublicKeyHex> {
        self.store
            .current_account()?
            .map(|account| account.public_key)
            .ok_or_else(|| SessionError::AccountNotSet.into())
    }

    async fn deliver(&self, account: &PublicKeyHex, mut message: Message) -> Result<Message> {
        message.validate_for(account)?;
        self.store.save_or_update_message(account, &mut message)?;

        let contact = message.recipient.clone();
        match self.mailboxes.outbound(&contact).offer(message.clone()) {
            Ok(()) => {}
            Err(OfferError::Full) => {
                warn!(id = %message.id, %contact, "outbound mailbox full, left for reconciliation")
            }
            Err(OfferError::Closed) => {}
        }
        self.commands
            .send(SessionCommand::EnsureStream { contact })
            .await
            .map_err(|_| SessionError::SupervisorStopped)?;
        Ok(message)
    }
}

impl core::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("state", &*self.state.borrow())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerpost_core::{EventBroker, StoreConfig};

    fn open_store() -> RecordStore {
        let store = RecordStore::new(StoreConfig::testing(), EventBroker::default());
        store.open_temporary("password").unwrap();
        store
    }

    #[test]
    fn test_session_state_accessors() {
        let addr: SocketAddr = "127.0.0.1:4100".parse().unwrap();
        let active = SessionState::HostActive {
            account: PublicKeyHex::from_bytes(&[1; 32]),
            listen_addr: addr,
        };
        assert!(active.is_active());
        assert_eq!(active.listen_addr(), Some(addr));
        assert!(!SessionState::Reloading.is_active());
        assert_eq!(SessionState::Idle.listen_addr(), None);
    }

    #[test]
    fn test_stale_reports_are_recognized() {
        let report = Report::DialFailed {
            generation: 3,
            contact: PublicKeyHex::from_bytes(&[2; 32]),
            error: PeerpostError::config_error("test"),
        };
        assert_eq!(report.generation(), 3);
    }

    #[test]
    fn test_accept_backoff_grows_and_resets() {
        let mut backoff = AcceptBackoff::new();
        assert_eq!(backoff.failed(), ACCEPT_BACKOFF_MIN);
        assert_eq!(backoff.failed(), ACCEPT_BACKOFF_MIN * 2);
        for _ in 0..20 {
            backoff.failed();
        }
        assert_eq!(backoff.failed(), ACCEPT_BACKOFF_MAX);
        backoff.reset();
        assert_eq!(backoff.failed(), ACCEPT_BACKOFF_MIN);
    }

    #[tokio::test]
    async fn test_zero_capacity_rejected() {
        let config = SessionConfig {
            outbound_capacity: 0,
            ..SessionConfig::testing()
        };
        let result = SessionBuilder::new(open_store())
            .with_config(config)
            .build_and_start()
            .await;
        assert!(matches!(result, Err(PeerpostError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_shutdown_reports_stopped() {
        let store = open_store();
        store.auto_create_account().unwrap();
        let mut handle = SessionBuilder::new(store)
            .with_config(SessionConfig::testing())
            .build_and_start()
            .await
            .unwrap();

        handle.wait_for_host().await.unwrap();
        assert!(handle.listen_addr().is_some());
        handle.shutdown().await.unwrap();
        assert_eq!(handle.state(), SessionState::Stopped);
        assert!(!handle.is_running());
    }
}
