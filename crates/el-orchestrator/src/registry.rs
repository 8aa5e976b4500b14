//! Session registry: owns all live sessions, deploy jobs, and run sessions
//!
//! All orchestration state is keyed by explicit ids; there is no ambient
//! "current session". The jobs/runs maps and their `(session, demo)` indices
//! live under a single short-held mutex that is never held across a remote
//! call, so the indices always point at records that exist in the primary
//! maps.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use el_core::config::{DemoOverrides, DemoSpec};
use el_core::error::{ConnectionError, RegistryError};
use el_core::logbuf::{sanitize, RingBuffer};
use el_core::remote::{ChannelAbort, ConnectDescriptor, RemoteExec, Tunnel};
use el_core::types::{DeployStatus, Event, JobId, RunId, RunInfo, RunStatus, SessionId};

use crate::connect::Connect;
use crate::hub::{EventHub, Subscription, Target};

/// How long shutdown waits for a worker before aborting it
const WORKER_GRACE: Duration = Duration::from_secs(5);

/// One authenticated device connection and its derived state
pub struct Session {
    pub id: SessionId,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub remote: Arc<dyn RemoteExec>,
    state: Mutex<SessionState>,
}

#[derive(Default)]
struct SessionState {
    deployed: HashSet<String>,
    overrides: HashMap<String, DemoOverrides>,
}

impl Session {
    fn new(descriptor: &ConnectDescriptor, remote: Arc<dyn RemoteExec>) -> Self {
        Self {
            id: SessionId::new(),
            host: descriptor.host.clone(),
            port: descriptor.port,
            username: descriptor.username.clone(),
            remote,
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Record that a demo's install completed on this device
    pub fn mark_deployed(&self, demo_id: &str) {
        self.state
            .lock()
            .unwrap()
            .deployed
            .insert(demo_id.to_string());
    }

    pub fn is_marked_deployed(&self, demo_id: &str) -> bool {
        self.state.lock().unwrap().deployed.contains(demo_id)
    }

    /// Set operator overrides for one demo on this session
    pub fn set_overrides(&self, demo_id: &str, overrides: DemoOverrides) {
        self.state
            .lock()
            .unwrap()
            .overrides
            .insert(demo_id.to_string(), overrides);
    }

    pub fn overrides_for(&self, demo_id: &str) -> Option<DemoOverrides> {
        self.state.lock().unwrap().overrides.get(demo_id).cloned()
    }
}

/// One deploy attempt
pub struct DeployJob {
    pub id: JobId,
    pub session_id: SessionId,
    pub demo_id: String,
    cancel: CancellationToken,
    state: Mutex<JobState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct JobState {
    status: DeployStatus,
    exit_code: Option<i32>,
    log: RingBuffer,
    channel: Option<ChannelAbort>,
}

impl DeployJob {
    fn new(session_id: SessionId, demo_id: String) -> Self {
        Self {
            id: JobId::new(),
            session_id,
            demo_id,
            cancel: CancellationToken::new(),
            state: Mutex::new(JobState {
                status: DeployStatus::Pending,
                exit_code: None,
                log: RingBuffer::default(),
                channel: None,
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn status(&self) -> DeployStatus {
        self.state.lock().unwrap().status
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.state.lock().unwrap().exit_code
    }

    pub fn log_snapshot(&self) -> Vec<String> {
        self.state.lock().unwrap().log.list()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the job has been cancelled
    pub(crate) async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Record the in-flight stream so cancellation can force-close it
    pub(crate) fn set_channel(&self, abort: ChannelAbort) {
        self.state.lock().unwrap().channel = Some(abort);
    }

    /// Set the cancellation flag and force-close the remote channel.
    /// The worker observes the flag at its next poll and finalizes the job.
    pub fn cancel(&self) {
        let channel = self.state.lock().unwrap().channel.clone();
        self.cancel.cancel();
        if let Some(abort) = channel {
            abort.abort();
        }
    }

    fn set_worker(&self, handle: JoinHandle<()>) {
        *self.worker.lock().unwrap() = Some(handle);
    }

    fn take_worker(&self) -> Option<JoinHandle<()>> {
        self.worker.lock().unwrap().take()
    }
}

/// One running workload instance
pub struct RunSession {
    pub id: RunId,
    pub session_id: SessionId,
    pub demo_id: String,
    cancel: CancellationToken,
    state: Mutex<RunState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RunSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunSession")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("demo_id", &self.demo_id)
            .finish_non_exhaustive()
    }
}

struct RunState {
    status: RunStatus,
    remote_pid: Option<u32>,
    remote_port: Option<u16>,
    process_ident: String,
    tunnel: Option<Box<dyn Tunnel>>,
    local_port: Option<u16>,
    log: RingBuffer,
}

impl RunSession {
    fn new(session_id: SessionId, demo_id: String) -> Self {
        Self {
            id: RunId::new(),
            session_id,
            demo_id,
            cancel: CancellationToken::new(),
            state: Mutex::new(RunState {
                status: RunStatus::Starting,
                remote_pid: None,
                remote_port: None,
                process_ident: String::new(),
                tunnel: None,
                local_port: None,
                log: RingBuffer::default(),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn status(&self) -> RunStatus {
        self.state.lock().unwrap().status
    }

    pub fn remote_pid(&self) -> Option<u32> {
        self.state.lock().unwrap().remote_pid
    }

    pub fn remote_port(&self) -> Option<u16> {
        self.state.lock().unwrap().remote_port
    }

    pub fn local_port(&self) -> Option<u16> {
        self.state.lock().unwrap().local_port
    }

    pub fn log_snapshot(&self) -> Vec<String> {
        self.state.lock().unwrap().log.list()
    }

    pub(crate) fn set_remote_pid(&self, pid: Option<u32>) {
        self.state.lock().unwrap().remote_pid = pid;
    }

    pub(crate) fn set_remote_port(&self, port: u16) {
        self.state.lock().unwrap().remote_port = Some(port);
    }

    pub(crate) fn set_process_ident(&self, ident: String) {
        self.state.lock().unwrap().process_ident = ident;
    }

    pub(crate) fn process_ident(&self) -> String {
        self.state.lock().unwrap().process_ident.clone()
    }

    pub(crate) fn set_tunnel(&self, tunnel: Box<dyn Tunnel>, local_port: u16) {
        let mut state = self.state.lock().unwrap();
        state.tunnel = Some(tunnel);
        state.local_port = Some(local_port);
    }

    pub(crate) fn take_tunnel(&self) -> Option<Box<dyn Tunnel>> {
        self.state.lock().unwrap().tunnel.take()
    }

    /// Clear pid/port/tunnel bookkeeping after the workload is gone
    pub(crate) fn clear_runtime(&self) {
        let mut state = self.state.lock().unwrap();
        state.remote_pid = None;
        state.remote_port = None;
        state.local_port = None;
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn set_worker(&self, handle: JoinHandle<()>) {
        *self.worker.lock().unwrap() = Some(handle);
    }

    fn take_worker(&self) -> Option<JoinHandle<()>> {
        self.worker.lock().unwrap().take()
    }
}

#[derive(Default)]
struct RegistryInner {
    deploy_jobs: HashMap<JobId, Arc<DeployJob>>,
    run_sessions: HashMap<RunId, Arc<RunSession>>,
    deploy_by_demo: HashMap<(SessionId, String), JobId>,
    run_by_demo: HashMap<(SessionId, String), RunId>,
}

/// Thread-safe CRUD over sessions, deploy jobs, and run sessions, plus the
/// broadcast hub fanning progress out to live subscribers.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    inner: Mutex<RegistryInner>,
    hub: EventHub,
    connector: Arc<dyn Connect>,
}

impl SessionRegistry {
    pub fn new(connector: Arc<dyn Connect>) -> Self {
        Self {
            sessions: DashMap::new(),
            inner: Mutex::new(RegistryInner::default()),
            hub: EventHub::spawn(),
            connector,
        }
    }

    // ---- sessions ----

    /// Connect to a device and register the session.
    pub async fn create_session(
        &self,
        descriptor: ConnectDescriptor,
    ) -> Result<Arc<Session>, ConnectionError> {
        let remote = self.connector.connect(&descriptor).await?;
        let session = Arc::new(Session::new(&descriptor, remote));
        self.sessions
            .insert(session.id.clone(), Arc::clone(&session));
        tracing::info!("Session {} created for {}", session.id, session.host);
        Ok(session)
    }

    pub fn session(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|r| Arc::clone(&r))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Disconnect a session, tearing down everything it owns.
    pub async fn remove_session(&self, id: &SessionId) -> bool {
        let Some((_, session)) = self.sessions.remove(id) else {
            return false;
        };

        let (jobs, runs) = {
            let inner = self.inner.lock().unwrap();
            let jobs: Vec<_> = inner
                .deploy_jobs
                .values()
                .filter(|j| j.session_id == *id)
                .cloned()
                .collect();
            let runs: Vec<_> = inner
                .run_sessions
                .values()
                .filter(|r| r.session_id == *id)
                .cloned()
                .collect();
            (jobs, runs)
        };

        for job in &jobs {
            job.cancel();
        }
        for run in &runs {
            run.cancel();
            crate::run::stop_run(self, run, &session).await;
        }

        session.remote.close().await;
        tracing::info!("Session {} removed", id);
        true
    }

    // ---- deploy jobs ----

    /// Create a deploy job record. An existing job for the same
    /// `(session, demo)` pair is evicted (not awaited) and cancelled.
    pub fn create_deploy_job(
        &self,
        session_id: &SessionId,
        demo_id: &str,
    ) -> Result<Arc<DeployJob>, RegistryError> {
        if !self.sessions.contains_key(session_id) {
            return Err(RegistryError::SessionNotFound(session_id.to_string()));
        }

        let job = Arc::new(DeployJob::new(session_id.clone(), demo_id.to_string()));
        let evicted = {
            let mut inner = self.inner.lock().unwrap();
            let key = (session_id.clone(), demo_id.to_string());
            let old_id = inner.deploy_by_demo.insert(key, job.id.clone());
            let evicted = old_id.and_then(|old_id| inner.deploy_jobs.remove(&old_id));
            inner.deploy_jobs.insert(job.id.clone(), Arc::clone(&job));
            evicted
        };
        if let Some(old) = evicted {
            tracing::debug!("Evicting deploy job {} for {}", old.id, demo_id);
            old.cancel();
            self.hub.remove_target(Target::Job(old.id.clone()));
        }
        Ok(job)
    }

    pub fn get_deploy_job(&self, id: &JobId) -> Option<Arc<DeployJob>> {
        self.inner.lock().unwrap().deploy_jobs.get(id).cloned()
    }

    pub fn active_deploy_job(&self, session_id: &SessionId, demo_id: &str) -> Option<Arc<DeployJob>> {
        let inner = self.inner.lock().unwrap();
        let id = inner
            .deploy_by_demo
            .get(&(session_id.clone(), demo_id.to_string()))?;
        inner.deploy_jobs.get(id).cloned()
    }

    pub fn deploy_job_count(&self) -> usize {
        self.inner.lock().unwrap().deploy_jobs.len()
    }

    /// Request cooperative cancellation of a deploy job.
    pub fn cancel_deploy_job(&self, id: &JobId) -> Result<(), RegistryError> {
        let job = self
            .get_deploy_job(id)
            .ok_or_else(|| RegistryError::JobNotFound(id.to_string()))?;
        job.cancel();
        Ok(())
    }

    /// Spawn the deploy worker for a job.
    pub fn spawn_deploy(
        self: &Arc<Self>,
        job: &Arc<DeployJob>,
        demo: &DemoSpec,
    ) -> Result<(), RegistryError> {
        let session = self
            .session(&job.session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(job.session_id.to_string()))?;
        let registry = Arc::clone(self);
        let task_job = Arc::clone(job);
        let demo = demo.clone();
        let handle = tokio::spawn(async move {
            crate::deploy::run_deploy(&registry, &task_job, &session, &demo).await;
        });
        job.set_worker(handle);
        Ok(())
    }

    /// Create a job and start its worker in one step.
    pub fn deploy_demo(
        self: &Arc<Self>,
        session_id: &SessionId,
        demo: &DemoSpec,
    ) -> Result<Arc<DeployJob>, RegistryError> {
        let job = self.create_deploy_job(session_id, &demo.id)?;
        self.spawn_deploy(&job, demo)?;
        Ok(job)
    }

    // ---- run sessions ----

    /// Create a run record. Refused while an active run exists for the pair;
    /// a terminal leftover record is evicted.
    pub fn create_run_session(
        &self,
        session_id: &SessionId,
        demo_id: &str,
    ) -> Result<Arc<RunSession>, RegistryError> {
        if !self.sessions.contains_key(session_id) {
            return Err(RegistryError::SessionNotFound(session_id.to_string()));
        }

        let run = Arc::new(RunSession::new(session_id.clone(), demo_id.to_string()));
        let evicted = {
            let mut inner = self.inner.lock().unwrap();
            let key = (session_id.clone(), demo_id.to_string());
            if let Some(existing_id) = inner.run_by_demo.get(&key) {
                if let Some(existing) = inner.run_sessions.get(existing_id) {
                    if existing.status().is_active() {
                        return Err(RegistryError::RunActive {
                            session_id: session_id.to_string(),
                            demo_id: demo_id.to_string(),
                        });
                    }
                }
            }
            let old_id = inner.run_by_demo.insert(key, run.id.clone());
            let evicted = old_id.and_then(|old_id| inner.run_sessions.remove(&old_id));
            inner.run_sessions.insert(run.id.clone(), Arc::clone(&run));
            evicted
        };
        if let Some(old) = evicted {
            self.hub.remove_target(Target::Run(old.id.clone()));
        }
        Ok(run)
    }

    pub fn get_run_session(&self, id: &RunId) -> Option<Arc<RunSession>> {
        self.inner.lock().unwrap().run_sessions.get(id).cloned()
    }

    pub fn active_run(&self, session_id: &SessionId, demo_id: &str) -> Option<Arc<RunSession>> {
        let inner = self.inner.lock().unwrap();
        let id = inner
            .run_by_demo
            .get(&(session_id.clone(), demo_id.to_string()))?;
        inner.run_sessions.get(id).cloned()
    }

    pub fn run_count(&self) -> usize {
        self.inner.lock().unwrap().run_sessions.len()
    }

    /// Spawn the run worker for a run session.
    pub fn spawn_run(
        self: &Arc<Self>,
        run: &Arc<RunSession>,
        demo: &DemoSpec,
    ) -> Result<(), RegistryError> {
        let session = self
            .session(&run.session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(run.session_id.to_string()))?;
        let registry = Arc::clone(self);
        let task_run = Arc::clone(run);
        let demo = demo.clone();
        let handle = tokio::spawn(async move {
            crate::run::run_demo(&registry, &task_run, &session, &demo).await;
        });
        run.set_worker(handle);
        Ok(())
    }

    /// Create a run and start its worker in one step.
    pub fn start_run(
        self: &Arc<Self>,
        session_id: &SessionId,
        demo: &DemoSpec,
    ) -> Result<Arc<RunSession>, RegistryError> {
        let run = self.create_run_session(session_id, &demo.id)?;
        self.spawn_run(&run, demo)?;
        Ok(run)
    }

    /// Stop a run: tunnel teardown, remote process kill, record removal.
    pub async fn stop_run(&self, id: &RunId) -> Result<(), RegistryError> {
        let run = self
            .get_run_session(id)
            .ok_or_else(|| RegistryError::RunNotFound(id.to_string()))?;
        let session = self
            .session(&run.session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(run.session_id.to_string()))?;
        run.cancel();
        crate::run::stop_run(self, &run, &session).await;
        Ok(())
    }

    /// Remove a run record and its index entry.
    pub(crate) fn remove_run_record(&self, id: &RunId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(run) = inner.run_sessions.remove(id) {
            let key = (run.session_id.clone(), run.demo_id.clone());
            if inner.run_by_demo.get(&key) == Some(id) {
                inner.run_by_demo.remove(&key);
            }
        }
        drop(inner);
        self.hub.remove_target(Target::Run(id.clone()));
    }

    // ---- logs, status, subscriptions ----

    /// Sanitize a line, append it to the job's ring buffer, and broadcast it.
    pub fn append_job_log(&self, job: &DeployJob, line: &str) {
        let clean = sanitize(line);
        job.state.lock().unwrap().log.append(clean.clone());
        self.hub.publish(Target::Job(job.id.clone()), Event::log(clean));
    }

    pub fn append_run_log(&self, run: &RunSession, line: &str) {
        let clean = sanitize(line);
        run.state.lock().unwrap().log.append(clean.clone());
        self.hub.publish(Target::Run(run.id.clone()), Event::log(clean));
    }

    /// Update a job's status and broadcast it. Transitions out of a terminal
    /// state are refused.
    pub fn set_job_status(&self, job: &DeployJob, status: DeployStatus, exit_code: Option<i32>) {
        {
            let mut state = job.state.lock().unwrap();
            if state.status.is_terminal() {
                tracing::warn!(
                    "Ignoring status transition {} -> {} for job {}",
                    state.status,
                    status,
                    job.id
                );
                return;
            }
            state.status = status;
            if exit_code.is_some() {
                state.exit_code = exit_code;
            }
        }
        self.hub.publish(
            Target::Job(job.id.clone()),
            Event::job_status(status, exit_code),
        );
    }

    pub fn set_run_status(&self, run: &RunSession, status: RunStatus, info: Option<RunInfo>) {
        {
            let mut state = run.state.lock().unwrap();
            if state.status.is_terminal() {
                tracing::warn!(
                    "Ignoring status transition {} -> {} for run {}",
                    state.status,
                    status,
                    run.id
                );
                return;
            }
            state.status = status;
        }
        self.hub
            .publish(Target::Run(run.id.clone()), Event::run_status(status, info));
    }

    /// Attach to a job's event stream. The subscription's backlog carries the
    /// ring buffer snapshot followed by the current status; the receiver then
    /// yields live events.
    pub fn subscribe_job(&self, id: &JobId) -> Result<Subscription, RegistryError> {
        let job = self
            .get_deploy_job(id)
            .ok_or_else(|| RegistryError::JobNotFound(id.to_string()))?;
        let backlog: Vec<Event> = {
            let state = job.state.lock().unwrap();
            let mut events: Vec<Event> = state.log.list().into_iter().map(Event::log).collect();
            events.push(Event::job_status(state.status, state.exit_code));
            events
        };
        let (sub_id, rx) = self.hub.attach(Target::Job(id.clone()));
        Ok(Subscription {
            id: sub_id,
            backlog,
            rx,
        })
    }

    pub fn subscribe_run(&self, id: &RunId) -> Result<Subscription, RegistryError> {
        let run = self
            .get_run_session(id)
            .ok_or_else(|| RegistryError::RunNotFound(id.to_string()))?;
        let backlog: Vec<Event> = {
            let state = run.state.lock().unwrap();
            let mut events: Vec<Event> = state.log.list().into_iter().map(Event::log).collect();
            events.push(Event::run_status(state.status, None));
            events
        };
        let (sub_id, rx) = self.hub.attach(Target::Run(id.clone()));
        Ok(Subscription {
            id: sub_id,
            backlog,
            rx,
        })
    }

    pub fn unsubscribe_job(&self, id: &JobId, subscriber: u64) {
        self.hub.detach(Target::Job(id.clone()), subscriber);
    }

    pub fn unsubscribe_run(&self, id: &RunId, subscriber: u64) {
        self.hub.detach(Target::Run(id.clone()), subscriber);
    }

    // ---- shutdown ----

    /// Orderly teardown for process exit: cancel every deploy job, stop every
    /// run through the same path as an explicit stop, await workers with a
    /// bounded grace, and close every session's client. Safe to call while
    /// orchestration is in flight.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down session registry");

        let (jobs, runs) = {
            let inner = self.inner.lock().unwrap();
            (
                inner.deploy_jobs.values().cloned().collect::<Vec<_>>(),
                inner.run_sessions.values().cloned().collect::<Vec<_>>(),
            )
        };

        for job in &jobs {
            job.cancel();
        }

        for run in &runs {
            run.cancel();
            match self.session(&run.session_id) {
                Some(session) => crate::run::stop_run(self, run, &session).await,
                None => {
                    if let Some(tunnel) = run.take_tunnel() {
                        tunnel.stop().await;
                    }
                    self.remove_run_record(&run.id);
                }
            }
        }

        let mut handles = Vec::new();
        for job in &jobs {
            handles.extend(job.take_worker());
        }
        for run in &runs {
            handles.extend(run.take_worker());
        }
        let results = futures::future::join_all(
            handles
                .iter_mut()
                .map(|handle| tokio::time::timeout(WORKER_GRACE, handle)),
        )
        .await;
        for (result, handle) in results.iter().zip(&handles) {
            if result.is_err() {
                handle.abort();
            }
        }

        let sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.sessions.clear();
        for session in sessions {
            session.remote.close().await;
        }

        tracing::info!("Session registry shut down");
    }
}
