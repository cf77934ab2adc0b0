//! Lifecycle of the remote tool sessions behind the agent.
//!
//! One background task owns every session. It opens them in configured order,
//! loads their catalogs, reports readiness, serves tool calls and finally closes
//! them when told to stop. Callers only ever signal or await that task, so
//! sessions are always opened and closed from the same context.
//!
//! Readiness is published on a watch channel that the coordinator itself keeps,
//! so an initializer that is cancelled mid-wait never strands the state: the
//! next `init()` finds the published catalog and completes the transition.

use futures::FutureExt;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clients::Message;
use crate::core::{Agent, AgentBuilder, AgentError, AgentResponse};
use crate::mcp::{self, MCPConfig, MCPError, McpConnector, SessionConnector, ToolDescriptor, ToolSession};

mod router;

use router::{ToolCallRequest, ToolRouter};

const CALL_QUEUE_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Uninitialized,
    Starting,
    Ready,
    Stopping,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CoordinatorState::Uninitialized => "uninitialized",
            CoordinatorState::Starting => "starting",
            CoordinatorState::Ready => "ready",
            CoordinatorState::Stopping => "stopping",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("Failed to open session {server}: {source}")]
    SessionOpen { server: String, source: MCPError },
    #[error("Failed to load tool catalog from {server}: {source}")]
    CatalogLoad { server: String, source: MCPError },
    #[error("Initialization was interrupted by shutdown")]
    Interrupted,
    #[error("Session task exited before reporting readiness")]
    RunnerExited,
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Agent is not initialized")]
    NotInitialized,
    #[error("Coordinator is shutting down")]
    ShuttingDown,
    #[error("Initialization failed: {0}")]
    Initialization(#[from] InitError),
    #[error(transparent)]
    Agent(#[from] AgentError),
}

/// Outcome of closing every session; failures never abort the shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub closed: Vec<String>,
    pub failures: Vec<(String, String)>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Readiness {
    Opening,
    Ready(Vec<ToolDescriptor>),
}

impl Readiness {
    fn is_reported(&self) -> bool {
        !matches!(self, Readiness::Opening)
    }
}

/// Result of the session task: its close report, or why it never became ready.
type RunnerOutcome = Result<ShutdownReport, InitError>;

struct SessionRunner {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<RunnerOutcome>,
    ready: watch::Receiver<Readiness>,
    calls: mpsc::Sender<ToolCallRequest>,
}

impl SessionRunner {
    fn catalog(&self) -> Option<Vec<ToolDescriptor>> {
        match &*self.ready.borrow() {
            Readiness::Ready(catalog) => Some(catalog.clone()),
            Readiness::Opening => None,
        }
    }
}

struct Inner {
    state: CoordinatorState,
    generation: u64,
    runner: Option<SessionRunner>,
    catalog: Vec<ToolDescriptor>,
    agent: Option<Arc<dyn Agent>>,
}

pub struct Coordinator {
    servers: Vec<String>,
    connector: Arc<dyn SessionConnector>,
    builder: Arc<dyn AgentBuilder>,
    inner: Mutex<Inner>,
}

impl Coordinator {
    pub fn new(
        servers: Vec<String>,
        connector: Arc<dyn SessionConnector>,
        builder: Arc<dyn AgentBuilder>,
    ) -> Self {
        Self {
            servers,
            connector,
            builder,
            inner: Mutex::new(Inner {
                state: CoordinatorState::Uninitialized,
                generation: 0,
                runner: None,
                catalog: Vec::new(),
                agent: None,
            }),
        }
    }

    /// Coordinator over every server in `config`, using the built-in transports.
    pub fn from_config(config: MCPConfig, builder: Arc<dyn AgentBuilder>) -> Self {
        let servers = config.server_names();
        Self::new(servers, Arc::new(McpConnector::new(config)), builder)
    }

    pub async fn state(&self) -> CoordinatorState {
        self.inner.lock().await.state
    }

    /// Snapshot of the aggregated catalog; empty unless ready.
    pub async fn catalog(&self) -> Vec<ToolDescriptor> {
        self.inner.lock().await.catalog.clone()
    }

    pub async fn init(&self) -> Result<(), CoordinatorError> {
        let (mut ready, generation) = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                CoordinatorState::Ready => return Ok(()),
                CoordinatorState::Stopping => return Err(CoordinatorError::ShuttingDown),
                CoordinatorState::Starting => {
                    let (reported, finished) = inner.runner.as_ref().map_or((false, true), |runner| {
                        (runner.ready.borrow().is_reported(), runner.handle.is_finished())
                    });
                    if reported {
                        debug!("Completing an initialization whose caller went away");
                        return self.settle(&mut inner).await.map_err(Into::into);
                    }
                    if !finished {
                        return Ok(());
                    }
                    warn!("Previous initialization was abandoned, starting over");
                    if let Some(runner) = inner.runner.take() {
                        if let Ok(Err(e)) = runner.handle.await {
                            debug!(error = %e, "Abandoned initialization had failed");
                        }
                    }
                }
                CoordinatorState::Uninitialized => {}
            }

            inner.state = CoordinatorState::Starting;
            inner.generation += 1;

            let (ready_tx, ready_rx) = watch::channel(Readiness::Opening);
            let (stop_tx, stop_rx) = oneshot::channel();
            let (calls_tx, calls_rx) = mpsc::channel(CALL_QUEUE_DEPTH);
            let handle = tokio::spawn(run_sessions(
                Arc::clone(&self.connector),
                self.servers.clone(),
                ready_tx,
                stop_rx,
                calls_rx,
            ));
            inner.runner = Some(SessionRunner {
                stop: stop_tx,
                handle,
                ready: ready_rx.clone(),
                calls: calls_tx,
            });
            info!(servers = ?self.servers, "Initializing tool sessions");
            (ready_rx, inner.generation)
        };

        if ready.wait_for(Readiness::is_reported).await.is_err() {
            debug!("Session task ended before reporting readiness");
        }

        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            return Err(InitError::Interrupted.into());
        }
        match inner.state {
            CoordinatorState::Starting => self.settle(&mut inner).await.map_err(Into::into),
            CoordinatorState::Ready => Ok(()),
            CoordinatorState::Uninitialized | CoordinatorState::Stopping => {
                Err(InitError::Interrupted.into())
            }
        }
    }

    /// Moves a `Starting` coordinator to `Ready`, or back to `Uninitialized` if
    /// the session task ended without a catalog.
    async fn settle(&self, inner: &mut Inner) -> Result<(), InitError> {
        let ready = inner
            .runner
            .as_ref()
            .and_then(|runner| runner.catalog().map(|catalog| (catalog, runner.calls.clone())));
        if let Some((catalog, calls)) = ready {
            let executor = Arc::new(ToolRouter::new(&catalog, calls));
            let agent = self.builder.build(catalog.clone(), executor);
            info!(tools = catalog.len(), "Coordinator ready");
            inner.catalog = catalog;
            inner.agent = Some(agent);
            inner.state = CoordinatorState::Ready;
            return Ok(());
        }

        inner.state = CoordinatorState::Uninitialized;
        let Some(runner) = inner.runner.take() else {
            return Err(InitError::RunnerExited);
        };
        match runner.handle.await {
            Ok(Err(e)) => {
                error!(error = %e, "Initialization failed");
                Err(e)
            }
            Ok(Ok(_)) => Err(InitError::Interrupted),
            Err(e) => {
                error!(error = %e, "Session task failed during initialization");
                Err(InitError::RunnerExited)
            }
        }
    }

    /// Runs one agent turn. Returns the agent's result and the messages passed in.
    pub async fn invoke(
        &self,
        messages: Vec<Message>,
    ) -> Result<(AgentResponse, Vec<Message>), CoordinatorError> {
        let agent = {
            let inner = self.inner.lock().await;
            match (inner.state, &inner.agent) {
                (CoordinatorState::Ready, Some(agent)) => Arc::clone(agent),
                _ => return Err(CoordinatorError::NotInitialized),
            }
        };

        let response = agent.invoke(messages.clone()).await?;
        Ok((response, messages))
    }

    pub async fn shutdown(&self) -> ShutdownReport {
        let runner = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                CoordinatorState::Uninitialized | CoordinatorState::Stopping => {
                    return ShutdownReport::default();
                }
                CoordinatorState::Starting | CoordinatorState::Ready => {}
            }
            inner.state = CoordinatorState::Stopping;
            inner.agent = None;
            inner.catalog.clear();
            inner.runner.take()
        };

        let report = match runner {
            Some(runner) => {
                let _ = runner.stop.send(());
                match runner.handle.await {
                    Ok(Ok(report)) => report,
                    Ok(Err(e)) => {
                        debug!(error = %e, "Session task had already failed");
                        ShutdownReport::default()
                    }
                    Err(e) => ShutdownReport {
                        closed: Vec::new(),
                        failures: vec![("session task".to_string(), e.to_string())],
                    },
                }
            }
            None => ShutdownReport::default(),
        };

        self.inner.lock().await.state = CoordinatorState::Uninitialized;

        for (server, failure) in &report.failures {
            warn!(server = %server, error = %failure, "Failed to close session");
        }
        info!(closed = report.closed.len(), failures = report.failures.len(), "Coordinator shut down");
        report
    }
}

type OpenSession = (String, Arc<dyn ToolSession>);

/// Owns the sessions for one init/shutdown cycle.
async fn run_sessions(
    connector: Arc<dyn SessionConnector>,
    servers: Vec<String>,
    ready: watch::Sender<Readiness>,
    mut stop: oneshot::Receiver<()>,
    mut calls: mpsc::Receiver<ToolCallRequest>,
) -> RunnerOutcome {
    let (sessions, outcome) = open_all(connector.as_ref(), &servers).await;

    let catalog = match outcome {
        Ok(catalog) => catalog,
        Err(e) => {
            let report = close_all(&sessions).await;
            debug!(closed = report.closed.len(), "Closed sessions after failed initialization");
            return Err(e);
        }
    };

    if !matches!(stop.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
        debug!("Stopped while opening, closing sessions");
        return Ok(close_all(&sessions).await);
    }
    ready.send_replace(Readiness::Ready(catalog));

    let mut in_flight: FuturesUnordered<BoxFuture<'static, ()>> = FuturesUnordered::new();
    let mut accepting = true;
    loop {
        tokio::select! {
            _ = &mut stop => break,
            request = calls.recv(), if accepting => match request {
                Some(request) => in_flight.push(dispatch(&sessions, request)),
                None => accepting = false,
            },
            Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
        }
    }

    if !in_flight.is_empty() {
        warn!(calls = in_flight.len(), "Abandoning in-flight tool calls");
    }
    drop(in_flight);
    calls.close();
    Ok(close_all(&sessions).await)
}

async fn open_all(
    connector: &dyn SessionConnector,
    servers: &[String],
) -> (Vec<OpenSession>, Result<Vec<ToolDescriptor>, InitError>) {
    let mut sessions: Vec<OpenSession> = Vec::with_capacity(servers.len());
    let mut catalog = Vec::new();

    for server in servers {
        let session: Arc<dyn ToolSession> = match connector.open(server).await {
            Ok(session) => Arc::from(session),
            Err(source) => {
                let error = InitError::SessionOpen {
                    server: server.clone(),
                    source,
                };
                return (sessions, Err(error));
            }
        };
        sessions.push((server.clone(), Arc::clone(&session)));

        match mcp::load_catalog(session.as_ref()).await {
            Ok(tools) => {
                info!(server = %server, tools = tools.len(), "Session open");
                catalog.extend(tools);
            }
            Err(source) => {
                let error = InitError::CatalogLoad {
                    server: server.clone(),
                    source,
                };
                return (sessions, Err(error));
            }
        }
    }

    (sessions, Ok(catalog))
}

fn dispatch(sessions: &[OpenSession], request: ToolCallRequest) -> BoxFuture<'static, ()> {
    let session = sessions
        .iter()
        .find(|(name, _)| *name == request.server)
        .map(|(_, session)| Arc::clone(session));

    async move {
        let ToolCallRequest {
            server,
            tool,
            arguments,
            reply,
        } = request;
        let result = match session {
            Some(session) => {
                debug!(server = %server, tool = %tool, "Dispatching tool call");
                session.call_tool(&tool, arguments).await
            }
            None => Err(MCPError::ServerNotFound(server)),
        };
        let _ = reply.send(result);
    }
    .boxed()
}

/// Closes every session in order, continuing past failures.
async fn close_all(sessions: &[OpenSession]) -> ShutdownReport {
    let mut report = ShutdownReport::default();
    for (server, session) in sessions {
        match session.close().await {
            Ok(()) => {
                debug!(server = %server, "Session closed");
                report.closed.push(server.clone());
            }
            Err(e) => {
                warn!(server = %server, error = %e, "Session close failed");
                report.failures.push((server.clone(), e.to_string()));
            }
        }
    }
    report
}
