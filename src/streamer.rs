//! The worker bridge: lifecycle, broadcast distribution, and the streaming
//! frame loops.
//!
//! One bridge instance owns exactly one worker process, one socket channel,
//! and one pair of scratch paths. The loops are strictly request/respond:
//! every iteration starts with a signal read from the worker, bounded by the
//! configured timeout outside debug mode.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::bridge::protocol::{
    InputSlot, SIGNAL_BUFFER_REQUEST, SIGNAL_BUFFER_REQUEST_G0, SIGNAL_BUFFER_REQUEST_G1,
    SIGNAL_ERROR, SIGNAL_FINISHED,
};
use crate::bridge::transport::{BridgeConnection, BridgeListener, Connection};
use crate::config::BridgeConfig;
use crate::supervisor::{
    Diagnostics, PythonSpawner, SpawnError, WorkerLaunch, WorkerProcess, WorkerSpawner,
};
use crate::transfer::{BroadcastSource, Collector, MetaRecord, RecordReceiver, RecordSender};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("worker for task {task} terminated prematurely during startup: {diagnostics}")]
    StartupFailure { task: String, diagnostics: String },

    #[error("worker for task {task} requested data even though none is available")]
    ProtocolViolation { task: String },

    #[error("worker for task {task} terminated prematurely due to an error: {diagnostics}")]
    WorkerError { task: String, diagnostics: String },

    #[error("worker for task {task} stopped responding: {diagnostics}")]
    Unresponsive { task: String, diagnostics: String },

    #[error("worker for task {task} closed the connection: {diagnostics}")]
    Disconnected { task: String, diagnostics: String },

    #[error("broadcast variable {name} is not registered with this task")]
    UnknownBroadcastVariable { name: String },

    #[error("bridge is not connected; call open() first")]
    NotConnected,

    #[error("i/o failure on the worker channel: {0}")]
    Io(#[from] io::Error),
}

/// Bridge between one host task and one external worker process.
///
/// Single-use: `open()` establishes the worker and socket, the streaming
/// calls drive the protocol, `close()` tears everything down. Dropping the
/// bridge without `close()` still kills the worker through the spawner's
/// `kill_on_drop` guard.
pub struct WorkerBridge<S, R> {
    config: BridgeConfig,
    spawner: Arc<dyn WorkerSpawner>,
    sender: S,
    receiver: R,
    diagnostics: Diagnostics,
    process: Option<WorkerProcess>,
    conn: Option<BridgeConnection>,
    closed: bool,
}

impl<S, R> WorkerBridge<S, R>
where
    S: RecordSender,
    R: RecordReceiver,
{
    pub fn new(config: BridgeConfig, sender: S, receiver: R) -> Self {
        Self {
            config,
            spawner: Arc::new(PythonSpawner),
            sender,
            receiver,
            diagnostics: Diagnostics::new(),
            process: None,
            conn: None,
            closed: false,
        }
    }

    /// Substitute the worker spawn strategy.
    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Start the worker and establish the socket channel.
    ///
    /// The listener is bound before the spawn so the port can go into the
    /// handshake preamble. A worker that exits within the grace period is a
    /// fatal startup failure and the accept is not attempted. In debug mode
    /// the worker is assumed to be started out of band and the accept may
    /// block indefinitely.
    pub async fn open(&mut self) -> Result<(), BridgeError> {
        let listener = BridgeListener::bind().await?;
        let input_path = self.config.input_path();
        let output_path = self.config.output_path();
        self.sender.open(&input_path)?;
        self.receiver.open(&output_path)?;

        if self.config.debug {
            tracing::info!(
                task = %self.config.task_name,
                port = listener.port(),
                plan = %self.config.plan_path.display(),
                "Debug mode: waiting for an externally started worker"
            );
            self.conn = Some(listener.accept(None).await?);
            return Ok(());
        }

        let launch = WorkerLaunch::from_config(&self.config);
        tracing::debug!(
            task = %self.config.task_name,
            interpreter = %launch.interpreter.display(),
            plan = %launch.plan_path.display(),
            "Spawning worker"
        );
        let mut process =
            WorkerProcess::launch(self.spawner.as_ref(), &launch, self.diagnostics.clone())?;

        let preamble_result = process
            .write_preamble(
                listener.port(),
                self.config.operator_id,
                &input_path,
                &output_path,
            )
            .await;

        // Give the interpreter time to parse the plan; an exit inside this
        // window is a startup failure (e.g. a syntax error in user code).
        tokio::time::sleep(self.config.grace_period).await;
        let exited = process.poll_exit()?;
        self.process = Some(process);

        if let Err(e) = preamble_result {
            tracing::error!(task = %self.config.task_name, error = %e, "Handshake preamble rejected");
            return Err(self.startup_failure());
        }
        if let Some(status) = exited {
            tracing::error!(task = %self.config.task_name, %status, "Worker exited during startup");
            return Err(self.startup_failure());
        }

        let conn = listener
            .accept(Some(self.config.read_timeout))
            .await
            .map_err(|e| classify(&self.config, &self.diagnostics, e))?;
        self.conn = Some(conn);
        tracing::debug!(task = %self.config.task_name, "Worker connected; bridge open");
        Ok(())
    }

    /// Distribute all configured broadcast variables to the worker.
    ///
    /// Runs to completion before the per-record loop begins.
    pub async fn send_broadcast_variables<B>(&mut self, source: &mut B) -> Result<(), BridgeError>
    where
        B: BroadcastSource<Record = S::Record>,
    {
        let Self {
            config,
            sender,
            conn,
            diagnostics,
            ..
        } = self;
        let conn = conn.as_mut().ok_or(BridgeError::NotConnected)?;
        run_broadcast(conn, sender, source, config, diagnostics).await
    }

    /// Stream one source through the worker, collecting all results.
    pub async fn stream_single<I, C>(
        &mut self,
        records: I,
        collector: &mut C,
    ) -> Result<(), BridgeError>
    where
        I: IntoIterator<Item = S::Record>,
        C: Collector<R::Record>,
    {
        let Self {
            config,
            sender,
            receiver,
            conn,
            diagnostics,
            ..
        } = self;
        let conn = conn.as_mut().ok_or(BridgeError::NotConnected)?;
        run_single(
            conn,
            sender,
            receiver,
            collector,
            records.into_iter(),
            config,
            diagnostics,
        )
        .await
    }

    /// Stream two independent sources through the worker (grouped/join
    /// processing), collecting all results.
    pub async fn stream_dual<I0, I1, C>(
        &mut self,
        first: I0,
        second: I1,
        collector: &mut C,
    ) -> Result<(), BridgeError>
    where
        I0: IntoIterator<Item = S::Record>,
        I1: IntoIterator<Item = S::Record>,
        C: Collector<R::Record>,
    {
        let Self {
            config,
            sender,
            receiver,
            conn,
            diagnostics,
            ..
        } = self;
        let conn = conn.as_mut().ok_or(BridgeError::NotConnected)?;
        run_dual(
            conn,
            sender,
            receiver,
            collector,
            first.into_iter(),
            second.into_iter(),
            config,
            diagnostics,
        )
        .await
    }

    /// Release the socket, both collaborators, and the worker process.
    ///
    /// Idempotent; failures in individual steps are logged and never abort
    /// the remaining teardown. Forced termination happens at most once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if self.conn.take().is_some() {
            tracing::debug!(task = %self.config.task_name, "Released worker connection");
        }
        if let Err(e) = self.sender.close() {
            tracing::error!(task = %self.config.task_name, error = %e, "Failed to close record sender");
        }
        if let Err(e) = self.receiver.close() {
            tracing::error!(task = %self.config.task_name, error = %e, "Failed to close record receiver");
        }
        if let Some(mut process) = self.process.take() {
            process.destroy().await;
        }
    }

    fn startup_failure(&self) -> BridgeError {
        BridgeError::StartupFailure {
            task: self.config.task_name.clone(),
            diagnostics: self.diagnostics.snapshot(),
        }
    }
}

fn classify(config: &BridgeConfig, diagnostics: &Diagnostics, e: io::Error) -> BridgeError {
    match e.kind() {
        io::ErrorKind::TimedOut => BridgeError::Unresponsive {
            task: config.task_name.clone(),
            diagnostics: diagnostics.snapshot(),
        },
        io::ErrorKind::UnexpectedEof => BridgeError::Disconnected {
            task: config.task_name.clone(),
            diagnostics: diagnostics.snapshot(),
        },
        _ => BridgeError::Io(e),
    }
}

async fn read_signal<R, W>(
    conn: &mut Connection<R, W>,
    config: &BridgeConfig,
    diagnostics: &Diagnostics,
) -> Result<i32, BridgeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    conn.read_signal(config.socket_limit())
        .await
        .map_err(|e| classify(config, diagnostics, e))
}

/// Wait out the grace period so the stderr drain delivers the full error
/// text, then build the fatal error.
async fn worker_error(config: &BridgeConfig, diagnostics: &Diagnostics) -> BridgeError {
    tokio::time::sleep(config.grace_period).await;
    BridgeError::WorkerError {
        task: config.task_name.clone(),
        diagnostics: diagnostics.snapshot(),
    }
}

pub(crate) async fn run_single<R, W, S, RV, C, I>(
    conn: &mut Connection<R, W>,
    sender: &mut S,
    receiver: &mut RV,
    collector: &mut C,
    records: I,
    config: &BridgeConfig,
    diagnostics: &Diagnostics,
) -> Result<(), BridgeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    S: RecordSender,
    RV: RecordReceiver,
    C: Collector<RV::Record>,
    I: Iterator<Item = S::Record>,
{
    let mut records = records.peekable();
    // An empty source never starts the exchange at all.
    if records.peek().is_none() {
        return Ok(());
    }

    loop {
        match read_signal(conn, config, diagnostics).await? {
            SIGNAL_BUFFER_REQUEST => {
                if records.peek().is_some() || sender.has_remaining(InputSlot::First) {
                    let size = sender.send_buffer(&mut records, InputSlot::First)?;
                    let has_next =
                        sender.has_remaining(InputSlot::First) || records.peek().is_some();
                    conn.notify_write(size, has_next).await?;
                } else {
                    return Err(BridgeError::ProtocolViolation {
                        task: config.task_name.clone(),
                    });
                }
            }
            SIGNAL_FINISHED => return Ok(()),
            SIGNAL_ERROR => return Err(worker_error(config, diagnostics).await),
            marker => {
                receiver.collect_buffer(collector, marker)?;
                conn.confirm_read().await?;
            }
        }
    }
}

pub(crate) async fn run_dual<R, W, S, RV, C, I0, I1>(
    conn: &mut Connection<R, W>,
    sender: &mut S,
    receiver: &mut RV,
    collector: &mut C,
    first: I0,
    second: I1,
    config: &BridgeConfig,
    diagnostics: &Diagnostics,
) -> Result<(), BridgeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    S: RecordSender,
    RV: RecordReceiver,
    C: Collector<RV::Record>,
    I0: Iterator<Item = S::Record>,
    I1: Iterator<Item = S::Record>,
{
    let mut first = first.peekable();
    let mut second = second.peekable();
    if first.peek().is_none() && second.peek().is_none() {
        return Ok(());
    }

    loop {
        match read_signal(conn, config, diagnostics).await? {
            // A request for an exhausted slot is absorbed without a
            // notification; the other slot may still have data.
            SIGNAL_BUFFER_REQUEST_G0 => {
                if first.peek().is_some() || sender.has_remaining(InputSlot::First) {
                    let size = sender.send_buffer(&mut first, InputSlot::First)?;
                    let has_next =
                        sender.has_remaining(InputSlot::First) || first.peek().is_some();
                    conn.notify_write(size, has_next).await?;
                }
            }
            SIGNAL_BUFFER_REQUEST_G1 => {
                if second.peek().is_some() || sender.has_remaining(InputSlot::Second) {
                    let size = sender.send_buffer(&mut second, InputSlot::Second)?;
                    let has_next =
                        sender.has_remaining(InputSlot::Second) || second.peek().is_some();
                    conn.notify_write(size, has_next).await?;
                }
            }
            SIGNAL_FINISHED => return Ok(()),
            SIGNAL_ERROR => return Err(worker_error(config, diagnostics).await),
            marker => {
                receiver.collect_buffer(collector, marker)?;
                conn.confirm_read().await?;
            }
        }
    }
}

pub(crate) async fn run_broadcast<R, W, S, B>(
    conn: &mut Connection<R, W>,
    sender: &mut S,
    source: &mut B,
    config: &BridgeConfig,
    diagnostics: &Diagnostics,
) -> Result<(), BridgeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    S: RecordSender,
    B: BroadcastSource<Record = S::Record>,
{
    await_request(conn, config, diagnostics).await?;
    let size = sender.send_record(&MetaRecord::Count(config.broadcast_names.len()))?;
    conn.notify_write(size, false).await?;

    for name in &config.broadcast_names {
        let mut records = source
            .variable(name)
            .ok_or_else(|| BridgeError::UnknownBroadcastVariable { name: name.clone() })?
            .peekable();

        await_request(conn, config, diagnostics).await?;
        let size = sender.send_record(&MetaRecord::Name(name))?;
        conn.notify_write(size, false).await?;

        // At least one element chunk per collection; an empty collection
        // still gets an empty terminal chunk.
        loop {
            await_request(conn, config, diagnostics).await?;
            let size = sender.send_buffer(&mut records, InputSlot::First)?;
            let has_next = records.peek().is_some() || sender.has_remaining(InputSlot::First);
            conn.notify_write(size, has_next).await?;
            if !has_next {
                break;
            }
        }
        sender.reset();
    }
    Ok(())
}

/// Broadcast-phase wait: only the error signal is inspected; any other
/// value is taken as the buffer request.
async fn await_request<R, W>(
    conn: &mut Connection<R, W>,
    config: &BridgeConfig,
    diagnostics: &Diagnostics,
) -> Result<(), BridgeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if read_signal(conn, config, diagnostics).await? == SIGNAL_ERROR {
        return Err(worker_error(config, diagnostics).await);
    }
    Ok(())
}
