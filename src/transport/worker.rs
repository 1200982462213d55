//! Per-channel worker thread
//!
//! Each live channel is moved onto its own OS thread. Async callers send
//! requests over a crossbeam channel and await the answer on a tokio oneshot:
//!
//! ```text
//!  task ──submit──► [crossbeam queue] ──► worker thread ──ioctl──► device
//!   ▲                                          │
//!   └──────────── oneshot (result, buffer) ◄───┘
//! ```
//!
//! The worker runs one command at a time. A command that outlives its timeout
//! plus a grace period, or that fails with a controller-faulting error, marks
//! the worker faulted; the owner then closes it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{Channel, DataTransfer, Transport, TransportConfig, TransportKind};
use crate::codec::{Command, CommandSet, Completion, DataBuffer, DataDirection, SubmissionEntry};
use crate::error::{Error, Result};
use crate::metrics::NvmeMetrics;

/// A completed command and the data buffer handed back to the caller.
#[derive(Debug)]
pub struct CommandOutcome {
    pub completion: Completion,
    pub data: Option<DataBuffer>,
}

enum Request {
    Submit {
        set: CommandSet,
        sqe: SubmissionEntry,
        data: Option<DataBuffer>,
        timeout: Duration,
        reply: oneshot::Sender<(Result<Completion>, Option<DataBuffer>)>,
    },
    Close {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Run one command with an owned buffer, choosing the transfer direction from
/// the opcode.
fn execute<T: Transport + ?Sized>(
    transport: &mut T,
    set: CommandSet,
    sqe: &SubmissionEntry,
    mut data: Option<DataBuffer>,
    timeout: Duration,
) -> (Result<Completion>, Option<DataBuffer>) {
    let result = match data.as_mut() {
        None => transport.submit(set, sqe, DataTransfer::None, timeout),
        Some(buf) => match sqe.data_direction() {
            DataDirection::HostToController => {
                transport.submit(set, sqe, DataTransfer::Write(buf), timeout)
            }
            DataDirection::ControllerToHost | DataDirection::Bidirectional => {
                transport.submit(set, sqe, DataTransfer::Read(buf), timeout)
            }
            DataDirection::None => Err(Error::InvalidArgument(format!(
                "opcode {:#04x} has no data phase",
                sqe.opcode
            ))),
        },
    };
    (result, data)
}

fn run(mut channel: Channel, rx: Receiver<Request>, faulted: Arc<AtomicBool>, open: Arc<AtomicBool>) {
    while let Ok(request) = rx.recv() {
        match request {
            Request::Submit {
                set,
                sqe,
                data,
                timeout,
                reply,
            } => {
                let (result, data) = execute(&mut channel, set, &sqe, data, timeout);
                if let Err(e) = &result {
                    if e.faults_controller() {
                        warn!("Channel {} faulted: {}", channel.target(), e);
                        faulted.store(true, Ordering::SeqCst);
                    }
                }
                // caller may have given up on a timed-out command
                let _ = reply.send((result, data));
            }
            Request::Close { reply } => {
                let result = channel.close();
                open.store(false, Ordering::SeqCst);
                debug!("Worker for {} closed", channel.target());
                let _ = reply.send(result);
                return;
            }
        }
    }

    // every sender dropped without an explicit close
    if let Err(e) = channel.close() {
        warn!("Closing {} on worker exit failed: {}", channel.target(), e);
    }
    open.store(false, Ordering::SeqCst);
}

/// Async front end of a channel living on a dedicated thread.
#[derive(Debug)]
pub struct ChannelWorker {
    tx: Sender<Request>,
    faulted: Arc<AtomicBool>,
    open: Arc<AtomicBool>,
    /// Still counted in the open-channel gauge
    counted: AtomicBool,
    kind: TransportKind,
    target: String,
    instance: Option<u32>,
    config: TransportConfig,
    metrics: Option<Arc<NvmeMetrics>>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Request::Submit { set, sqe, .. } => write!(f, "Submit({}, {:#04x})", set, sqe.opcode),
            Request::Close { .. } => write!(f, "Close"),
        }
    }
}

impl ChannelWorker {
    /// Move an established channel onto its own thread.
    pub fn spawn(
        channel: Channel,
        config: TransportConfig,
        metrics: Option<Arc<NvmeMetrics>>,
    ) -> Result<Self> {
        let (tx, rx) = unbounded();
        let faulted = Arc::new(AtomicBool::new(false));
        let open = Arc::new(AtomicBool::new(channel.is_open()));
        let kind = channel.kind();
        let target = channel.target();
        let instance = channel.instance();

        let thread_faulted = faulted.clone();
        let thread_open = open.clone();
        std::thread::Builder::new()
            .name(format!("nvme-worker-{}", instance.map_or(target.clone(), |i| i.to_string())))
            .spawn(move || run(channel, rx, thread_faulted, thread_open))?;

        if let Some(m) = &metrics {
            m.channel_opened();
        }

        Ok(Self {
            tx,
            faulted,
            open,
            counted: AtomicBool::new(metrics.is_some()),
            kind,
            target,
            instance,
            config,
            metrics,
        })
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn instance(&self) -> Option<u32> {
        self.instance
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Set after a timeout, transport loss or path-related failure.
    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }

    /// Submit a raw entry and wait for its completion.
    pub async fn submit(
        &self,
        set: CommandSet,
        sqe: SubmissionEntry,
        data: Option<DataBuffer>,
        timeout: Duration,
    ) -> Result<CommandOutcome> {
        let result = self.submit_inner(set, sqe, data, timeout).await;
        if let Some(m) = &self.metrics {
            m.record_command(set, &result);
        }
        result
    }

    async fn submit_inner(
        &self,
        set: CommandSet,
        sqe: SubmissionEntry,
        data: Option<DataBuffer>,
        timeout: Duration,
    ) -> Result<CommandOutcome> {
        if !self.is_open() {
            return Err(Error::TransportLost {
                reason: format!("{} is closed", self.target),
            });
        }

        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Submit {
                set,
                sqe,
                data,
                timeout,
                reply,
            })
            .map_err(|_| Error::TransportLost {
                reason: format!("worker for {} has exited", self.target),
            })?;

        match tokio::time::timeout(timeout + self.config.watchdog_grace, rx).await {
            Ok(Ok((result, data))) => result.map(|completion| CommandOutcome { completion, data }),
            Ok(Err(_)) => Err(Error::TransportLost {
                reason: format!("worker for {} dropped the request", self.target),
            }),
            Err(_) => {
                warn!(
                    "Command {:#04x} on {} exceeded {:?}",
                    sqe.opcode, self.target, timeout
                );
                self.faulted.store(true, Ordering::SeqCst);
                Err(Error::Timeout {
                    opcode: sqe.opcode,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Close the channel on its thread. Waits for any in-flight command.
    pub async fn close(&self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }

        let (reply, rx) = oneshot::channel();
        if self.tx.send(Request::Close { reply }).is_err() {
            return Ok(());
        }
        let result = rx.await.unwrap_or(Ok(()));
        self.uncount();
        result
    }

    /// Close, giving up after `limit`.
    ///
    /// A close still queued behind a hung command is left to the worker
    /// thread, which runs it once the command returns.
    pub async fn close_within(&self, limit: Duration) -> Result<()> {
        match tokio::time::timeout(limit, self.close()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Channel {} still busy after {:?}, closing in the background",
                    self.target, limit
                );
                self.uncount();
                Ok(())
            }
        }
    }

    fn uncount(&self) {
        if self.counted.swap(false, Ordering::SeqCst) {
            if let Some(m) = &self.metrics {
                m.channel_closed();
            }
        }
    }
}

impl Drop for ChannelWorker {
    fn drop(&mut self) {
        // the thread sees the disconnect and closes the channel itself
        self.uncount();
    }
}

// =============================================================================
// Command issuer seam
// =============================================================================

/// Something typed commands can be issued through.
#[async_trait]
pub trait CommandIssuer: Send + Sync {
    async fn issue(&self, command: &Command, data: Option<DataBuffer>) -> Result<CommandOutcome>;
}

#[async_trait]
impl CommandIssuer for ChannelWorker {
    async fn issue(&self, command: &Command, data: Option<DataBuffer>) -> Result<CommandOutcome> {
        let sqe = command.encode()?;
        let set = command.command_set();
        self.submit(set, sqe, data, self.config.timeout_for(set)).await
    }
}

/// Issues commands straight on a blocking transport, on the caller's thread.
#[derive(Debug)]
pub struct DirectIssuer<T: Transport> {
    transport: Mutex<T>,
    config: TransportConfig,
}

impl<T: Transport> DirectIssuer<T> {
    pub fn new(transport: T, config: TransportConfig) -> Self {
        Self {
            transport: Mutex::new(transport),
            config,
        }
    }

    pub fn into_inner(self) -> T {
        self.transport.into_inner()
    }
}

#[async_trait]
impl<T: Transport> CommandIssuer for DirectIssuer<T> {
    async fn issue(&self, command: &Command, data: Option<DataBuffer>) -> Result<CommandOutcome> {
        let sqe = command.encode()?;
        let set = command.command_set();
        let timeout = self.config.timeout_for(set);
        let (result, data) = execute(&mut *self.transport.lock(), set, &sqe, data, timeout);
        result.map(|completion| CommandOutcome { completion, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AdminOpcode, ControllerInfo, Status, StatusType};
    use crate::transport::mock::{Fault, FaultRule};
    use crate::transport::{MockConnector, MockDevice};
    use assert_matches::assert_matches;

    const NQN: &str = "nqn.2024-01.io.nvmekit:worker";

    fn spawn(connector: &MockConnector, config: TransportConfig) -> ChannelWorker {
        let mut ch = connector.open_channel(NQN, "w").unwrap();
        ch.establish().unwrap();
        ChannelWorker::spawn(Channel::Mock(ch), config, None).unwrap()
    }

    fn setup() -> (MockConnector, MockDevice) {
        let connector = MockConnector::new();
        let device = MockDevice::new(NQN, "W1").with_namespace(1, 64);
        connector.add_device("w", device.clone());
        (connector, device)
    }

    #[tokio::test]
    async fn test_issue_identify_through_worker() {
        let (connector, _device) = setup();
        let worker = spawn(&connector, TransportConfig::default());

        let out = worker
            .issue(&Command::identify_controller(), Some(DataBuffer::new(4096).unwrap()))
            .await
            .unwrap();
        let page = out.data.unwrap();
        assert_eq!(ControllerInfo::parse(&page).unwrap().subnqn, NQN);
        assert!(!worker.is_faulted());

        worker.close().await.unwrap();
        worker.close().await.unwrap();
        assert!(!worker.is_open());
        assert_eq!(connector.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_device_error_does_not_fault() {
        let (connector, device) = setup();
        let worker = spawn(&connector, TransportConfig::default());
        device.inject(FaultRule::new(
            AdminOpcode::KeepAlive as u8,
            Fault::Status(Status::new(StatusType::Generic, 0x02)),
        ));
        assert_matches!(
            worker.issue(&Command::KeepAlive, None).await,
            Err(Error::DeviceError { .. })
        );
        assert!(!worker.is_faulted());
        worker.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_watchdog_faults_worker() {
        let (connector, device) = setup();
        let config = TransportConfig {
            admin_timeout: Duration::from_millis(20),
            watchdog_grace: Duration::from_millis(10),
            ..Default::default()
        };
        let worker = spawn(&connector, config);
        device.inject(
            FaultRule::new(AdminOpcode::KeepAlive as u8, Fault::Hang(Duration::from_millis(200))).times(1),
        );

        assert_matches!(
            worker.issue(&Command::KeepAlive, None).await,
            Err(Error::Timeout { .. })
        );
        assert!(worker.is_faulted());

        // close waits behind the hung command, then releases the handle
        worker.close().await.unwrap();
        assert_eq!(connector.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_close_within_leaves_hung_channel_to_thread() {
        let (connector, device) = setup();
        let config = TransportConfig {
            admin_timeout: Duration::from_millis(20),
            watchdog_grace: Duration::from_millis(10),
            ..Default::default()
        };
        let worker = spawn(&connector, config);
        device.inject(
            FaultRule::new(AdminOpcode::KeepAlive as u8, Fault::Hang(Duration::from_millis(300))).times(1),
        );
        assert_matches!(
            worker.issue(&Command::KeepAlive, None).await,
            Err(Error::Timeout { .. })
        );

        let started = std::time::Instant::now();
        worker.close_within(Duration::from_millis(10)).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(connector.open_handles(), 1);

        drop(worker);
        for _ in 0..100 {
            if connector.open_handles() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(connector.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_drop_closes_channel() {
        let (connector, _device) = setup();
        let worker = spawn(&connector, TransportConfig::default());
        assert_eq!(connector.open_handles(), 1);
        drop(worker);
        for _ in 0..100 {
            if connector.open_handles() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(connector.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_direct_issuer() {
        let (connector, _device) = setup();
        let ch = connector.open_channel(NQN, "w").unwrap();
        let issuer = DirectIssuer::new(Channel::Mock(ch), TransportConfig::default());
        let out = issuer
            .issue(&Command::identify_namespace(1), Some(DataBuffer::new(4096).unwrap()))
            .await
            .unwrap();
        assert!(out.completion.status.is_success());
        let mut ch = issuer.into_inner();
        ch.close().unwrap();
        assert_eq!(connector.open_handles(), 0);
    }
}
