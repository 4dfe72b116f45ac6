//! Remote executors
//!
//! Every connected server becomes one executor on the shared task queue. Its
//! driver runs on a private tokio runtime and is split in three:
//!
//! - a **pump** on a blocking thread pulls tasks through the usual
//!   [`TaskPuller`] protocol, but only while the server has a free slot
//! - a **reader** task turns the socket into a stream of messages
//! - the **driver** forwards pulled work as `Evaluate` requests and server
//!   results as feedback
//!
//! On `Finished` the driver waits for its in-flight requests, sends `Stop`
//! and acknowledges. If the connection drops, every request still in flight
//! is reported as an evaluation error and the executor acknowledges
//! `Finished` once its pump has stopped, so shutdown accounting never waits
//! on a dead server.

use super::protocol::*;
use crate::config::NetworkConfig;
use crate::eval::TargetSpec;
use crate::seed::WorkItem;
use crate::worker::channel::{CancelToken, ExecutorEnd, Feedback, FeedbackSink, Pulled, TaskPuller};
use crate::Result;
use anyhow::Context;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long to wait for a server to accept and answer the handshake
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A server that accepted our targets
struct Peer {
    address: String,
    stream: TcpStream,
    num_workers: usize,
}

/// Connected servers, each driven as one executor
pub struct RemotePool {
    runtime: Runtime,
    peers: Vec<Peer>,
    drivers: Vec<JoinHandle<()>>,
    executors: usize,
    slots: usize,
}

impl RemotePool {
    /// Connect to every configured server
    ///
    /// Servers that cannot be reached or refuse the session are skipped with
    /// a warning; an empty pool is not an error here.
    pub fn connect(network: &NetworkConfig, specs: &[TargetSpec]) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("permuter-net")
            .build()
            .context("Failed to create tokio runtime")?;

        let mut peers = Vec::new();
        for address in &network.servers {
            match runtime.block_on(handshake(address, network.priority, specs)) {
                Ok(peer) => {
                    println!("Connected to {} ({} workers)", peer.address, peer.num_workers);
                    peers.push(peer);
                }
                Err(e) => {
                    warn!(server = %address, "connection failed: {:#}", e);
                    println!("Failed to connect to {}: {:#}", address, e);
                }
            }
        }

        let slots = peers.iter().map(|p| p.num_workers).sum();
        Ok(Self {
            runtime,
            executors: peers.len(),
            slots,
            peers,
            drivers: Vec::new(),
        })
    }

    /// Number of connected servers
    pub fn len(&self) -> usize {
        self.executors
    }

    pub fn is_empty(&self) -> bool {
        self.executors == 0
    }

    /// Evaluation slots across all servers
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Start one driver per server on `end`
    pub fn start(&mut self, end: &ExecutorEnd, cancel: &CancelToken) {
        for peer in self.peers.drain(..) {
            let driver = drive_peer(peer, end.clone(), cancel.clone());
            self.drivers.push(self.runtime.spawn(driver));
        }
    }

    /// Wait for every driver to finish
    pub fn join(self) {
        for driver in self.drivers {
            if let Err(e) = self.runtime.block_on(driver) {
                warn!("remote driver failed: {}", e);
            }
        }
    }

    /// Stop without waiting for drivers
    pub fn abandon(self) {
        self.runtime.shutdown_background();
    }
}

async fn handshake(address: &str, priority: f64, specs: &[TargetSpec]) -> Result<Peer> {
    let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
        .await
        .context("Timed out connecting")?
        .context("Failed to connect")?;
    stream.set_nodelay(true).ok();

    let config = Message::Config(ConfigMessage {
        protocol_version: PROTOCOL_VERSION,
        client_id: local_id(),
        priority,
        targets: specs.iter().map(TargetSpec::without_commands).collect(),
    });
    write_message(&mut stream, &config).await?;

    let reply = tokio::time::timeout(CONNECT_TIMEOUT, read_message(&mut stream))
        .await
        .context("Timed out waiting for READY")??;
    match reply {
        Message::Ready(ready) if ready.protocol_version == PROTOCOL_VERSION => Ok(Peer {
            address: address.to_string(),
            stream,
            num_workers: ready.num_workers.max(1),
        }),
        Message::Ready(ready) => anyhow::bail!(
            "Protocol version mismatch: server has {}, we have {}",
            ready.protocol_version,
            PROTOCOL_VERSION
        ),
        Message::Error(err) => anyhow::bail!("Server refused: {}", err.error),
        other => anyhow::bail!("Expected READY, got {:?}", other),
    }
}

/// Ask `address` to allow `grantee` from now on
pub fn vouch(address: &str, grantee: &str) -> Result<()> {
    let runtime = Runtime::new().context("Failed to create tokio runtime")?;
    runtime.block_on(async {
        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
            .await
            .context("Timed out connecting")?
            .with_context(|| format!("Failed to connect to {}", address))?;

        let msg = Message::Vouch(VouchMessage {
            client_id: local_id(),
            grantee: grantee.to_string(),
        });
        write_message(&mut stream, &msg).await?;

        match read_message(&mut stream).await? {
            Message::VouchAck => Ok(()),
            Message::Error(err) => anyhow::bail!("Server refused: {}", err.error),
            other => anyhow::bail!("Expected VOUCH_ACK, got {:?}", other),
        }
    })
}

/// Pull tasks while the driver hands out credits
///
/// Runs on a blocking thread: the task queue is a crossbeam channel.
fn pump_tasks(
    mut puller: TaskPuller,
    credits: crossbeam::channel::Receiver<()>,
    pulls: mpsc::Sender<Pulled>,
    cancel: CancelToken,
) {
    loop {
        crossbeam::channel::select! {
            recv(credits) -> credit => {
                if credit.is_err() {
                    return;
                }
            }
            recv(cancel.signal()) -> _ => {
                let _ = pulls.blocking_send(Pulled::Cancelled);
                return;
            }
        }

        let pulled = puller.pull();
        let last = !matches!(pulled, Pulled::Work(_));
        if pulls.blocking_send(pulled).is_err() || last {
            return;
        }
    }
}

async fn read_loop(mut reader: OwnedReadHalf, messages: mpsc::Sender<Result<Message>>) {
    loop {
        let msg = read_message(&mut reader).await;
        let failed = msg.is_err();
        if messages.send(msg).await.is_err() || failed {
            return;
        }
    }
}

/// How a session with a server ended
#[derive(Debug)]
enum Ended {
    /// `Finished` was pulled and every request answered
    Finished,
    Cancelled,
    /// Connection unusable
    Lost(String),
}

struct Session {
    address: String,
    sink: FeedbackSink,
    credits: Option<crossbeam::channel::Sender<()>>,
    in_flight: BTreeMap<u64, WorkItem>,
    next_id: u64,
    finishing: bool,
}

impl Session {
    /// Forward feedback to the coordinator; false once it stopped listening
    fn report(&self, feedback: Feedback) -> bool {
        tokio::task::block_in_place(|| self.sink.push(feedback))
    }

    fn return_credit(&self) {
        if let Some(credits) = &self.credits {
            let _ = credits.try_send(());
        }
    }

    async fn run(
        &mut self,
        pulls: &mut mpsc::Receiver<Pulled>,
        messages: &mut mpsc::Receiver<Result<Message>>,
        writer: &mut OwnedWriteHalf,
    ) -> Ended {
        loop {
            if self.finishing && self.in_flight.is_empty() {
                return Ended::Finished;
            }

            tokio::select! {
                pulled = pulls.recv(), if !self.finishing => match pulled {
                    Some(Pulled::Work(item)) => {
                        let request_id = self.next_id;
                        self.next_id += 1;
                        self.in_flight.insert(request_id, item);
                        let msg = Message::Evaluate(EvaluateMessage {
                            request_id,
                            target: item.target,
                            seed: item.seed,
                        });
                        if let Err(e) = write_message(writer, &msg).await {
                            return Ended::Lost(format!("{:#}", e));
                        }
                    }
                    Some(Pulled::Finished) => self.finishing = true,
                    Some(Pulled::Cancelled) | None => return Ended::Cancelled,
                },
                msg = messages.recv() => match msg {
                    Some(Ok(Message::Result(result))) => {
                        if self.in_flight.remove(&result.request_id).is_none() {
                            warn!(server = %self.address, request_id = result.request_id, "result for unknown request");
                        } else {
                            let feedback = match result.feedback {
                                fb @ (Feedback::Scored { .. } | Feedback::EvalError { .. }) => fb,
                                other => Feedback::EvalError {
                                    target: None,
                                    seed: None,
                                    message: format!("{} sent {:?} as a result", self.address, other),
                                },
                            };
                            if !self.report(feedback) {
                                return Ended::Cancelled;
                            }
                            self.return_credit();
                        }
                    }
                    Some(Ok(Message::Error(err))) => return Ended::Lost(err.error),
                    Some(Ok(other)) => warn!(server = %self.address, "unexpected message: {:?}", other),
                    Some(Err(e)) => return Ended::Lost(format!("{:#}", e)),
                    None => return Ended::Lost("connection closed".to_string()),
                },
            }
        }
    }

    /// Report everything in flight, then wind down with the pump
    async fn fail_over(&mut self, reason: &str, pulls: &mut mpsc::Receiver<Pulled>) {
        println!("\nLost connection to {}: {}", self.address, reason);
        let message = format!("connection to {} lost: {}", self.address, reason);

        for (_, item) in std::mem::take(&mut self.in_flight) {
            if !self.report(lost_item(item, &message)) {
                return;
            }
        }

        // No credits: the pump stops after whatever it is pulling now
        self.credits = None;
        loop {
            match pulls.recv().await {
                Some(Pulled::Work(item)) => {
                    if !self.report(lost_item(item, &message)) {
                        return;
                    }
                }
                Some(Pulled::Finished) | None => {
                    self.report(Feedback::Finished);
                    return;
                }
                Some(Pulled::Cancelled) => return,
            }
        }
    }
}

fn lost_item(item: WorkItem, message: &str) -> Feedback {
    Feedback::EvalError {
        target: Some(item.target),
        seed: Some(item.seed),
        message: message.to_string(),
    }
}

async fn drive_peer(peer: Peer, end: ExecutorEnd, cancel: CancelToken) {
    let Peer { address, stream, num_workers } = peer;
    let (read_half, mut write_half) = stream.into_split();

    let (credit_tx, credit_rx) = crossbeam::channel::bounded(num_workers);
    for _ in 0..num_workers {
        let _ = credit_tx.try_send(());
    }
    let (pull_tx, mut pull_rx) = mpsc::channel(num_workers);
    let puller = end.puller(cancel.clone());
    let pump_cancel = cancel.clone();
    let pump = tokio::task::spawn_blocking(move || pump_tasks(puller, credit_rx, pull_tx, pump_cancel));

    let (msg_tx, mut msg_rx) = mpsc::channel(num_workers * 2);
    let reader = tokio::spawn(read_loop(read_half, msg_tx));

    let mut session = Session {
        address,
        sink: end.sink(cancel),
        credits: Some(credit_tx),
        in_flight: BTreeMap::new(),
        next_id: 0,
        finishing: false,
    };
    drop(end);

    let ended = session.run(&mut pull_rx, &mut msg_rx, &mut write_half).await;
    debug!(server = %session.address, ?ended, "session ended");
    match ended {
        Ended::Finished => {
            if let Err(e) = write_message(&mut write_half, &Message::Stop).await {
                debug!(server = %session.address, "failed to send STOP: {:#}", e);
            }
            session.report(Feedback::Finished);
            info!(server = %session.address, requests = session.next_id, "server finished");
        }
        Ended::Cancelled => {}
        Ended::Lost(reason) => session.fail_over(&reason, &mut pull_rx).await,
    }

    reader.abort();
    drop(pull_rx);
    drop(session);
    let _ = pump.await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_servers_are_skipped() {
        // Bind then drop to find a port nobody listens on
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let network = NetworkConfig {
            enabled: true,
            priority: 1.0,
            servers: vec![format!("127.0.0.1:{}", port)],
        };

        let pool = RemotePool::connect(&network, &[]).unwrap();
        assert!(pool.is_empty());
        assert_eq!(pool.slots(), 0);
        pool.abandon();
    }

    #[test]
    fn test_lost_item_keeps_reproduction_seed() {
        let item = WorkItem { target: 2, seed: crate::seed::Seed::new(3, 4) };
        match lost_item(item, "gone") {
            Feedback::EvalError { target, seed, message } => {
                assert_eq!(target, Some(2));
                assert_eq!(seed, Some(item.seed));
                assert_eq!(message, "gone");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
