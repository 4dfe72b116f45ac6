//! Node service for distributed mode
//!
//! A permuter server lends its CPUs to searching clients. The service:
//! - Listens for client connections
//! - Checks each client's priority and allow-list entry; without an
//!   allow-list every search is refused
//! - Evaluates requested seeds on a shared pool of worker threads
//! - Streams results back as they complete
//! - Records vouches in the allow-list file
//!
//! Worker threads are shared by every connected client. Each thread builds
//! evaluators for a client's targets the first time it serves that client and
//! drops them when the client disconnects.

use super::protocol::*;
use crate::eval::{build_evaluators, evaluate_work, Evaluator, EvaluatorFactory, TargetSpec};
use crate::seed::WorkItem;
use crate::worker::channel::Feedback;
use crate::Result;
use anyhow::Context;
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Default lowest priority a client may ask for
pub const DEFAULT_MIN_PRIORITY: f64 = 0.1;

/// Default listening port
pub const DEFAULT_LISTEN_PORT: u16 = 9999;

/// Service settings
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub listen_port: u16,
    /// Worker threads shared by all clients
    pub threads: usize,
    /// Clients asking for less are refused
    pub min_priority: f64,
    /// Client ids served; without one, no client is served
    pub allow_list: Option<PathBuf>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            threads: num_cpus::get(),
            min_priority: DEFAULT_MIN_PRIORITY,
            allow_list: None,
        }
    }
}

/// Evaluation slots granted to a client at `priority`
///
/// A client at priority 1.0 may keep one evaluation per server thread in
/// flight.
pub fn granted_slots(threads: usize, priority: f64) -> usize {
    let threads = threads.max(1);
    let slots = (threads as f64 * priority).round();
    (slots as usize).clamp(1, threads * 2)
}

/// Client ids in an allow-list file, one per line; `#` starts a comment
pub fn load_allow_list(path: &Path) -> Result<HashSet<String>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read allow-list {}", path.display())),
    };
    Ok(content
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Add `client_id` to an allow-list file
pub fn append_allow_list(path: &Path, client_id: &str) -> Result<()> {
    if load_allow_list(path)?.contains(client_id) {
        return Ok(());
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open allow-list {}", path.display()))?;
    writeln!(file, "{}", client_id).with_context(|| format!("Failed to write allow-list {}", path.display()))?;
    Ok(())
}

/// One client's targets, shared with the worker threads
struct Session {
    id: u64,
    specs: Vec<TargetSpec>,
    closed: AtomicBool,
}

/// One evaluation request
struct Job {
    session: Arc<Session>,
    request_id: u64,
    item: WorkItem,
    reply: mpsc::UnboundedSender<ResultMessage>,
}

/// Permuter server
pub struct NodeService {
    settings: ServiceSettings,
    factory: Arc<dyn EvaluatorFactory>,
    server_id: String,
    next_session: AtomicU64,
}

impl NodeService {
    pub fn new(settings: ServiceSettings, factory: Arc<dyn EvaluatorFactory>) -> Self {
        Self {
            settings,
            factory,
            server_id: local_id(),
            next_session: AtomicU64::new(0),
        }
    }

    /// Listen on the configured port until the process exits
    pub async fn run(self) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.settings.listen_port);
        let listener = TcpListener::bind(&addr).await.context("Failed to bind node service")?;

        println!("Permuter server listening on port {}", self.settings.listen_port);
        println!("Server ID: {}", self.server_id);
        println!("Worker threads: {}", self.settings.threads);
        match &self.settings.allow_list {
            Some(path) => println!("Allow-list: {}", path.display()),
            None => println!("No allow-list configured: all clients will be refused"),
        }

        self.serve(listener).await
    }

    /// Accept clients on `listener`
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let jobs = self.spawn_workers()?;
        let service = Arc::new(self);

        loop {
            let (stream, addr) = listener.accept().await.context("Failed to accept connection")?;
            stream.set_nodelay(true).ok();
            debug!(%addr, "client connected");

            let service = Arc::clone(&service);
            let jobs = jobs.clone();
            tokio::spawn(async move {
                if let Err(e) = service.handle_client(stream, jobs).await {
                    warn!(%addr, "client session failed: {:#}", e);
                }
            });
        }
    }

    fn spawn_workers(&self) -> Result<Sender<Job>> {
        let (jobs_tx, jobs_rx) = unbounded::<Job>();
        for id in 0..self.settings.threads.max(1) {
            let jobs = jobs_rx.clone();
            let factory = Arc::clone(&self.factory);
            std::thread::Builder::new()
                .name(format!("permuter-server-{}", id))
                .spawn(move || serve_jobs(id, factory, jobs))
                .with_context(|| format!("Failed to spawn server worker {}", id))?;
        }
        Ok(jobs_tx)
    }

    /// Check a client against the allow-list; nobody is allowed without one
    fn is_allowed(&self, client_id: &str) -> Result<bool> {
        match &self.settings.allow_list {
            Some(path) => Ok(load_allow_list(path)?.contains(client_id)),
            None => Ok(false),
        }
    }

    async fn handle_client(&self, mut stream: TcpStream, jobs: Sender<Job>) -> Result<()> {
        match read_message(&mut stream).await? {
            Message::Config(config) => self.handle_search(stream, config, jobs).await,
            Message::Vouch(vouch) => self.handle_vouch(stream, vouch).await,
            other => {
                refuse(&mut stream, format!("Expected CONFIG or VOUCH, got {:?}", other)).await?;
                anyhow::bail!("unexpected first message")
            }
        }
    }

    async fn handle_vouch(&self, mut stream: TcpStream, vouch: VouchMessage) -> Result<()> {
        let Some(path) = &self.settings.allow_list else {
            return refuse(&mut stream, "this server has no allow-list".to_string()).await;
        };
        if !self.is_allowed(&vouch.client_id)? {
            return refuse(&mut stream, format!("{} may not vouch", vouch.client_id)).await;
        }

        append_allow_list(path, &vouch.grantee)?;
        println!("{} vouched for {}", vouch.client_id, vouch.grantee);
        write_message(&mut stream, &Message::VouchAck).await
    }

    async fn handle_search(&self, mut stream: TcpStream, config: ConfigMessage, jobs: Sender<Job>) -> Result<()> {
        if config.protocol_version != PROTOCOL_VERSION {
            return refuse(
                &mut stream,
                format!(
                    "Protocol version mismatch: server has {}, client has {}",
                    PROTOCOL_VERSION, config.protocol_version
                ),
            )
            .await;
        }
        if config.priority < self.settings.min_priority {
            return refuse(
                &mut stream,
                format!(
                    "Priority {} is below this server's minimum of {}",
                    config.priority, self.settings.min_priority
                ),
            )
            .await;
        }
        if self.settings.allow_list.is_none() {
            return refuse(&mut stream, "this server has no allow-list".to_string()).await;
        }
        if !self.is_allowed(&config.client_id)? {
            return refuse(&mut stream, format!("{} is not on the allow-list", config.client_id)).await;
        }

        let slots = granted_slots(self.settings.threads, config.priority);
        let session = Arc::new(Session {
            id: self.next_session.fetch_add(1, Ordering::SeqCst),
            // Whatever the client sent, its commands are never run here
            specs: config.targets.iter().map(TargetSpec::without_commands).collect(),
            closed: AtomicBool::new(false),
        });
        let ready = Message::Ready(ReadyMessage {
            protocol_version: PROTOCOL_VERSION,
            server_id: self.server_id.clone(),
            num_workers: slots,
        });
        write_message(&mut stream, &ready).await?;
        println!(
            "[{}] client {} connected: {} target(s), {} slot(s)",
            session.id,
            config.client_id,
            session.specs.len(),
            slots
        );

        let outcome = serve_session(stream, Arc::clone(&session), jobs).await;
        session.closed.store(true, Ordering::SeqCst);
        println!("[{}] client {} disconnected", session.id, config.client_id);
        outcome
    }
}

async fn refuse(stream: &mut TcpStream, error: String) -> Result<()> {
    info!("refusing client: {}", error);
    write_message(stream, &Message::Error(ErrorMessage { error })).await
}

/// Relay requests and results until the client stops or goes away
async fn serve_session(stream: TcpStream, session: Arc<Session>, jobs: Sender<Job>) -> Result<()> {
    let (mut read_half, mut write_half) = stream.into_split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ResultMessage>();

    let (msg_tx, mut msg_rx) = mpsc::channel::<Result<Message>>(64);
    let reader = tokio::spawn(async move {
        loop {
            let msg = read_message(&mut read_half).await;
            let failed = msg.is_err();
            if msg_tx.send(msg).await.is_err() || failed {
                return;
            }
        }
    });

    let mut pending = 0usize;
    let mut stopping = false;
    let result = loop {
        if stopping && pending == 0 {
            break Ok(());
        }

        tokio::select! {
            msg = msg_rx.recv(), if !stopping => match msg {
                Some(Ok(Message::Evaluate(eval))) => {
                    let job = Job {
                        session: Arc::clone(&session),
                        request_id: eval.request_id,
                        item: WorkItem { target: eval.target, seed: eval.seed },
                        reply: reply_tx.clone(),
                    };
                    if jobs.send(job).is_err() {
                        break Err(anyhow::anyhow!("server workers stopped"));
                    }
                    pending += 1;
                }
                Some(Ok(Message::Stop)) => stopping = true,
                Some(Ok(other)) => warn!(session = session.id, "unexpected message: {:?}", other),
                Some(Err(e)) => {
                    debug!(session = session.id, "client read failed: {:#}", e);
                    break Ok(());
                }
                None => break Ok(()),
            },
            reply = reply_rx.recv() => {
                let Some(reply) = reply else {
                    break Ok(());
                };
                pending = pending.saturating_sub(1);
                if let Err(e) = write_message(&mut write_half, &Message::Result(reply)).await {
                    break Err(e);
                }
            }
        }
    };

    reader.abort();
    result
}

/// Worker thread body: evaluate jobs, caching evaluators per session
fn serve_jobs(id: usize, factory: Arc<dyn EvaluatorFactory>, jobs: Receiver<Job>) {
    let mut cache: HashMap<u64, (Arc<Session>, Vec<Box<dyn Evaluator>>)> = HashMap::new();

    for job in jobs.iter() {
        cache.retain(|_, (session, _)| !session.closed.load(Ordering::SeqCst));
        if job.session.closed.load(Ordering::SeqCst) {
            continue;
        }

        let feedback = match cache.entry(job.session.id) {
            std::collections::hash_map::Entry::Occupied(mut entry) => evaluate_work(&mut entry.get_mut().1, job.item),
            std::collections::hash_map::Entry::Vacant(entry) => {
                match build_evaluators(factory.as_ref(), &job.session.specs, id as u64) {
                    Ok(evaluators) => {
                        let (_, evaluators) = entry.insert((Arc::clone(&job.session), evaluators));
                        evaluate_work(evaluators, job.item)
                    }
                    Err(e) => Feedback::EvalError {
                        target: Some(job.item.target),
                        seed: Some(job.item.seed),
                        message: format!("server failed to build evaluators: {:#}", e),
                    },
                }
            }
        };

        let _ = job.reply.send(ResultMessage {
            request_id: job.request_id,
            feedback,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::coordinator::watchdog::Heartbeat;
    use crate::coordinator::Coordinator;
    use crate::eval::mock::{create_target_fixture, MockFactory, MockTarget};
    use crate::seed::{Seed, SeedSpace};
    use crate::worker::channel::CancelToken;
    use std::net::SocketAddr;

    fn two_target_factory() -> MockFactory {
        MockFactory::new()
            .with_target(
                "func_a",
                MockTarget::new(100, SeedSpace::Enumerated(vec![1, 2]))
                    .score(1, 90, "a1")
                    .score(2, 80, "a2"),
            )
            .with_target("func_b", MockTarget::new(50, SeedSpace::Enumerated(vec![7])).score(7, 50, "b7"))
    }

    /// Settings allowing this host, with the allow-list kept in `dir`
    fn trusting_self(dir: &Path, threads: usize) -> ServiceSettings {
        let path = dir.join("allow.txt");
        fs::write(&path, format!("{}\n", local_id())).unwrap();
        ServiceSettings {
            threads,
            allow_list: Some(path),
            ..ServiceSettings::default()
        }
    }

    fn remote_config(dirs: Vec<PathBuf>, addr: SocketAddr) -> Config {
        let mut config = Config::default();
        config.directories = dirs;
        config.workers.threads = Some(0);
        config.network.enabled = true;
        config.network.servers = vec![addr.to_string()];
        config
    }

    fn assert_no_workers(err: anyhow::Error) {
        assert!(matches!(
            err.downcast_ref::<crate::error::RunError>(),
            Some(crate::error::RunError::NoWorkers)
        ));
    }

    /// Start a service on an ephemeral port in a background runtime
    fn start_service(settings: ServiceSettings, factory: Arc<MockFactory>) -> (SocketAddr, tokio::runtime::Runtime) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let listener = runtime.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
        let addr = listener.local_addr().unwrap();
        let service = NodeService::new(settings, factory);
        runtime.spawn(service.serve(listener));
        (addr, runtime)
    }

    #[test]
    fn test_granted_slots() {
        assert_eq!(granted_slots(8, 1.0), 8);
        assert_eq!(granted_slots(8, 0.5), 4);
        assert_eq!(granted_slots(8, 0.01), 1);
        assert_eq!(granted_slots(8, 2.0), 16);
        assert_eq!(granted_slots(0, 1.0), 1);
    }

    #[test]
    fn test_allow_list_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("allow.txt");
        assert!(load_allow_list(&path).unwrap().is_empty());

        fs::write(&path, "# trusted\nalice\n\n").unwrap();
        append_allow_list(&path, "bob").unwrap();
        append_allow_list(&path, "bob").unwrap();

        let allowed = load_allow_list(&path).unwrap();
        assert_eq!(allowed.len(), 2);
        assert!(allowed.contains("alice"));
        assert!(allowed.contains("bob"));
    }

    #[test]
    fn test_remote_search_end_to_end() {
        let tmp = tempfile::tempdir().unwrap();
        let a = create_target_fixture(tmp.path(), "func_a").unwrap();
        let b = create_target_fixture(tmp.path(), "func_b").unwrap();

        let server_factory = Arc::new(two_target_factory());
        let (addr, _server) = start_service(trusting_self(tmp.path(), 2), Arc::clone(&server_factory));

        let coordinator = Coordinator::new(
            Arc::new(remote_config(vec![a, b], addr)),
            Arc::new(two_target_factory()),
            Heartbeat::new(),
            CancelToken::new(),
        );
        let summary = coordinator.run().unwrap();

        assert_eq!(summary.best_scores(), vec![80, 50]);
        assert_eq!(summary.iterations, 3);
        assert_eq!(summary.errors, 0);
        assert_eq!(server_factory.evaluations().len(), 3);
    }

    #[test]
    fn test_low_priority_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let a = create_target_fixture(tmp.path(), "func_a").unwrap();

        let settings = ServiceSettings {
            min_priority: 0.5,
            ..trusting_self(tmp.path(), 1)
        };
        let (addr, _server) = start_service(settings, Arc::new(two_target_factory()));

        let mut config = remote_config(vec![a], addr);
        config.network.priority = 0.2;

        let coordinator = Coordinator::new(
            Arc::new(config),
            Arc::new(two_target_factory()),
            Heartbeat::new(),
            CancelToken::new(),
        );
        assert_no_workers(coordinator.run().unwrap_err());
    }

    #[test]
    fn test_no_allow_list_refuses_everyone() {
        let tmp = tempfile::tempdir().unwrap();
        let a = create_target_fixture(tmp.path(), "func_a").unwrap();

        let settings = ServiceSettings { threads: 1, ..ServiceSettings::default() };
        let server_factory = Arc::new(two_target_factory());
        let (addr, _server) = start_service(settings, Arc::clone(&server_factory));

        let coordinator = Coordinator::new(
            Arc::new(remote_config(vec![a], addr)),
            Arc::new(two_target_factory()),
            Heartbeat::new(),
            CancelToken::new(),
        );
        assert_no_workers(coordinator.run().unwrap_err());
        assert_eq!(server_factory.builds(), 0);
    }

    #[test]
    fn test_client_commands_never_reach_evaluators() {
        let tmp = tempfile::tempdir().unwrap();
        let server_factory = Arc::new(two_target_factory());
        let (addr, server) = start_service(trusting_self(tmp.path(), 1), Arc::clone(&server_factory));

        let mut spec = two_target_factory().spec_for("func_a");
        spec.compile_script = "#!/bin/sh\ntouch /tmp/owned\n".to_string();
        spec.settings.mutator = Some("sh -c reboot".to_string());

        let reply = server.block_on(async {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let config = Message::Config(ConfigMessage {
                protocol_version: PROTOCOL_VERSION,
                client_id: local_id(),
                priority: 1.0,
                targets: vec![spec],
            });
            write_message(&mut stream, &config).await.unwrap();
            assert!(matches!(read_message(&mut stream).await.unwrap(), Message::Ready(_)));

            let eval = Message::Evaluate(EvaluateMessage {
                request_id: 3,
                target: 0,
                seed: Seed::from_value(1),
            });
            write_message(&mut stream, &eval).await.unwrap();
            let reply = read_message(&mut stream).await.unwrap();
            write_message(&mut stream, &Message::Stop).await.unwrap();
            reply
        });

        match reply {
            Message::Result(result) => {
                assert_eq!(result.request_id, 3);
                assert!(matches!(result.feedback, Feedback::Scored { target: 0, .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
        let built = server_factory.built_specs();
        assert_eq!(built.len(), 1);
        assert!(built[0].compile_script.is_empty());
        assert_eq!(built[0].settings.mutator, None);
    }

    #[test]
    fn test_vouch_extends_allow_list() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = trusting_self(tmp.path(), 1);
        let path = settings.allow_list.clone().unwrap();
        let (addr, _server) = start_service(settings, Arc::new(MockFactory::new()));

        crate::distributed::client::vouch(&addr.to_string(), "carol").unwrap();
        assert!(load_allow_list(&path).unwrap().contains("carol"));
    }
}
