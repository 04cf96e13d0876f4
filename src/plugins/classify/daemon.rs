//! Categorisation daemon supervision
//!
//! Two long-running tasks keep the external daemon usable: the process
//! manager owns the child process and restarts it when it dies, and
//! the socket manager owns the TCP connection the wire client uses.
//! Both are driven by a small signal alphabet over bounded channels;
//! sends never block, a full channel simply drops the signal.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Signals understood by the supervisory tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DaemonSignal {
    Startup,
    Shutdown,
    Finished,
    Connect,
    SystemStartup,
    SystemShutdown,
}

/// Non-blocking signal send; a full channel drops the signal
pub(crate) fn send_signal(tx: &mpsc::Sender<DaemonSignal>, signal: DaemonSignal) {
    let _ = tx.try_send(signal);
}

/// How long one request/reply exchange may take before the connection
/// is considered dead
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay before reconnect and restart attempts
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Wire client for the categorisation daemon
///
/// Holds the shared connection the socket manager maintains. Requests
/// are one ASCII header line plus raw packet bytes; replies are CRLF
/// lines terminated by a blank line.
pub(crate) struct ClassdClient {
    stream: tokio::sync::Mutex<Option<BufStream<TcpStream>>>,
}

impl ClassdClient {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            stream: tokio::sync::Mutex::new(None),
        })
    }

    pub(crate) async fn connect(&self, host_port: &str) -> std::io::Result<()> {
        let stream = TcpStream::connect(host_port).await?;
        *self.stream.lock().await = Some(BufStream::new(stream));
        Ok(())
    }

    pub(crate) async fn disconnect(&self) {
        *self.stream.lock().await = None;
    }

    pub(crate) async fn is_connected(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// Send one classification request and collect the reply
    ///
    /// An empty string means the daemon could not be reached; the
    /// connection is dropped so the socket manager reconnects.
    pub(crate) async fn classify_packet(&self, command: &str, data: &[u8]) -> String {
        let mut guard = self.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            return String::new();
        };

        match tokio::time::timeout(EXCHANGE_TIMEOUT, exchange(stream, command, data)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => {
                warn!("classd exchange failed: {}", err);
                *guard = None;
                String::new()
            }
            Err(_) => {
                warn!("classd exchange timed out");
                *guard = None;
                String::new()
            }
        }
    }
}

async fn exchange(
    stream: &mut BufStream<TcpStream>,
    command: &str,
    data: &[u8],
) -> std::io::Result<String> {
    stream.write_all(command.as_bytes()).await?;
    stream.write_all(data).await?;
    stream.flush().await?;

    let mut reply = String::new();
    loop {
        let mut line = String::new();
        let n = stream.read_line(&mut line).await?;
        if n == 0 {
            // daemon closed the connection mid-reply
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed",
            ));
        }
        if line == "\r\n" || line == "\n" {
            break;
        }
        reply.push_str(&line);
    }
    Ok(reply)
}

/// Handle to the running supervision tasks
pub(crate) struct DaemonManager {
    pub(crate) process_tx: mpsc::Sender<DaemonSignal>,
    pub(crate) socket_tx: mpsc::Sender<DaemonSignal>,
    shutdown_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl DaemonManager {
    /// Spawn both supervisory tasks
    ///
    /// `daemon_binary` of `None` skips process supervision (the daemon
    /// is managed externally); the socket manager still maintains the
    /// connection.
    pub(crate) fn start(
        client: Arc<ClassdClient>,
        daemon_binary: Option<PathBuf>,
        host_port: String,
    ) -> Self {
        let (process_tx, process_rx) = mpsc::channel(1);
        let (socket_tx, socket_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(2);

        tokio::spawn(socket_manager(
            client,
            host_port,
            socket_rx,
            socket_tx.clone(),
            shutdown_tx.clone(),
        ));
        tokio::spawn(process_manager(
            daemon_binary,
            process_rx,
            process_tx.clone(),
            socket_tx.clone(),
            shutdown_tx,
        ));

        send_signal(&process_tx, DaemonSignal::Startup);

        Self {
            process_tx,
            socket_tx,
            shutdown_rx: tokio::sync::Mutex::new(shutdown_rx),
        }
    }

    /// Deliver `SystemShutdown` to one task and wait for its
    /// acknowledgement
    pub(crate) async fn shutdown_task(&self, tx: &mpsc::Sender<DaemonSignal>, name: &str) {
        send_signal(tx, DaemonSignal::SystemShutdown);
        let mut rx = self.shutdown_rx.lock().await;
        match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
            Ok(_) => info!("successful shutdown of {}", name),
            Err(_) => warn!("failed to properly shutdown {}", name),
        }
    }
}

/// Keeps the child process alive
async fn process_manager(
    daemon_binary: Option<PathBuf>,
    mut rx: mpsc::Receiver<DaemonSignal>,
    self_tx: mpsc::Sender<DaemonSignal>,
    socket_tx: mpsc::Sender<DaemonSignal>,
    shutdown_tx: mpsc::Sender<()>,
) {
    let mut child: Option<Child> = None;

    loop {
        let signal = tokio::select! {
            signal = rx.recv() => match signal {
                Some(signal) => signal,
                None => break,
            },
            // a running child exiting is treated as a Finished signal
            status = wait_child(&mut child) => {
                warn!("classify daemon exited: {:?}", status);
                child = None;
                DaemonSignal::Finished
            }
        };

        match signal {
            DaemonSignal::Startup | DaemonSignal::SystemStartup => {
                let Some(binary) = &daemon_binary else {
                    debug!("no classify daemon binary configured; expecting external daemon");
                    send_signal(&socket_tx, DaemonSignal::Connect);
                    continue;
                };
                match Command::new(binary).kill_on_drop(true).spawn() {
                    Ok(spawned) => {
                        info!("started classify daemon {}", binary.display());
                        child = Some(spawned);
                        send_signal(&socket_tx, DaemonSignal::Connect);
                    }
                    Err(err) => {
                        warn!("unable to start classify daemon {}: {}", binary.display(), err);
                        let tx = self_tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(RETRY_DELAY).await;
                            send_signal(&tx, DaemonSignal::Startup);
                        });
                    }
                }
            }
            DaemonSignal::Finished => {
                // restart after a short pause
                let tx = self_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(RETRY_DELAY).await;
                    send_signal(&tx, DaemonSignal::Startup);
                });
            }
            DaemonSignal::Shutdown => {
                stop_child(&mut child).await;
            }
            DaemonSignal::SystemShutdown => {
                stop_child(&mut child).await;
                let _ = shutdown_tx.try_send(());
                return;
            }
            DaemonSignal::Connect => {}
        }
    }
}

/// Wait for the supervised child to exit; pends forever when there is
/// no child so the select loop only hears from a live process
async fn wait_child(child: &mut Option<Child>) -> Option<std::process::ExitStatus> {
    match child {
        Some(child) => child.wait().await.ok(),
        None => std::future::pending().await,
    }
}

async fn stop_child(child: &mut Option<Child>) {
    if let Some(mut child) = child.take() {
        let _ = child.kill().await;
    }
}

/// Keeps the daemon socket connected
async fn socket_manager(
    client: Arc<ClassdClient>,
    host_port: String,
    mut rx: mpsc::Receiver<DaemonSignal>,
    self_tx: mpsc::Sender<DaemonSignal>,
    shutdown_tx: mpsc::Sender<()>,
) {
    while let Some(signal) = rx.recv().await {
        match signal {
            DaemonSignal::Connect | DaemonSignal::Startup | DaemonSignal::SystemStartup => {
                if client.is_connected().await {
                    continue;
                }
                match client.connect(&host_port).await {
                    Ok(()) => info!("connected to classify daemon at {}", host_port),
                    Err(err) => {
                        debug!("classify daemon connect to {} failed: {}", host_port, err);
                        let tx = self_tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(RETRY_DELAY).await;
                            send_signal(&tx, DaemonSignal::Connect);
                        });
                    }
                }
            }
            DaemonSignal::Shutdown | DaemonSignal::Finished => {
                client.disconnect().await;
            }
            DaemonSignal::SystemShutdown => {
                client.disconnect().await;
                let _ = shutdown_tx.try_send(());
                return;
            }
        }
    }
}
