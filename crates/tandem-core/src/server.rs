//! Request serving
//!
//! A [`Server`] accepts TCP connections and gives each one a lightweight
//! reader thread that assembles complete request messages. Executing a
//! request and writing its response happens on a bounded pool of worker
//! threads, so the number of requests in flight never exceeds the pool size
//! no matter how many (mostly idle) pooled connections clients keep open.

use crate::buffer::{BlockLogBuffer, BlockReader, LogBuffer, LogReader};
use crate::protocol::read_request_header;
use crate::{Error, Result};
use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// Serves one protocol (master or backup)
pub trait RequestHandler: Send + Sync + 'static {
    /// Short name used in logs and thread names
    fn name(&self) -> &str;

    /// Protocol version this handler speaks
    fn protocol_version(&self) -> u8;

    /// Largest logical request accepted
    fn max_request_bytes(&self) -> usize;

    /// Execute one request and write its response items
    ///
    /// `request` is positioned after the header. Returning an error before
    /// anything was written makes the caller answer with an error status.
    fn handle(
        &self,
        request_type: u8,
        request: &mut LogReader<&mut dyn Read>,
        out: &mut dyn LogBuffer,
    ) -> Result<()>;
}

/// Read one de-framed request message
///
/// Returns `None` when the peer closed the connection between messages.
pub fn read_request<R: Read>(source: R, max_request_bytes: usize) -> Result<Option<Vec<u8>>> {
    let mut reader = BlockReader::with_limit(source, max_request_bytes);
    if !reader.begin()? {
        return Ok(None);
    }
    let mut payload = Vec::new();
    reader
        .read_to_end(&mut payload)
        .map_err(crate::buffer::block::unwrap_io)?;
    Ok(Some(payload))
}

/// Execute one de-framed request and write the framed response to `output`
///
/// Returns whether the connection may serve further requests.
pub fn serve_one<H, W>(handler: &H, request: &[u8], output: W) -> Result<bool>
where
    H: RequestHandler + ?Sized,
    W: Write,
{
    let mut input: &[u8] = request;
    let mut out = BlockLogBuffer::new(output);

    let header = {
        let mut reader = LogReader::new(&mut input as &mut dyn Read);
        read_request_header(&mut reader)
    };
    let (version, request_type) = match header {
        Ok(header) => header,
        Err(e) => {
            crate::protocol::write_error(&mut out, &e)?;
            out.done()?;
            return Ok(false);
        }
    };

    if version != handler.protocol_version() {
        tracing::warn!(
            "{}: protocol version mismatch (expected {}, got {})",
            handler.name(),
            handler.protocol_version(),
            version
        );
        let error = Error::ProtocolVersionMismatch {
            expected: handler.protocol_version(),
            got: version,
        };
        crate::protocol::write_error(&mut out, &error)?;
        out.done()?;
        return Ok(false);
    }

    let result = {
        let mut reader = LogReader::new(&mut input as &mut dyn Read);
        handler.handle(request_type, &mut reader, &mut out)
    };
    if let Err(e) = result {
        match e.outcome() {
            crate::error::Outcome::ManualRecovery => {
                tracing::error!("{}: request {} failed: {}", handler.name(), request_type, e)
            }
            _ => tracing::debug!("{}: request {} failed: {}", handler.name(), request_type, e),
        }
        crate::protocol::write_error(&mut out, &e)?;
    }
    out.done()?;
    Ok(true)
}

/// Server tuning
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Worker pool size; bounds requests in flight
    pub workers: usize,
    /// Idle time after which a connection is closed
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: 20,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

struct Job {
    request: Vec<u8>,
    output: TcpStream,
    peer: SocketAddr,
    done: Sender<bool>,
}

/// TCP server for one [`RequestHandler`]
pub struct Server {
    name: String,
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    connections: Arc<Mutex<HashMap<u64, TcpStream>>>,
    connection_threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
    acceptor: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl Server {
    /// Bind `addr` and start serving `handler`
    pub fn start<H: RequestHandler>(
        handler: Arc<H>,
        addr: SocketAddr,
        config: ServerConfig,
    ) -> Result<Self> {
        if config.workers == 0 {
            return Err(Error::config("server needs at least one worker"));
        }
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let name = handler.name().to_string();

        let (job_tx, job_rx) = bounded::<Job>(config.workers);
        let mut workers = Vec::with_capacity(config.workers);
        for i in 0..config.workers {
            let handler = handler.clone();
            let job_rx = job_rx.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("{}-worker-{}", name, i))
                    .spawn(move || worker_loop(handler, job_rx))?,
            );
        }

        let running = Arc::new(AtomicBool::new(true));
        let connections = Arc::new(Mutex::new(HashMap::new()));
        let connection_threads = Arc::new(Mutex::new(Vec::new()));

        let acceptor = {
            let running = running.clone();
            let connections = connections.clone();
            let connection_threads = connection_threads.clone();
            let max_request = handler.max_request_bytes();
            let name = name.clone();
            std::thread::Builder::new()
                .name(format!("{}-acceptor", name))
                .spawn(move || {
                    accept_loop(
                        listener,
                        &name,
                        running,
                        connections,
                        connection_threads,
                        job_tx,
                        max_request,
                        config.idle_timeout,
                    )
                })?
        };

        tracing::info!(
            "{} listening on {} with {} workers",
            name,
            local_addr,
            workers.len()
        );

        Ok(Self {
            name,
            local_addr,
            running,
            connections,
            connection_threads,
            acceptor: Some(acceptor),
            workers,
        })
    }

    /// Address actually bound
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of open client connections
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Stop accepting, close every connection and join all threads
    pub fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
        for stream in self.connections.lock().values() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        let threads: Vec<_> = self.connection_threads.lock().drain(..).collect();
        for thread in threads {
            let _ = thread.join();
        }
        // Every job sender is gone now, so the workers drain and exit.
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        tracing::info!("{} on {} shut down", self.name, self.local_addr);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<H: RequestHandler>(handler: Arc<H>, jobs: Receiver<Job>) {
    for job in jobs {
        let mut output = BufWriter::new(&job.output);
        let keep_open = match serve_one(handler.as_ref(), &job.request, &mut output) {
            Ok(keep_open) => keep_open,
            Err(e) => {
                tracing::warn!("{}: failed to answer {}: {}", handler.name(), job.peer, e);
                false
            }
        };
        drop(output);
        let _ = job.done.send(keep_open);
    }
}

fn accept_loop(
    listener: TcpListener,
    name: &str,
    running: Arc<AtomicBool>,
    connections: Arc<Mutex<HashMap<u64, TcpStream>>>,
    connection_threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
    jobs: Sender<Job>,
    max_request: usize,
    idle_timeout: Duration,
) {
    let next_id = AtomicU64::new(0);
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let id = next_id.fetch_add(1, Ordering::SeqCst);
                match spawn_connection(
                    name,
                    id,
                    stream,
                    peer,
                    connections.clone(),
                    jobs.clone(),
                    max_request,
                    idle_timeout,
                ) {
                    Ok(handle) => {
                        let mut threads = connection_threads.lock();
                        threads.retain(|t| !t.is_finished());
                        threads.push(handle);
                    }
                    Err(e) => tracing::error!("{}: failed to serve {}: {}", name, peer, e),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => {
                tracing::error!("{}: accept error: {}", name, e);
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn spawn_connection(
    name: &str,
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    connections: Arc<Mutex<HashMap<u64, TcpStream>>>,
    jobs: Sender<Job>,
    max_request: usize,
    idle_timeout: Duration,
) -> Result<JoinHandle<()>> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(idle_timeout))?;
    connections.lock().insert(id, stream.try_clone()?);
    tracing::debug!("{}: connection {} from {}", name, id, peer);

    let name = name.to_string();
    let handle = std::thread::Builder::new()
        .name(format!("{}-conn-{}", name, id))
        .spawn(move || {
            serve_connection(&name, &stream, peer, &jobs, max_request);
            let _ = stream.shutdown(Shutdown::Both);
            connections.lock().remove(&id);
            tracing::debug!("{}: connection {} from {} closed", name, id, peer);
        })?;
    Ok(handle)
}

fn serve_connection(
    name: &str,
    stream: &TcpStream,
    peer: SocketAddr,
    jobs: &Sender<Job>,
    max_request: usize,
) {
    // Clients wait for each response before sending the next request, so the
    // buffer never holds bytes past the current message.
    let mut input = BufReader::new(stream);
    loop {
        let request = match read_request(&mut input, max_request) {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                tracing::debug!("{}: dropping {}: {}", name, peer, e);
                return;
            }
        };
        let output = match stream.try_clone() {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!("{}: cannot reply to {}: {}", name, peer, e);
                return;
            }
        };
        let (done_tx, done_rx) = bounded(1);
        let job = Job {
            request,
            output,
            peer,
            done: done_tx,
        };
        if jobs.send(job).is_err() {
            return;
        }
        match done_rx.recv() {
            Ok(true) => {}
            _ => return,
        }
    }
}
