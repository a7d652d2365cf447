//! Card server in another process, reached over a pair of byte streams.
//!
//! Every request is relayed on its own short-lived thread: write the
//! request frame, read the response frame, complete. The other side runs
//! [`super::host::serve`].

use std::collections::HashSet;
use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use cardserver_protocol::{decode_response, encode_request, read_frame, write_frame, CardServerFault, Request};

use super::implementation::{Completion, Outcome, ServerBackend, ServerImplementation};

/// Time a child gets to exit after its input was closed.
const CHILD_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Time a relay gets to return once the connection is closed.
const RELAY_EXIT_TIMEOUT: Duration = Duration::from_secs(2);

type SharedWriter = Arc<Mutex<Option<Box<dyn Write + Send>>>>;
type SharedReader = Arc<Mutex<Option<Box<dyn Read + Send>>>>;

fn closed() -> CardServerFault {
    CardServerFault::transport("connection to the card server is closed")
}

fn exchange(writer: &SharedWriter, reader: &SharedReader, request: &Request) -> Outcome {
    let frame = encode_request(request)?;
    {
        let mut writer = writer.lock();
        let writer = writer.as_mut().ok_or_else(closed)?;
        write_frame(writer.as_mut(), &frame)?;
    }

    let mut reader = reader.lock();
    let reader = reader.as_mut().ok_or_else(closed)?;
    let (header, payload) =
        read_frame(reader.as_mut())?.ok_or_else(|| CardServerFault::transport("card server closed the connection"))?;
    decode_response(header.message_type, &payload)?.into()
}

struct Relay {
    handle: JoinHandle<()>,
    /// Disconnects when the relay thread ends.
    done: Receiver<()>,
}

/// Remote backend of a [`ServerImplementation`].
pub struct OutOfProcessCardServer {
    writer: SharedWriter,
    reader: SharedReader,
    pending: Arc<Mutex<Option<Completion>>>,
    relay: Option<Relay>,
    child: Option<Child>,
    extensions: HashSet<String>,
}

impl OutOfProcessCardServer {
    pub fn new(writer: impl Write + Send + 'static, reader: impl Read + Send + 'static) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Some(Box::new(writer)))),
            reader: Arc::new(Mutex::new(Some(Box::new(reader)))),
            pending: Arc::new(Mutex::new(None)),
            relay: None,
            child: None,
            extensions: HashSet::new(),
        }
    }

    /// Start `program` with `args` and talk to it over its standard streams.
    pub fn spawn(program: &str, args: &[&str]) -> std::io::Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "child has no standard streams"));
        };

        info!("[Remote] Started card server process {} ({})", program, child.id());
        let mut server = Self::new(stdin, stdout);
        server.child = Some(child);
        Ok(server)
    }

    pub fn into_server(self) -> ServerImplementation {
        ServerImplementation::new(Box::new(self))
    }

    /// Wait for the current relay; give up on it after `timeout`.
    fn finish_relay(&mut self, timeout: Option<Duration>) {
        let Some(relay) = self.relay.take() else {
            return;
        };

        if let Some(timeout) = timeout {
            if let Err(RecvTimeoutError::Timeout) = relay.done.recv_timeout(timeout) {
                warn!("[Remote] Relay thread did not return, leaving it behind");
                return;
            }
        }

        if relay.handle.join().is_err() {
            error!("[Remote] Relay thread panicked");
        }
    }

    fn stop_child(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        let deadline = Instant::now() + CHILD_EXIT_TIMEOUT;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    info!("[Remote] Card server process exited: {}", status);
                    return;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(50)),
                Ok(None) => break,
                Err(e) => {
                    warn!("[Remote] Failed to query card server process: {}", e);
                    break;
                }
            }
        }

        warn!("[Remote] Killing card server process {}", child.id());
        let _ = child.kill();
        let _ = child.wait();
    }
}

impl ServerBackend for OutOfProcessCardServer {
    fn submit(&mut self, request: Request, completion: Completion) {
        self.finish_relay(None);
        *self.pending.lock() = Some(completion);

        let writer = self.writer.clone();
        let reader = self.reader.clone();
        let pending = self.pending.clone();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new().name("cardserver-relay".into()).spawn(move || {
            let _done = done_tx;
            let name = request.name();
            let outcome = exchange(&writer, &reader, &request);
            if let Err(fault) = &outcome {
                debug!("[Remote] {} failed: {}", name, fault);
            }

            let completion = pending.lock().take();
            match completion {
                Some(completion) => completion.complete(outcome),
                None => debug!("[Remote] {} returned after shutdown", name),
            }
        });

        match handle {
            Ok(handle) => self.relay = Some(Relay { handle, done: done_rx }),
            Err(e) => {
                error!("[Remote] Failed to start relay thread: {}", e);
                // dropping the completion reports the request as abandoned
                drop(self.pending.lock().take());
            }
        }
    }

    fn is_extension_cached(&self, identity: &str) -> bool {
        self.extensions.contains(&identity.to_lowercase())
    }

    fn cache_extension(&mut self, identity: &str) {
        self.extensions.insert(identity.to_lowercase());
    }

    fn shutdown(&mut self) {
        // closing our side first lets a blocked relay and the host see the end
        if self.writer.lock().take().is_some() {
            info!("[Remote] Connection closed");
        }
        self.stop_child();
        self.finish_relay(Some(RELAY_EXIT_TIMEOUT));

        // a relay left behind still holds the reader and drops it when it ends
        if let Some(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        if self.pending.lock().take().is_some() {
            warn!("[Remote] Abandoned the request in flight");
        }
    }
}

impl Drop for OutOfProcessCardServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
