//! A control-port connection over any byte stream.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::channel::oneshot;
use futures::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use futures::task::{Spawn, SpawnExt};
use futures::{AsyncReadExt, FutureExt, select};
use tor_error::debug_report;
use tor_rtcompat::NetStreamProvider;
use tracing::{debug, trace, warn};

use super::proto::{self, Reply, ReplyAssembler};
use super::{ControlConnector, ControlSession, EventObserver, ObserverHandle, ObserverList};
use crate::err::ControlError;
use crate::event::ControlEvent;

/// A reply we are waiting for.
type PendingReply = oneshot::Sender<Result<Reply, ControlError>>;

/// The write half of a control connection.
type Writer = Box<dyn AsyncWrite + Send + Unpin + 'static>;

/// Commands waiting for a reply.
#[derive(Default)]
struct Pending {
    /// Waiters, oldest first.
    waiters: VecDeque<PendingReply>,
    /// Set by the reader task when it exits.  No waiter may be added after this.
    closed: bool,
}

/// State shared between a [`ControlConnection`] and its reader task.
#[derive(Default)]
struct Shared {
    /// Commands that have been sent and are waiting for a reply.
    pending: Mutex<Pending>,
    /// Callbacks for asynchronous events.
    observers: Mutex<ObserverList>,
    /// True until the connection is closed by either side.
    connected: AtomicBool,
}

/// An open connection to Tor's control port.
///
/// A background task reads replies and events; commands may be sent from
/// any task.  Dropping the connection stops the reader and closes the
/// stream.
pub struct ControlConnection {
    /// State shared with the reader task.
    shared: Arc<Shared>,
    /// Where commands are written.  `None` once we have closed our side.
    writer: futures::lock::Mutex<Option<Writer>>,
    /// Dropped to tell the reader task to stop.
    _reader_shutdown: oneshot::Sender<()>,
}

impl ControlConnection {
    /// Wrap `stream`, spawning a reader task on `spawner`.
    pub fn launch<S, SP>(stream: S, spawner: &SP) -> Result<Self, ControlError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        SP: Spawn + ?Sized,
    {
        let (read_half, write_half) = stream.split();
        let shared = Arc::new(Shared {
            connected: AtomicBool::new(true),
            ..Default::default()
        });
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        spawner
            .spawn(read_loop(
                BufReader::new(read_half),
                Arc::clone(&shared),
                shutdown_rx,
            ))
            .map_err(|e| ControlError::Spawn(Arc::new(e)))?;
        Ok(ControlConnection {
            shared,
            writer: futures::lock::Mutex::new(Some(Box::new(write_half))),
            _reader_shutdown: shutdown_tx,
        })
    }

    /// Send `command` and wait for its reply.
    ///
    /// `keyword` names the command in logs and errors; the full line may
    /// contain secrets.
    async fn transact(&self, keyword: &str, command: &str) -> Result<Reply, ControlError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut writer = self.writer.lock().await;
            let w = writer.as_mut().ok_or(ControlError::Closed)?;
            {
                let mut pending = self
                    .shared
                    .pending
                    .lock()
                    .expect("control pending lock poisoned");
                if pending.closed {
                    return Err(ControlError::Closed);
                }
                pending.waiters.push_back(tx);
            }
            trace!("--> {}", keyword);
            let sent = async {
                w.write_all(command.as_bytes()).await?;
                w.write_all(b"\r\n").await?;
                w.flush().await
            }
            .await;
            if let Err(e) = sent {
                self.shared.connected.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        }
        rx.await.map_err(|_| ControlError::Closed)?
    }

    /// As `transact`, but fail early if the connection is closed.
    async fn command(&self, keyword: &str, command: &str) -> Result<Reply, ControlError> {
        if !self.is_connected() {
            return Err(ControlError::Closed);
        }
        self.transact(keyword, command).await
    }
}

#[async_trait]
impl ControlSession for ControlConnection {
    async fn authenticate(&self, cookie: &[u8]) -> Result<bool, ControlError> {
        let line = format!("AUTHENTICATE {}", hex::encode_upper(cookie));
        let reply = self.command("AUTHENTICATE", &line).await?;
        match reply.code {
            proto::OK => Ok(true),
            proto::AUTHENTICATION_REQUIRED => {
                debug!("Tor rejected authentication: {}", reply.message());
                Ok(false)
            }
            _ => reply.into_result("AUTHENTICATE").map(|_| false),
        }
    }

    async fn set_events(&self, events: &[&str]) -> Result<(), ControlError> {
        let line = format!("SETEVENTS {}", events.join(" "));
        self.command("SETEVENTS", &line)
            .await?
            .into_result("SETEVENTS")?;
        Ok(())
    }

    async fn set_conf(&self, key: &str, value: &str) -> Result<(), ControlError> {
        let line = format!("SETCONF {}={}", key, proto::quote(value));
        self.command("SETCONF", &line).await?.into_result("SETCONF")?;
        Ok(())
    }

    async fn get_info(&self, keys: &[&str]) -> Result<HashMap<String, String>, ControlError> {
        let line = format!("GETINFO {}", keys.join(" "));
        let reply = self
            .command("GETINFO", &line)
            .await?
            .into_result("GETINFO")?;
        Ok(reply.info_values())
    }

    fn add_observer(&self, observer: EventObserver) -> ObserverHandle {
        self.shared
            .observers
            .lock()
            .expect("control observer lock poisoned")
            .add(observer)
    }

    fn remove_observers(&self, handles: &[ObserverHandle]) {
        self.shared
            .observers
            .lock()
            .expect("control observer lock poisoned")
            .remove(handles);
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        if !self.shared.connected.swap(false, Ordering::SeqCst) {
            trace!("Control connection already closed");
            return;
        }
        if let Err(e) = self.transact("QUIT", "QUIT").await {
            debug_report!(&e, "QUIT on control connection failed");
        }
        if let Some(mut w) = self.writer.lock().await.take() {
            if let Err(e) = w.close().await {
                debug!("Error closing control connection: {}", e);
            }
        }
        debug!("Disconnected from Tor control port");
    }
}

/// Read replies and events from Tor until the stream ends or we are told to stop.
async fn read_loop<Rd>(mut reader: Rd, shared: Arc<Shared>, shutdown: oneshot::Receiver<()>)
where
    Rd: AsyncBufRead + Unpin,
{
    let mut shutdown = shutdown.fuse();
    let mut assembler = ReplyAssembler::default();
    let mut line = String::new();

    let outcome: Result<(), ControlError> = loop {
        line.clear();
        let read = select! {
            _ = shutdown => None,
            r = reader.read_line(&mut line).fuse() => Some(r),
        };
        let Some(read) = read else {
            break Ok(());
        };
        match read {
            Ok(0) => break Ok(()),
            Ok(_) => {}
            Err(e) => break Err(e.into()),
        }
        let text = line.trim_end_matches(['\r', '\n']);
        trace!("<-- {}", text);
        let reply = match assembler.push_line(text) {
            Ok(Some(reply)) => reply,
            Ok(None) => continue,
            Err(e) => break Err(e),
        };
        if reply.is_event() {
            dispatch_event(&shared, &reply);
            continue;
        }
        let waiter = shared
            .pending
            .lock()
            .expect("control pending lock poisoned")
            .waiters
            .pop_front();
        match waiter {
            Some(tx) => {
                // The command's caller may have gone away; that's fine.
                let _ = tx.send(Ok(reply));
            }
            None => warn!("Unsolicited reply from Tor: {}", reply),
        }
    };

    shared.connected.store(false, Ordering::SeqCst);
    if let Err(e) = &outcome {
        debug_report!(e, "Control connection failed");
    }
    let pending: Vec<_> = {
        let mut pending = shared
            .pending
            .lock()
            .expect("control pending lock poisoned");
        pending.closed = true;
        pending.waiters.drain(..).collect()
    };
    for tx in pending {
        let err = match &outcome {
            Err(e) => e.clone(),
            Ok(()) => ControlError::Closed,
        };
        let _ = tx.send(Err(err));
    }
    trace!("Control connection reader exiting");
}

/// Hand an asynchronous event to the registered observers.
fn dispatch_event(shared: &Shared, reply: &Reply) {
    let Some(first) = reply.lines.first() else {
        return;
    };
    let event = ControlEvent::parse(&first.text);
    let handled = shared
        .observers
        .lock()
        .expect("control observer lock poisoned")
        .dispatch(&event);
    if !handled {
        trace!("Ignoring control event {:?}", first.text);
    }
}

/// Opens [`ControlConnection`]s over TCP using a runtime.
#[derive(Clone, Debug)]
pub struct TcpControlConnector<R> {
    /// Runtime used to connect and to spawn reader tasks.
    runtime: R,
}

impl<R> TcpControlConnector<R> {
    /// Return a new connector using `runtime`.
    pub fn new(runtime: R) -> Self {
        TcpControlConnector { runtime }
    }
}

#[async_trait]
impl<R> ControlConnector for TcpControlConnector<R>
where
    R: NetStreamProvider<SocketAddr> + Spawn + Send + Sync + 'static,
{
    async fn connect(&self, addr: SocketAddr) -> io::Result<Arc<dyn ControlSession>> {
        let stream = self.runtime.connect(&addr).await?;
        let conn = ControlConnection::launch(stream, &self.runtime).map_err(io::Error::other)?;
        Ok(Arc::new(conn))
    }
}
