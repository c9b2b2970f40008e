use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::envelope::{self, CallEnvelope, ResponseEnvelope};
use super::InterfaceSpec;
use crate::{Result, WireFsError};

/// Server-side half of a remote interface: resolves one call envelope to an
/// invocation on the target object and produces the response envelope.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    /// The descriptor of the interface this dispatcher serves.
    fn interface(&self) -> &'static InterfaceSpec;

    async fn dispatch(&self, call: CallEnvelope) -> ResponseEnvelope;
}

/// Lifecycle hooks of a skeleton. All methods have defaults; override to
/// customize error reporting or to observe shutdown.
pub trait SkeletonEvents: Send + Sync + 'static {
    /// Invoked on an accept error. Return `true` to resume accepting,
    /// `false` to shut the server down (the default).
    fn listen_error(&self, error: &std::io::Error) -> bool {
        let _ = error;
        false
    }

    /// Invoked when a service task fails on anything but a clean EOF.
    fn service_error(&self, error: &WireFsError) {
        warn!(error = %error, "service task failed");
    }

    /// Invoked exactly once when the listener has terminated. `cause` is
    /// `None` for an explicit `stop`.
    fn stopped(&self, cause: Option<&WireFsError>) {
        let _ = cause;
    }
}

/// The default hooks: log service failures, shut down on accept errors.
pub struct LogEvents;

impl SkeletonEvents for LogEvents {}

struct Running {
    shutdown: watch::Sender<bool>,
    listener: JoinHandle<()>,
}

/// A multithreaded TCP endpoint serving one remote interface.
///
/// `start` binds a listening socket and spawns a listener task; every
/// accepted connection is served on its own task (one call envelope in, one
/// response envelope out). `stop` cancels only the listener; in-flight
/// service tasks run to completion.
pub struct Skeleton {
    dispatcher: Arc<dyn Dispatcher>,
    events: Arc<dyn SkeletonEvents>,
    configured: SocketAddr,
    bound: parking_lot::Mutex<Option<SocketAddr>>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl Skeleton {
    /// Creates a skeleton for `dispatcher` at `addr` (port 0 = OS-assigned
    /// at start). Fails if the dispatcher's interface is not remote.
    pub fn new(dispatcher: impl Dispatcher, addr: SocketAddr) -> Result<Self> {
        Self::with_events(dispatcher, addr, LogEvents)
    }

    /// As `new`, with custom lifecycle hooks.
    pub fn with_events(
        dispatcher: impl Dispatcher,
        addr: SocketAddr,
        events: impl SkeletonEvents,
    ) -> Result<Self> {
        dispatcher.interface().ensure_remote()?;
        Ok(Self {
            dispatcher: Arc::new(dispatcher),
            events: Arc::new(events),
            configured: addr,
            bound: parking_lot::Mutex::new(None),
            running: tokio::sync::Mutex::new(None),
        })
    }

    pub fn interface(&self) -> &'static InterfaceSpec {
        self.dispatcher.interface()
    }

    /// The bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock()
    }

    /// The port a stub created from this skeleton should dial. Requires the
    /// skeleton to be started or to carry a fixed configured port.
    pub fn stub_port(&self) -> Result<u16> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr.port());
        }
        if self.configured.port() != 0 {
            return Ok(self.configured.port());
        }
        Err(WireFsError::IllegalState(
            "skeleton has no fixed port and has not been started".into(),
        ))
    }

    /// The host a stub created from this skeleton should dial. A wildcard
    /// bind maps to loopback.
    pub fn stub_host(&self) -> String {
        let ip = self
            .local_addr()
            .map(|a| a.ip())
            .unwrap_or_else(|| self.configured.ip());
        if ip.is_unspecified() {
            "127.0.0.1".to_string()
        } else {
            ip.to_string()
        }
    }

    /// Binds the listening socket and spawns the listener task. Returns
    /// immediately. Fails if the skeleton is already running.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(WireFsError::IllegalState(
                "skeleton has already been started".into(),
            ));
        }

        let listener = TcpListener::bind(self.configured)
            .await
            .map_err(|e| WireFsError::Rpc(format!("bind {} failed: {e}", self.configured)))?;
        let local = listener
            .local_addr()
            .map_err(|e| WireFsError::Rpc(format!("local address unavailable: {e}")))?;
        *self.bound.lock() = Some(local);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(listen_loop(
            listener,
            self.dispatcher.clone(),
            self.events.clone(),
            shutdown_rx,
        ));
        *running = Some(Running {
            shutdown: shutdown_tx,
            listener: handle,
        });

        debug!(addr = %local, interface = %self.dispatcher.interface().kind, "skeleton listening");
        Ok(())
    }

    /// Stops the listener and waits for it to terminate. Idempotent. The
    /// `stopped` hook fires exactly once per start. In-flight service tasks
    /// are not interrupted.
    pub async fn stop(&self) {
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            let _ = running.listener.await;
        }
    }
}

async fn listen_loop(
    listener: TcpListener,
    dispatcher: Arc<dyn Dispatcher>,
    events: Arc<dyn SkeletonEvents>,
    mut shutdown: watch::Receiver<bool>,
) {
    let cause = loop {
        tokio::select! {
            _ = shutdown.changed() => break None,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    tokio::spawn(serve_connection(
                        stream,
                        dispatcher.clone(),
                        events.clone(),
                    ));
                }
                Err(e) => {
                    if !events.listen_error(&e) {
                        break Some(WireFsError::Rpc(format!("accept failed: {e}")));
                    }
                }
            }
        }
    };
    events.stopped(cause.as_ref());
}

/// One connection, one call: read the envelope, dispatch, reply, close.
async fn serve_connection(
    mut stream: TcpStream,
    dispatcher: Arc<dyn Dispatcher>,
    events: Arc<dyn SkeletonEvents>,
) {
    let call = match envelope::read_frame::<_, CallEnvelope>(&mut stream).await {
        Ok(Some(call)) => call,
        // Peer closed without sending a request; not an error.
        Ok(None) => return,
        Err(e) => {
            events.service_error(&e);
            return;
        }
    };

    let response = dispatcher.dispatch(call).await;

    if let Err(e) = envelope::write_frame(&mut stream, &response).await {
        events.service_error(&e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::envelope::TypeTag;
    use crate::rpc::stub::StubHandle;
    use crate::rpc::{InterfaceKind, MethodSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};

    static ECHO: InterfaceSpec = InterfaceSpec {
        kind: InterfaceKind::Storage,
        methods: &[MethodSpec {
            name: "echo",
            arg_types: &[TypeTag::Str],
            declares_rpc_error: true,
        }],
    };

    struct EchoDispatcher;

    #[async_trait]
    impl Dispatcher for EchoDispatcher {
        fn interface(&self) -> &'static InterfaceSpec {
            &ECHO
        }

        async fn dispatch(&self, call: CallEnvelope) -> ResponseEnvelope {
            match (call.method.as_str(), call.arg_types.as_slice()) {
                ("echo", [TypeTag::Str]) => {
                    let (text,): (String,) = postcard::from_bytes(&call.args).unwrap();
                    ResponseEnvelope::Return(postcard::to_allocvec(&text).unwrap())
                }
                ("boom", _) => ResponseEnvelope::Fault(WireFsError::NotFound("/boom".into())),
                _ => ResponseEnvelope::Fault(WireFsError::Rpc(format!(
                    "no such method: {}",
                    call.method
                ))),
            }
        }
    }

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    async fn started_skeleton() -> Skeleton {
        let skeleton = Skeleton::new(EchoDispatcher, loopback()).unwrap();
        skeleton.start().await.unwrap();
        skeleton
    }

    #[tokio::test]
    async fn test_invoke_round_trip() {
        let skeleton = started_skeleton().await;
        let handle = StubHandle::for_skeleton(&ECHO, &skeleton).unwrap();

        let got: String = handle
            .invoke("echo", &[TypeTag::Str], &("hello".to_string(),))
            .await
            .unwrap();
        assert_eq!(got, "hello");
        skeleton.stop().await;
    }

    #[tokio::test]
    async fn test_fault_re_raised_with_kind() {
        let skeleton = started_skeleton().await;
        let handle = StubHandle::for_skeleton(&ECHO, &skeleton).unwrap();

        let err = handle
            .invoke::<_, String>("boom", &[], &())
            .await
            .unwrap_err();
        assert_eq!(err, WireFsError::NotFound("/boom".into()));
        skeleton.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_method_faults() {
        let skeleton = started_skeleton().await;
        let handle = StubHandle::for_skeleton(&ECHO, &skeleton).unwrap();

        let err = handle
            .invoke::<_, String>("nope", &[], &())
            .await
            .unwrap_err();
        assert!(matches!(err, WireFsError::Rpc(_)));
        skeleton.stop().await;
    }

    #[tokio::test]
    async fn test_double_start_fails() {
        let skeleton = started_skeleton().await;
        assert!(matches!(
            skeleton.start().await,
            Err(WireFsError::IllegalState(_))
        ));
        skeleton.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_fires_stopped_once() {
        struct Counting(Arc<AtomicUsize>);
        impl SkeletonEvents for Counting {
            fn stopped(&self, _cause: Option<&WireFsError>) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let stops = Arc::new(AtomicUsize::new(0));
        let skeleton =
            Skeleton::with_events(EchoDispatcher, loopback(), Counting(stops.clone())).unwrap();
        skeleton.start().await.unwrap();
        skeleton.stop().await;
        skeleton.stop().await;
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let skeleton = started_skeleton().await;
        skeleton.stop().await;
        skeleton.start().await.unwrap();

        let handle = StubHandle::for_skeleton(&ECHO, &skeleton).unwrap();
        let got: String = handle
            .invoke("echo", &[TypeTag::Str], &("again".to_string(),))
            .await
            .unwrap();
        assert_eq!(got, "again");
        skeleton.stop().await;
    }

    #[tokio::test]
    async fn test_invoke_against_dead_port_is_rpc_error() {
        let skeleton = started_skeleton().await;
        let handle = StubHandle::for_skeleton(&ECHO, &skeleton).unwrap();
        skeleton.stop().await;

        let err = handle
            .invoke::<_, String>("echo", &[TypeTag::Str], &("x".to_string(),))
            .await
            .unwrap_err();
        assert!(matches!(err, WireFsError::Rpc(_)));
    }

    #[tokio::test]
    async fn test_non_remote_interface_is_fatal() {
        static BROKEN: InterfaceSpec = InterfaceSpec {
            kind: InterfaceKind::Storage,
            methods: &[MethodSpec {
                name: "echo",
                arg_types: &[TypeTag::Str],
                declares_rpc_error: false,
            }],
        };

        struct BrokenDispatcher;

        #[async_trait]
        impl Dispatcher for BrokenDispatcher {
            fn interface(&self) -> &'static InterfaceSpec {
                &BROKEN
            }
            async fn dispatch(&self, _call: CallEnvelope) -> ResponseEnvelope {
                ResponseEnvelope::Return(Vec::new())
            }
        }

        assert!(matches!(
            Skeleton::new(BrokenDispatcher, loopback()),
            Err(WireFsError::NotRemote(_))
        ));
    }
}
