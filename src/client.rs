//! CASTV2 session controller: TLS connection, request correlation,
//! heartbeat, and status broadcasting.

use anyhow::format_err;
use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Utc};
use crate::{
    message::{
        CastMessage,
        CastMessagePayload,
    },
    payload::{self, Payload, PayloadDyn, RequestId, RequestIdGen,
              RequestInner, ResponseInner,
              media::MediaRequestCommon},
    types::{AppId,
            AppSession,
            EndpointId, EndpointIdConst, ENDPOINT_BROADCAST,
            MediaSession,
            MediaSessionId,
            MessageTypeConst,
            NamespaceConst},
    util::named,
    Error,
};
use futures::{
    future::Either,
    SinkExt, Stream, StreamExt,
    stream::{SplitSink, SplitStream},
};
use once_cell::sync::Lazy;
use pin_project_lite::pin_project;
use protobuf::Message;
use std::{
    any::{self, Any},
    collections::{HashMap, HashSet},
    fmt::{self, Debug, Display},
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::{Arc, atomic::{AtomicUsize, Ordering}},
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    pin,
    sync::{broadcast, mpsc, watch},
};
use tokio_util::{
    codec::{self, Framed},
    time::delay_queue::{DelayQueue, Expired as DelayExpired, Key as DelayKey},
};

pub struct Client {
    /// Some(_) until `.close()` is called.
    task_join_handle: Option<tokio::task::JoinHandle<anyhow::Result<()>>>,

    task_cmd_tx: mpsc::Sender<TaskCmd>,

    request_id_gen: RequestIdGen,
    next_command_id: AtomicUsize,

    shared: Arc<Shared>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub addr: SocketAddr,

    /// `EndpointId` used as the sender, and source of messages we send.
    ///
    /// Set `None` for the default, or `Some(a)` will override it.
    pub sender: Option<EndpointId>,
}

/// Data shared between `Client` and its `Task`.
struct Shared {
    config: Config,
    status_tx: broadcast::Sender<StatusUpdate>,
    state_tx: watch::Sender<SessionState>,

    /// Why the task died, for callers that observe `SessionState::Error`
    /// through the watch channel rather than through a failed RPC.
    fatal: std::sync::Mutex<Option<Error>>,
}

/// Coarse lifecycle of the connection and the media it controls.
///
/// `Ended` is reached only when the device reports the content finished;
/// a clean local shutdown goes straight to `Disconnected`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Loading,
    Playing,
    Paused,
    Ended,
    Error,
}

impl Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

#[derive(Debug)]
pub struct LoadMediaArgs {
    pub media: payload::media::Media,

    pub current_time: f64,
    pub autoplay: bool,

    /// None to use default.
    pub preload_time: Option<f64>,

    /// Track ids (from `media.tracks`) the device should activate on load.
    pub active_track_ids: Option<Vec<payload::media::TrackId>>,
}

pin_project! {
    struct Task<S: TokioAsyncStream> {
        #[pin]
        conn_framed_sink: SplitSink<Framed<S, CastMessageCodec>, CastMessage>,

        #[pin]
        conn_framed_stream: SplitStream<Framed<S, CastMessageCodec>>,

        #[pin]
        task_cmd_rx: tokio_stream::wrappers::ReceiverStream<TaskCmd>,

        #[pin]
        timeout_queue: DelayQueue<RequestId>,

        #[pin]
        ping_interval: tokio_stream::wrappers::IntervalStream,

        need_flush: bool,
        requests_map: HashMap<RequestId, RequestState>,

        shared: Arc<Shared>,
    }
}

#[derive(Debug)]
struct RequestState {
    response_ns: NamespaceConst,
    delay_key: DelayKey,

    result_sender: TaskCmdResultSender,
}

#[derive(Debug)]
struct TaskCmdResultSender {
    command_id: CommandId,
    result_tx: tokio::sync::oneshot::Sender<TaskCmdResult>,
}

#[derive(Debug)]
struct TaskCmd {
    command: TaskCmdType,
    result_sender: TaskCmdResultSender,
}

#[derive(Debug)]
enum TaskCmdType {
    CastRpc(Box<CastRpc>),
    CastSend(Box<CastSend>),
    Shutdown,
}

#[derive(Debug)]
struct CastRpc {
    request_message: CastMessage,
    request_id: RequestId,
    response_ns: NamespaceConst,
}

#[derive(Debug)]
struct CastSend {
    request_message: CastMessage,
}

#[derive(Debug)]
struct TaskResponseBox {
    type_name: &'static str,
    value: Box<dyn Any + Send>,
}

type TaskCmdResult = anyhow::Result<TaskResponseBox>;

pub trait TokioAsyncStream: AsyncRead + AsyncWrite + Unpin {}

impl<T> TokioAsyncStream for T
where T: AsyncRead + AsyncWrite + Unpin
{}

type CommandId = usize;

struct CastMessageCodec;

#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct StatusUpdate {
    pub time: DateTime<Utc>,
    pub msg: StatusMessage,
}

#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum StatusMessage {
    /// The connection task stopped, cleanly or not.
    Disconnect,

    Media(payload::media::Status),
    Receiver(payload::receiver::Status),
}

/// Duration for the Task to do something locally.
const LOCAL_TASK_COMMAND_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(1_000);

/// Duration for an RPC request and response to the device.
const RPC_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(5_000);

const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

const DATA_BUFFER_LEN: usize = 64 * 1024;

const TASK_CMD_CHANNEL_CAPACITY: usize = 16;

const STATUS_BROADCAST_CHANNEL_CAPACITY: usize = 16;

const TASK_DELAY_QUEUE_CAPACITY: usize = 4;

static JSON_NAMESPACES: Lazy<HashSet<NamespaceConst>> = Lazy::<HashSet<NamespaceConst>>::new(|| {
    HashSet::from([
        payload::connection::CHANNEL_NAMESPACE,
        payload::heartbeat::CHANNEL_NAMESPACE,
        payload::media::CHANNEL_NAMESPACE,
        payload::receiver::CHANNEL_NAMESPACE,
    ])
});

pub const DEFAULT_SENDER_ID: EndpointIdConst = "sender-0";
pub const DEFAULT_RECEIVER_ID: EndpointIdConst = "receiver-0";

/// Well known cast receiver app IDs
pub mod app {
    use crate::types::AppIdConst;

    pub const DEFAULT_MEDIA_RECEIVER: AppIdConst = "CC1AD845";
    pub const BACKDROP: AppIdConst = "E8C28D3C";
}

pub const DEFAULT_PORT: u16 = 8009;

impl Config {
    pub async fn connect(self) -> crate::Result<Client> {
        let state_tx = watch::Sender::new(SessionState::Connecting);

        let conn = tls_connect(&self).await?;

        let (task_cmd_tx, task_cmd_rx) = mpsc::channel(TASK_CMD_CHANNEL_CAPACITY);

        let shared = Arc::new(Shared {
            config: self,
            status_tx: broadcast::Sender::new(STATUS_BROADCAST_CHANNEL_CAPACITY),
            state_tx,
            fatal: std::sync::Mutex::new(None),
        });

        let task = Task::new(conn, task_cmd_rx, Arc::clone(&shared));

        let task_join_handle = Some(tokio::spawn(task.main()));

        let mut client = Client {
            task_join_handle,
            task_cmd_tx,

            request_id_gen: RequestIdGen::new(),
            next_command_id: AtomicUsize::new(1),

            shared,
        };

        client.init().await?;

        client.shared.state_tx.send_replace(SessionState::Connected);

        Ok(client)
    }
}

impl Client {
    pub async fn receiver_status(&mut self) -> crate::Result<payload::receiver::Status> {
        let payload_req = payload::receiver::GetStatusRequest {};

        let resp: Payload<payload::receiver::GetStatusResponse>
            = self.json_rpc(payload_req, DEFAULT_RECEIVER_ID.to_string()).await?;

        Ok(resp.inner.0.status)
    }

    #[named]
    pub async fn receiver_launch_app(&mut self, app_id: AppId)
    -> crate::Result<(payload::receiver::Application, payload::receiver::Status)>
    {
        const METHOD_PATH: &str = method_path!("Client");

        let payload_req = payload::receiver::LaunchRequest {
            app_id: app_id.clone(),
        };

        let resp: Payload<payload::receiver::LaunchResponse>
            = self.json_rpc(payload_req, DEFAULT_RECEIVER_ID.to_string()).await?;

        let payload::receiver::LaunchResponse::Ok(
            payload::receiver::StatusWrapper { status }) = resp.inner else
        {
            return Err(format_err!("{METHOD_PATH}: error response:\n\
                                    Launch response: {resp:#?}").into());
        };

        let Some(app) = status.applications.iter().find(|app| app.app_id == app_id) else {
            return Err(format_err!("{METHOD_PATH}: missing expected application\n\
                                    Receiver status: {status:#?}").into());
        };

        tracing::debug!(target: METHOD_PATH,
                        ?app,
                        "Launched app");

        Ok((app.clone(), status))
    }

    #[named]
    pub async fn receiver_stop_app(&mut self, app_session: AppSession)
    -> crate::Result<payload::receiver::Status>
    {
        use payload::receiver::{StopRequest, StopResponse, StatusWrapper};

        const METHOD_PATH: &str = method_path!("Client");

        let payload_req = StopRequest {
            session_id: app_session.app_session_id,
        };

        let resp: Payload<StopResponse>
            = self.json_rpc(payload_req, app_session.receiver_destination_id).await?;

        let StopResponse::Ok(StatusWrapper { status }) = resp.inner else {
            return Err(format_err!("{METHOD_PATH}: error response\n\
                                    response: {resp:#?}").into());
        };

        Ok(status)
    }

    /// Launches the default media receiver app and opens a virtual
    /// connection to its transport, ready for media commands.
    pub async fn media_launch_default(&mut self)
    -> crate::Result<(AppSession, payload::receiver::Status)> {
        let (app, status) =
            self.receiver_launch_app(app::DEFAULT_MEDIA_RECEIVER.into()).await?;
        let session = app.to_app_session(DEFAULT_RECEIVER_ID.to_string());
        self.connection_connect(session.app_destination_id.clone()).await?;

        Ok((session, status))
    }

    #[named]
    pub async fn media_status(&mut self,
                              app_session: &AppSession,
                              media_session_id: Option<MediaSessionId>)
    -> crate::Result<payload::media::Status> {
        let payload_req = payload::media::GetStatusRequest {
            media_session_id,
        };

        let resp: Payload<payload::media::GetStatusResponse>
            = self.json_rpc(payload_req, app_session.app_destination_id.clone()).await?;

        let payload::media::GetStatusResponse::Ok(media_status) = resp.inner else {
            return Err(format_err!("{method_path}: Error response\n\
                                    _ response = {resp:#?}",
                                   method_path = method_path!("Client")).into());
        };

        Ok(media_status)
    }

    /// Sends a LOAD request.
    ///
    /// An explicit rejection from the device maps to `Error::LoadRejected`
    /// and leaves the control channel usable.
    pub async fn media_load(&mut self,
                            app_session: &AppSession,
                            load_args: LoadMediaArgs)
    -> crate::Result<payload::media::Status> {
        use payload::media::LoadResponse;

        let payload_req = payload::media::LoadRequest {
            session_id: app_session.app_session_id.clone(),

            media: load_args.media,

            current_time: load_args.current_time,
            autoplay: load_args.autoplay,
            preload_time: load_args.preload_time.unwrap_or(10_f64),

            active_track_ids: load_args.active_track_ids,
        };

        let resp: Payload<LoadResponse>
            = self.json_rpc(payload_req, app_session.app_destination_id.clone()).await?;

        match resp.inner {
            LoadResponse::Ok(status) => Ok(status),
            LoadResponse::LoadCancelled =>
                Err(Error::LoadRejected { reason: "LOAD_CANCELLED".to_string() }),
            LoadResponse::LoadFailed =>
                Err(Error::LoadRejected { reason: "LOAD_FAILED".to_string() }),
            LoadResponse::InvalidPlayerState =>
                Err(Error::LoadRejected { reason: "INVALID_PLAYER_STATE".to_string() }),
            LoadResponse::InvalidRequest { reason } =>
                Err(Error::LoadRejected { reason }),
        }
    }

    pub async fn media_play(&mut self,
                            media_session: &MediaSession)
    -> crate::Result<payload::media::Status> {
        self.simple_media_request(media_session, payload::media::PlayRequest).await
    }

    pub async fn media_pause(&mut self,
                             media_session: &MediaSession)
    -> crate::Result<payload::media::Status> {
        self.simple_media_request(media_session, payload::media::PauseRequest).await
    }

    /// Best-effort media STOP.
    ///
    /// Stopping over a channel that is already gone is a no-op `Ok(None)`,
    /// not an error; there is nothing left to stop.
    pub async fn media_stop(&mut self,
                            media_session: &MediaSession)
    -> crate::Result<Option<payload::media::Status>> {
        if self.task_cmd_tx.is_closed() {
            tracing::debug!("Client::media_stop: connection task already gone");
            return Ok(None);
        }

        match self.simple_media_request(media_session, payload::media::StopRequest).await {
            Ok(status) => Ok(Some(status)),
            Err(err @ (Error::TransportLost(_) | Error::ProtocolMismatch)) => {
                tracing::debug!(?err, "Client::media_stop: channel broken, nothing to stop");
                Ok(None)
            },
            Err(err) => Err(err),
        }
    }

    #[named]
    async fn simple_media_request<Req>(
        &mut self,
        media_session: &MediaSession,
        msg_type_fn: fn(MediaRequestCommon) -> Req)
    -> crate::Result<payload::media::Status>
    where Req: payload::RequestInner
    {
        let payload_req = msg_type_fn(MediaRequestCommon {
            media_session_id: media_session.media_session_id,
        });

        let resp: Payload<payload::media::GetStatusResponse>
            = self.json_rpc(payload_req,
                            media_session.app_destination_id().clone()).await?;

        let payload::media::GetStatusResponse::Ok(status) = resp.inner else {
            return Err(format_err!("{method_path}: Error response\n\
                                    _ response         = {resp:#?}\n\
                                    _ request_msg_type = {req_msg_type}\n\
                                    _ media_session    = {media_session:#?}",
                                   method_path = method_path!("Client"),
                                   req_msg_type = Req::TYPE_NAME).into());
        };

        Ok(status)
    }

    /// Broadcast stream of unsolicited status messages from the device.
    pub fn listen_status(&self) -> impl Stream<Item = StatusUpdate> + Send {
        tokio_stream::wrappers::BroadcastStream::new(self.shared.status_tx.subscribe())
            .filter_map(|res| futures::future::ready(match res {
                Ok(it) => Some(it),
                Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(n)) => {
                    tracing::warn!(target: concat!(module_path!(),
                                                   "::Client::listen_status"),
                                   n,
                                   "lagged");
                    None
                },
            }))
    }

    /// Watch channel following `SessionState` transitions.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// The error that moved the session into `SessionState::Error`, if
    /// any. Takes it; a second call returns None.
    pub fn take_fatal_error(&self) -> Option<Error> {
        self.shared.fatal.lock().ok()?.take()
    }

    pub async fn close(mut self) -> crate::Result<()> {
        let res = self.task_cmd::<()>(TaskCmdType::Shutdown).await;

        if let Some(join_fut) = self.task_join_handle.take() {
            match tokio::time::timeout(LOCAL_TASK_COMMAND_TIMEOUT, join_fut).await {
                Ok(Ok(_)) | Err(_) => {},
                Ok(Err(join_err)) => {
                    tracing::warn!(?join_err, "Client::close: task join error");
                },
            }
        }

        self.shared.state_tx.send_replace(SessionState::Disconnected);

        // The task exiting before we asked is still a clean close.
        match res {
            Ok(_) => Ok(()),
            Err(err) => {
                tracing::debug!(?err, "Client::close: task was already gone");
                Ok(())
            },
        }
    }
}

/// Internals.
impl Client {
    async fn init(&mut self) -> crate::Result<()> {
        self.connection_connect(DEFAULT_RECEIVER_ID.to_string()).await?;

        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    async fn connection_connect(&mut self, destination: EndpointId) -> crate::Result<()> {
        let payload_req = payload::connection::ConnectRequest {
            user_agent: payload::USER_AGENT.to_string(),
        };
        self.json_send(payload_req, destination).await?;
        Ok(())
    }

    fn response_from_dyn<Resp>(&self, payload_dyn: Box<PayloadDyn>)
    -> anyhow::Result<Payload<Resp>>
    where Resp: ResponseInner
    {
        Ok(Payload::<Resp> {
            request_id: payload_dyn.request_id,
            typ: payload_dyn.typ,
            inner: serde_json::from_value(payload_dyn.inner)?,
        })
    }

    async fn json_send<Req>(&mut self, req: Req, destination: EndpointId)
    -> crate::Result<()>
    where Req: RequestInner
    {
        let (request_message, _request_id) = self.cast_request_from_inner(req, destination)?;

        let cmd_type = TaskCmdType::CastSend(Box::new(CastSend {
            request_message,
        }));

        let _resp: Box<()> = self.task_cmd(cmd_type).await.map_err(client_error)?;

        Ok(())
    }

    #[named]
    async fn json_rpc<Req, Resp>(&mut self, req: Req, destination: EndpointId)
    -> crate::Result<Payload<Resp>>
    where Req: RequestInner,
          Resp: ResponseInner
    {
        let start = tokio::time::Instant::now();

        let (request_message, request_id) = self.cast_request_from_inner(req, destination)?;

        let response_ns = Resp::CHANNEL_NAMESPACE;

        let cmd_type = TaskCmdType::CastRpc(Box::new(CastRpc {
            request_message,
            request_id,
            response_ns,
        }));

        let resp_dyn: Box<PayloadDyn> =
            self.task_cmd(cmd_type).await.map_err(client_error)?;
        let resp: Payload<Resp> = self.response_from_dyn(resp_dyn)?;

        let elapsed = start.elapsed();

        tracing::debug!(target: method_path!("Client"),
                        ?elapsed,
                        response_payload = ?resp,
                        response_ns,
                        response_type_name = resp.typ,
                        %request_id,
                        "json_rpc response");

        Ok(resp)
    }

    #[named]
    fn cast_request_from_inner<Req>(&self, req: Req, destination: EndpointId)
    -> crate::Result<(CastMessage, RequestId)>
    where Req: RequestInner
    {
        const METHOD_PATH: &str = method_path!("Client");

        let request_id = self.request_id_gen.take_next();
        let payload = Payload::<Req> {
            request_id: Some(request_id),
            typ: Req::TYPE_NAME.to_string(),
            inner: req,
        };

        let sender = self.config().sender();
        let request_namespace = Req::CHANNEL_NAMESPACE.to_string();

        tracing::trace!(target: METHOD_PATH,
                        ?payload,
                        %request_id,
                        request_type = payload.typ,
                        request_namespace,
                        sender, destination,
                        "payload struct");

        let payload_json = serde_json::to_string(&payload)
            .map_err(|err| format_err!("{METHOD_PATH}: payload serialisation failed: {err}"))?;

        let request_message = CastMessage {
            namespace: request_namespace,
            source: sender,
            destination,
            payload: payload_json.into(),
        };

        Ok((request_message, request_id))
    }

    async fn task_cmd<R>(&mut self, cmd_type: TaskCmdType)
    -> anyhow::Result<Box<R>>
    where R: Any + Send + Sync
    {
        let command_id = self.take_command_id();
        let (result_tx, result_rx) = tokio::sync::oneshot::channel::<TaskCmdResult>();

        let cmd = TaskCmd {
            command: cmd_type,
            result_sender: TaskCmdResultSender {
                command_id,
                result_tx,
            },
        };
        let command_timeout: std::time::Duration = match &cmd.command {
            TaskCmdType::CastRpc(_) => RPC_TIMEOUT,
            TaskCmdType::CastSend(_) => RPC_TIMEOUT,
            TaskCmdType::Shutdown => LOCAL_TASK_COMMAND_TIMEOUT,
        };

        self.task_cmd_tx.send_timeout(
            cmd,
            LOCAL_TASK_COMMAND_TIMEOUT).await?;

        let response: TaskResponseBox =
            tokio::time::timeout(command_timeout, result_rx).await???;

        response.downcast::<R>()
    }

    fn take_command_id(&self) -> CommandId {
        self.next_command_id.fetch_add(1, Ordering::SeqCst)
    }
}

/// Recovers typed errors the connection task tunnels through `anyhow`.
fn client_error(err: anyhow::Error) -> Error {
    match err.downcast::<Error>() {
        Ok(e) => e,
        Err(err) => Error::Internal(err),
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.task_join_handle.is_some() {
            tracing::error!("Client: task not stopped before drop.\n\
                             Use Client::close to dispose of Client.");
        }
    }
}

impl Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Client")
         .field("config", &self.shared.config)
         .field("task", if self.task_join_handle.is_some() { &"Some" } else { &"None" })
         .finish_non_exhaustive()
    }
}

#[tracing::instrument(level = "info",
                      fields(ip = ?config.addr.ip(),
                             port = config.addr.port()))]
#[named]
async fn tls_connect(config: &Config)
-> crate::Result<impl TokioAsyncStream>
{
    const FUNCTION_PATH: &str = function_path!();

    let addr = config.addr;
    let ip: IpAddr = addr.ip();

    let mut tls_config = rustls::ClientConfig::builder()
        .dangerous().with_custom_certificate_verifier(Arc::new(
            crate::util::rustls::danger::NoCertificateVerification::new_ring()))
        .with_no_client_auth();

    tls_config.enable_early_data = true;
    let tls_config = Arc::new(tls_config);

    let connector = tokio_rustls::TlsConnector::from(tls_config);

    let ip_rustls = rustls::pki_types::IpAddr::from(ip);
    let domain = rustls::pki_types::ServerName::IpAddress(ip_rustls);

    let tcp_stream = tokio::net::TcpStream::connect(addr).await
        .map_err(|err| Error::ConnectFailed {
            addr,
            source: format_err!("TCP connect: {err}"),
        })?;

    tracing::debug!(target: FUNCTION_PATH,
                    "TcpStream connected");

    let tls_stream = connector.connect(domain, tcp_stream).await
        .map_err(|err| Error::ConnectFailed {
            addr,
            source: format_err!("TLS handshake: {err}"),
        })?;

    tracing::debug!(target: FUNCTION_PATH,
                    "TlsStream connected");

    Ok(tls_stream)
}

#[derive(Debug)]
enum TaskEvent {
    Cmd(TaskCmd),
    Flush(anyhow::Result<()>),
    MessageRead(anyhow::Result<CastMessage>),
    PingTick,
    RpcTimeout(DelayExpired<RequestId>),
}

/// A connection-fatal condition found while reading from the device.
enum ReadFatal {
    ProtocolMismatch,
    TransportLost(String),
}

impl<S: TokioAsyncStream> Task<S> {
    fn new(
        conn: S,
        task_cmd_rx: mpsc::Receiver<TaskCmd>,
        shared: Arc<Shared>,
    ) -> Task<S> {
        let task_cmd_rx = tokio_stream::wrappers::ReceiverStream::new(task_cmd_rx);

        let timeout_queue = DelayQueue::<RequestId>::with_capacity(TASK_DELAY_QUEUE_CAPACITY);

        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let ping_interval = tokio_stream::wrappers::IntervalStream::new(interval);

        let cast_message_codec = CastMessageCodec;
        let conn_framed = tokio_util::codec::Framed::with_capacity(
            conn, cast_message_codec, DATA_BUFFER_LEN);

        let (conn_framed_sink, conn_framed_stream) = conn_framed.split();

        Task {
            conn_framed_sink,
            conn_framed_stream,

            task_cmd_rx,
            timeout_queue,
            ping_interval,

            need_flush: false,
            requests_map: HashMap::new(),

            shared,
        }
    }

    #[named]
    async fn main(self) -> anyhow::Result<()> {
        const METHOD_PATH: &str = method_path!("Task");

        pin! {
            let this = self;
        }

        while let Some(event) = this.as_mut().take_next_event().await {
            tracing::trace!(target: METHOD_PATH,
                            ?event,
                            "event");

            match event {
                TaskEvent::Cmd(cmd) => match cmd.command {
                    TaskCmdType::CastRpc(rpc) => {
                        this.as_mut().handle_rpc_cmd(rpc, cmd.result_sender).await;
                    },

                    TaskCmdType::CastSend(send) => {
                        this.as_mut().handle_send(send, cmd.result_sender).await;
                    },

                    TaskCmdType::Shutdown => {
                        tracing::info!(target: METHOD_PATH,
                                       "shutdown on command");
                        Self::respond_generic(cmd.result_sender, Ok(()));
                        return Ok(());
                    },
                },

                TaskEvent::MessageRead(read_res) => {
                    if let Some(fatal) = this.as_mut().handle_msg_read(read_res).await {
                        this.as_mut().handle_conn_fatal(fatal);
                        return Ok(());
                    }
                },

                TaskEvent::PingTick => {
                    this.as_mut().handle_ping_tick().await;
                },

                TaskEvent::RpcTimeout(expired) => {
                    this.as_mut().handle_rpc_timeout(expired);
                }

                TaskEvent::Flush(res) => {
                    if let Err(err) = res {
                        tracing::warn!(target: METHOD_PATH,
                                       ?err,
                                       "flush error");
                    }
                    this.need_flush = false;
                }
            }
        }

        tracing::info!(target: METHOD_PATH,
                       "shutdown on event stream closed");

        Ok(())
    }

    async fn take_next_event(self: Pin<&mut Self>) -> Option<TaskEvent> {
        let mut proj = self.project();

        let conn_flush_stream = if *proj.need_flush {
            let fut = proj.conn_framed_sink.flush();
            let stream = futures::stream::once(fut);
            Either::Left(stream)
        } else {
            Either::Right(futures::stream::empty())
        };

        // Streams polled in order with current implementation on first
        // poll of Merge.
        //
        // By assigning to a variable, these temporaries have their
        // lifetime extended so `merge()` can use them.
        let streams = (
            &mut (conn_flush_stream.map(TaskEvent::Flush)),
            &mut (proj.task_cmd_rx.map(TaskEvent::Cmd)),
            &mut (proj.timeout_queue.map(TaskEvent::RpcTimeout)),
            &mut (proj.ping_interval.map(|_| TaskEvent::PingTick)),
            &mut (proj.conn_framed_stream.map(TaskEvent::MessageRead)),
        );

        let mut merged = futures_concurrency::stream::Merge::merge(streams);

        merged.next().await
    }

    /// Fails all in-flight requests and tells listeners the channel died.
    #[named]
    fn handle_conn_fatal(mut self: Pin<&mut Self>, fatal: ReadFatal) {
        const METHOD_PATH: &str = method_path!("Task");

        let mut proj = self.as_mut().project();

        for (request_id, request_state) in proj.requests_map.drain() {
            let _ = proj.timeout_queue.as_mut().try_remove(&request_state.delay_key);

            let err = match &fatal {
                ReadFatal::ProtocolMismatch =>
                    anyhow::Error::new(Error::ProtocolMismatch),
                ReadFatal::TransportLost(detail) =>
                    anyhow::Error::new(Error::TransportLost(
                        format_err!("{detail} (request_id = {request_id})"))),
            };

            Self::respond_rpc(request_state.result_sender, Err(err));
        }

        let fatal_err = match &fatal {
            ReadFatal::ProtocolMismatch => Error::ProtocolMismatch,
            ReadFatal::TransportLost(detail) =>
                Error::TransportLost(format_err!("{detail}")),
        };

        if let Ok(mut slot) = proj.shared.fatal.lock() {
            slot.get_or_insert(fatal_err);
        }

        proj.shared.state_tx.send_replace(SessionState::Error);

        tracing::warn!(target: METHOD_PATH,
                       "connection lost, task exiting");

        self.publish_status_update(StatusUpdate {
            time: Utc::now(),
            msg: StatusMessage::Disconnect,
        });
    }

    #[named]
    async fn handle_send(mut self: Pin<&mut Self>,
                         send: Box<CastSend>, result_sender: TaskCmdResultSender)
    {
        const METHOD_PATH: &str = method_path!("Task");

        let deadline = tokio::time::Instant::now() + RPC_TIMEOUT;

        let CastSend {
            request_message,
        } = *send;

        let command_id = &result_sender.command_id;

        tracing::debug!(target: METHOD_PATH,
                        ?deadline,
                        command_id,
                        ?request_message,
                        "msg send");

        let res = self.as_mut().send_raw(request_message, deadline).await;

        if let Err(ref err) = res {
            tracing::warn!(target: METHOD_PATH,
                           ?err,
                           command_id,
                           "send_raw error");
        }

        Self::respond_send(result_sender, res);
    }

    #[named]
    async fn handle_rpc_cmd(mut self: Pin<&mut Self>,
                            rpc: Box<CastRpc>, result_sender: TaskCmdResultSender)
    {
        const METHOD_PATH: &str = method_path!("Task");

        let deadline = tokio::time::Instant::now() + RPC_TIMEOUT;

        let CastRpc {
            request_message,
            request_id,
            response_ns,
        } = *rpc;

        let command_id = &result_sender.command_id;

        tracing::trace!(target: METHOD_PATH,
                        ?deadline,
                        %request_id,
                        command_id,
                        ?request_message,
                        response_ns,
                        "rpc send");

        if let Err(err) = self.as_mut().send_raw(request_message, deadline).await {
            tracing::warn!(target: METHOD_PATH,
                           ?err,
                           %request_id,
                           command_id,
                           response_ns,
                           "send_raw error");

            Self::respond_rpc(result_sender, Err(err));
            return;
        }

        // Record request state and set the timeout.
        let delay_key = self.as_mut().project()
                            .timeout_queue.insert_at(request_id, deadline);

        let state = RequestState {
            delay_key,

            response_ns,
            result_sender,
        };

        self.as_mut().requests_map.insert(request_id, state);
    }

    #[named]
    async fn send_logged(mut self: Pin<&mut Self>, msg: CastMessage) {
        const METHOD_PATH: &str = method_path!("Task");

        let deadline = tokio::time::Instant::now() + RPC_TIMEOUT;

        let msg_debug = format!("{msg:?}");

        tracing::debug!(target: METHOD_PATH,
                        ?deadline,
                        ?msg,
                        "msg send");

        let res = self.as_mut().send_raw(msg, deadline).await;

        if let Err(ref err) = res {
            tracing::warn!(target: METHOD_PATH,
                           ?err,
                           msg = msg_debug,
                           "send_raw error");
        }
    }

    async fn send_raw(self: Pin<&mut Self>, msg: CastMessage, deadline: tokio::time::Instant
    ) -> anyhow::Result<()> {
        let mut proj = self.project();

        *proj.need_flush = true;

        let fut = proj.conn_framed_sink.feed(msg);
        tokio::time::timeout_at(deadline, fut).await??;

        Ok(())
    }

    /// Returns Some(_) when the connection is beyond saving.
    #[named]
    async fn handle_msg_read(mut self: Pin<&mut Self>, read_res: anyhow::Result<CastMessage>)
    -> Option<ReadFatal>
    {
        const METHOD_PATH: &str = method_path!("Task");

        let msg: CastMessage = match read_res {
            Err(err) => {
                if err.downcast_ref::<Error>()
                      .is_some_and(|e| matches!(e, Error::ProtocolMismatch))
                {
                    tracing::error!(target: METHOD_PATH,
                                    "device speaks an unknown protocol version");
                    return Some(ReadFatal::ProtocolMismatch);
                }

                tracing::warn!(target: METHOD_PATH,
                               ?err,
                               "Message read error");
                return Some(ReadFatal::TransportLost(format!("read error: {err}")));
            },
            Ok(msg) => msg,
        };

        let msg_time = Utc::now();

        tracing::trace!(target: METHOD_PATH,
                        ?msg, ?msg_time,
                        "message read");

        let msg_ns = msg.namespace.as_str();
        if !JSON_NAMESPACES.contains(msg_ns) {
            tracing::warn!(target: METHOD_PATH,
                           msg_ns,
                           ?msg,
                           "message namespace not known");
            return None;
        }

        let pd_json_str = match &msg.payload {
            CastMessagePayload::Binary(_b) => {
                tracing::warn!(target: METHOD_PATH,
                               msg_ns,
                               ?msg,
                               "binary message not known");
                return None;
            },
            CastMessagePayload::String(s) => s.as_str(),
        };

        tracing::trace!(target: METHOD_PATH,
                        pd_json_str,
                        "message payload json");

        let pd_all_dyn: serde_json::Value = match serde_json::from_str(pd_json_str) {
            Err(err) => {
                tracing::warn!(target: METHOD_PATH,
                               ?err, ?msg,
                               "error deserializing json as Value");
                return None;
            },
            Ok(pd) => pd,
        };
        let pd: PayloadDyn = match serde_json::from_str::<Payload<()>>(pd_json_str) {
            Err(err) => {
                tracing::warn!(target: METHOD_PATH,
                               ?err, ?msg,
                               "error deserializing json");
                return None;
            },
            Ok(pd_wrapper) => PayloadDyn {
                request_id: pd_wrapper.request_id,
                typ: pd_wrapper.typ,
                inner: pd_all_dyn,
            },
        };

        let pd_type = &pd.typ;

        let msg_is_broadcast = msg.destination.as_str() == ENDPOINT_BROADCAST;
        if msg_is_broadcast {
            tracing::debug!(target: METHOD_PATH,
                            ?msg, ?pd, pd_type,
                            "broadcast message");
        }

        // # Special message cases

        // Channel close
        if msg_ns == payload::connection::CHANNEL_NAMESPACE
            && pd.typ == payload::connection::MESSAGE_TYPE_CLOSE
        {
            tracing::warn!(target: METHOD_PATH,
                            ?msg, ?pd, pd_type,
                            "Connection closed message from destination.\n\n\
                             This may mean we were never connected to the destination \
                             or we sent an invalid request.");
            return None;
        }

        // Heartbeat ping from remote; reply with a pong.
        if msg_ns == payload::heartbeat::CHANNEL_NAMESPACE
            && pd.typ == payload::heartbeat::MESSAGE_TYPE_PING
        {
            self.handle_read_ping(msg.source).await;
            return None;
        }

        // Pong for one of our pings; nothing to correlate.
        if msg_ns == payload::heartbeat::CHANNEL_NAMESPACE
            && pd.typ == payload::heartbeat::MESSAGE_TYPE_PONG
        {
            return None;
        }

        // Receiver status from remote; try to publish update to listeners.
        if msg_ns == payload::receiver::CHANNEL_NAMESPACE
            && pd.typ == payload::receiver::MESSAGE_RESPONSE_TYPE_RECEIVER_STATUS
        {
            self.publish_receiver_status(&msg, &pd, msg_time);
        }

        // Media namespace status from remote; try to publish update to listeners.
        if msg_ns == payload::media::CHANNEL_NAMESPACE
            && pd.typ == payload::media::MESSAGE_RESPONSE_TYPE_MEDIA_STATUS
        {
            self.publish_media_status(&msg, &pd, msg_time);
        }

        let request_id = match pd.request_id {
            None => {
                if msg_is_broadcast {
                    return None;
                }

                tracing::warn!(target: METHOD_PATH,
                               ?msg, ?pd, pd_type,
                               "missing request_id in unicast message payload");
                return None;
            },
            Some(id) if id.is_broadcast() => {
                if !msg_is_broadcast {
                    tracing::warn!(target: METHOD_PATH,
                                   ?msg, ?pd, pd_type,
                                   "broadcast request_id in unicast message payload");
                }
                return None;
            },
            Some(id) => id,
        };

        let mut proj = self.as_mut().project();

        let Some(request_state) = proj.requests_map.remove(&request_id) else {
            tracing::warn!(target: METHOD_PATH,
                           %request_id, ?msg, ?pd, pd_type,
                           "missing request state");
            return None;
        };

        if proj.timeout_queue.as_mut().try_remove(&request_state.delay_key).is_none() {
            tracing::warn!(target: METHOD_PATH,
                           ?request_state,
                           ?msg, ?pd, pd_type,
                           "timeout_queue missing expected delay key");
        }

        let result: anyhow::Result<PayloadDyn> =
            if request_state.response_ns != msg_ns {
                Err(format_err!(
                    "{METHOD_PATH}: received reply message with unexpected namespace:\n\
                     _ request_id    = {request_id}\n\
                     _ expected_ns   = {expected_ns:?}\n\
                     _ msg_ns        = {msg_ns:?}\n\
                     _ pd_type       = {pd_type:?}",
                    expected_ns = request_state.response_ns))
            } else {
                Ok(pd)
            };

        Self::respond_rpc(request_state.result_sender, result);

        None
    }

    #[named]
    fn handle_rpc_timeout(mut self: Pin<&mut Self>, expired: DelayExpired<RequestId>) {
        const METHOD_PATH: &str = method_path!("Task");

        let deadline = expired.deadline();
        let delay_key = expired.key();
        let request_id = expired.get_ref();

        let proj = self.as_mut().project();

        let Some(request_state) = proj.requests_map.remove(request_id) else {
            tracing::error!(target: METHOD_PATH,
                            %request_id,
                            "missing request_state in requests_map");
            return;
        };

        assert_eq!(delay_key, request_state.delay_key);

        tracing::warn!(target: METHOD_PATH,
                       ?deadline,
                       %request_id,
                       ?request_state,
                       "rpc timeout");

        let err = format_err!("{METHOD_PATH}: RPC timeout\n\
                               _ request_id:    {request_id}\n\
                               _ deadline:      {deadline:?}\n\
                               _ request_state: {request_state:#?}");
        Self::respond_rpc(request_state.result_sender,
                          Err(err));
    }

    /// Sends our periodic keepalive ping.
    async fn handle_ping_tick(mut self: Pin<&mut Self>) {
        let source = self.as_mut().config().sender();
        let msg = match heartbeat_message(
            payload::heartbeat::MESSAGE_TYPE_PING,
            source,
            DEFAULT_RECEIVER_ID.to_string())
        {
            Ok(msg) => msg,
            Err(err) => {
                tracing::error!(?err, "ping payload serialisation error");
                return;
            },
        };

        self.send_logged(msg).await
    }

    #[named]
    async fn handle_read_ping(mut self: Pin<&mut Self>, destination: EndpointId) {
        let source = self.as_mut().config().sender();
        let msg = match heartbeat_message(
            payload::heartbeat::MESSAGE_TYPE_PONG,
            source,
            destination)
        {
            Ok(msg) => msg,
            Err(err) => {
                tracing::error!(target: method_path!("Task"),
                                ?err,
                                "pong payload serialisation error");
                return;
            },
        };

        self.send_logged(msg).await
    }

    fn respond_rpc(result_sender: TaskCmdResultSender,
                   result: anyhow::Result<PayloadDyn>)
    {
        Self::respond_generic(result_sender, result);
    }

    fn respond_send(result_sender: TaskCmdResultSender,
                    result: anyhow::Result<()>)
    {
        Self::respond_generic(result_sender, result);
    }

    fn respond_generic<R>(result_sender: TaskCmdResultSender,
                          result: anyhow::Result<R>)
    where R: Any + Debug + Send + Sync
    {
        let command_id = result_sender.command_id;
        let result_ok = result.is_ok();
        let result_variant = if result_ok { "Ok"  }
                             else         { "Err" };

        let boxed = result.map(|response| TaskResponseBox::new(response));

        match result_sender.result_tx.send(boxed) {
            Ok(()) =>
                tracing::trace!(
                    command_id,
                    result_variant,
                    "Task::respond: sent result ok"),
            Err(unsent) =>
                tracing::warn!(
                    command_id,
                    result_variant,
                    ?unsent,
                    "Task::respond: result channel dropped"),
        }
    }

    #[named]
    fn publish_receiver_status(&self,
                               msg: &CastMessage, pd: &PayloadDyn, msg_time: DateTime<Utc>)
    {
        let pd_typed: Payload<payload::receiver::GetStatusResponse> =
            match serde_json::from_value(pd.inner.clone()) {
                Ok(v) => v,
                Err(err) => {
                    tracing::error!(target: method_path!("Task"),
                                    ?pd, ?msg, ?err,
                                    "error deserialising typed receiver status payload");
                    return;
                }
            };

        let update = StatusUpdate {
            time: msg_time,
            msg: StatusMessage::Receiver(pd_typed.inner.0.status),
        };
        self.publish_status_update(update);
    }

    #[named]
    fn publish_media_status(&self,
                            msg: &CastMessage, pd: &PayloadDyn, msg_time: DateTime<Utc>)
    {
        let pd_typed: Payload<payload::media::Status> =
            match serde_json::from_value(pd.inner.clone()) {
                Ok(v) => v,
                Err(err) => {
                    tracing::error!(target: method_path!("Task"),
                                    ?pd, ?msg, ?err,
                                    "error deserialising typed media status payload");
                    return;
                }
            };

        apply_media_state(&self.shared.state_tx, &pd_typed.inner);

        let update = StatusUpdate {
            time: msg_time,
            msg: StatusMessage::Media(pd_typed.inner),
        };
        self.publish_status_update(update);
    }

    #[named]
    fn publish_status_update(&self, update: StatusUpdate) {
        const METHOD_PATH: &str = method_path!("Task");
        tracing::debug!(target: METHOD_PATH,
                        ?update,
                        "status update");

        // Ignore an error result, which just means no receivers are currently listening.
        if let Err(err) = self.shared.status_tx.send(update) {
            tracing::trace!(target: METHOD_PATH,
                            ?err,
                            "status send err");
        }
    }

    fn config(&self) -> &Config {
        &self.shared.config
    }
}

/// Advances the session state watch from a media status report.
fn apply_media_state(state_tx: &watch::Sender<SessionState>,
                     status: &payload::media::Status)
{
    use payload::media::{IdleReason, PlayerState};

    let Some(entry) = status.entries.first() else {
        return;
    };

    let next = match entry.player_state {
        PlayerState::Buffering | PlayerState::Loading => SessionState::Loading,
        PlayerState::Playing => SessionState::Playing,
        PlayerState::Paused => SessionState::Paused,
        PlayerState::Idle => match entry.idle_reason {
            Some(IdleReason::Finished) => SessionState::Ended,
            _ => SessionState::Connected,
        },
        PlayerState::Unknown => return,
    };

    state_tx.send_if_modified(|state| {
        if *state == next {
            return false;
        }

        // Terminal for the media lifecycle; later IDLE reports from the
        // receiver teardown must not resurrect the session.
        if *state == SessionState::Ended && next == SessionState::Connected {
            return false;
        }

        *state = next;
        true
    });
}

fn heartbeat_message(typ: MessageTypeConst, source: EndpointId, destination: EndpointId)
-> anyhow::Result<CastMessage>
{
    let pd = Payload::<payload::heartbeat::Ping> {
        request_id: None,
        typ: typ.into(),
        inner: payload::heartbeat::Ping {},
    };

    let pd_json = serde_json::to_string(&pd)?;

    Ok(CastMessage {
        namespace: payload::heartbeat::CHANNEL_NAMESPACE.into(),
        source, destination,
        payload: pd_json.into(),
    })
}

impl TaskResponseBox {
    pub fn new<R>(response: R) -> TaskResponseBox
    where R: Any + Send + Sync
    {
        TaskResponseBox {
            type_name: any::type_name::<R>(),
            value: Box::new(response) as Box<dyn Any + Send + Sync>,
        }
    }

    pub fn downcast<R>(self) -> anyhow::Result<Box<R>>
    where R: Any + Send + Sync
    {
        let TaskResponseBox { type_name, value } = self;

        value.downcast::<R>()
             .map_err(|_as_any| format_err!("Command response type didn't match expected\n\
                                            expected type: {expected:?}\n\
                                            type:          {ty:?}",
                                            expected = any::type_name::<R>(),
                                            ty       = type_name))
    }
}

const SIZE_OF_U32: usize = 4;

/// The cast protocol caps messages at 64 KiB. A length prefix beyond that
/// is garbage, not a large frame, so it must not drive buffer growth.
const MAX_MESSAGE_LEN: usize = 64 * 1024;

impl codec::Encoder<CastMessage> for CastMessageCodec {
    type Error = anyhow::Error;

    fn encode(
        &mut self,
        msg: CastMessage,
        dst: &mut BytesMut
    ) -> anyhow::Result<()>
    {
        use crate::cast::cast_channel::cast_message::{PayloadType, ProtocolVersion};

        let mut proto_msg = crate::cast::cast_channel::CastMessage::new();

        proto_msg.set_protocol_version(ProtocolVersion::CASTV2_1_0);

        proto_msg.set_namespace(msg.namespace);
        proto_msg.set_source_id(msg.source);
        proto_msg.set_destination_id(msg.destination);

        match msg.payload {
            CastMessagePayload::String(s) => {
                proto_msg.set_payload_type(PayloadType::STRING);
                proto_msg.set_payload_utf8(s);
            },

            CastMessagePayload::Binary(b) => {
                proto_msg.set_payload_type(PayloadType::BINARY);
                proto_msg.set_payload_binary(b);
            },
        };

        let proto_len: usize = proto_msg.compute_size().try_into()?;
        let proto_len_u32: u32 = proto_len.try_into()?;

        let total_len: usize = proto_len + SIZE_OF_U32;

        // Append only: earlier frames may still be queued for a flush.
        let start_len = dst.len();
        dst.reserve(total_len);

        // Length prefix is big endian.
        dst.put_u32(proto_len_u32);

        // Braces to limit the scope of writer.
        {
            let mut writer = dst.limit(proto_len)
                                .writer();
            proto_msg.write_to_writer(&mut writer)?;
        }

        assert_eq!(dst.len() - start_len, total_len);

        Ok(())
    }
}

impl codec::Decoder for CastMessageCodec {
    type Item = CastMessage;
    type Error = anyhow::Error;

    fn decode(
        &mut self,
        src: &mut BytesMut
    ) -> anyhow::Result<Option<CastMessage>>
    {
        if src.len() < SIZE_OF_U32 {
            return Ok(None);
        }

        let proto_len_bytes = <[u8; SIZE_OF_U32]>::try_from(&src[0..SIZE_OF_U32])
            .map_err(|_| format_err!("length prefix slice conversion"))?;
        let proto_len_u32: u32 = u32::from_be_bytes(proto_len_bytes);
        let proto_len = usize::try_from(proto_len_u32)?;

        if proto_len > MAX_MESSAGE_LEN {
            return Err(format_err!(
                "frame length {proto_len} exceeds maximum {MAX_MESSAGE_LEN}"));
        }

        let total_len: usize = proto_len + SIZE_OF_U32;

        let src_len = src.len();

        if src_len < total_len {
            src.reserve(total_len - src_len);
            return Ok(None);
        }

        let mut proto_msg: crate::cast::cast_channel::CastMessage = {
            // Braces to scope proto_bytes' borrow.
            let proto_bytes = &src[SIZE_OF_U32..total_len];
            assert_eq!(proto_bytes.len(), proto_len);

            crate::cast::cast_channel::CastMessage::parse_from_bytes(proto_bytes)?
        };

        src.advance(total_len);

        // A version value outside the generated enum means the device is
        // speaking a framing dialect we cannot trust ourselves to parse.
        if let Some(version) = proto_msg.protocol_version {
            if version.enum_value().is_err() {
                return Err(anyhow::Error::new(Error::ProtocolMismatch));
            }
        }

        use crate::cast::cast_channel::cast_message::PayloadType;

        let msg = CastMessage {
            namespace: proto_msg.take_namespace(),
            source: proto_msg.take_source_id(),
            destination: proto_msg.take_destination_id(),
            payload: match proto_msg.payload_type() {
                PayloadType::STRING =>
                    CastMessagePayload::String(proto_msg.take_payload_utf8()),
                PayloadType::BINARY =>
                    CastMessagePayload::Binary(proto_msg.take_payload_binary()),
            },
        };

        Ok(Some(msg))
    }
}

impl Config {
    fn sender(&self) -> EndpointId {
        self.sender.as_ref()
            .cloned()
            .unwrap_or_else(|| DEFAULT_SENDER_ID.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio_util::codec::{Decoder, Encoder};

    fn roundtrip(msg: CastMessage) -> CastMessage {
        let mut codec = CastMessageCodec;
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn codec_frames_string_payload() {
        let msg = roundtrip(CastMessage {
            namespace: payload::heartbeat::CHANNEL_NAMESPACE.to_string(),
            source: DEFAULT_SENDER_ID.to_string(),
            destination: DEFAULT_RECEIVER_ID.to_string(),
            payload: r#"{"type":"PING"}"#.to_string().into(),
        });

        assert_eq!(msg.namespace, payload::heartbeat::CHANNEL_NAMESPACE);
        assert_eq!(msg.source, DEFAULT_SENDER_ID);
        assert_eq!(msg.destination, DEFAULT_RECEIVER_ID);
        let CastMessagePayload::String(s) = msg.payload else {
            panic!("expected string payload");
        };
        assert_eq!(s, r#"{"type":"PING"}"#);
    }

    #[test]
    fn codec_length_prefix_is_big_endian() {
        let mut codec = CastMessageCodec;
        let mut buf = BytesMut::new();
        codec.encode(CastMessage {
            namespace: "ns".to_string(),
            source: "s".to_string(),
            destination: "d".to_string(),
            payload: "{}".to_string().into(),
        }, &mut buf).unwrap();

        let prefix = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!(prefix as usize, buf.len() - SIZE_OF_U32);
    }

    #[test]
    fn codec_incomplete_frame_returns_none() {
        let mut codec = CastMessageCodec;
        let mut buf = BytesMut::new();
        codec.encode(CastMessage {
            namespace: "ns".to_string(),
            source: "s".to_string(),
            destination: "d".to_string(),
            payload: "{}".to_string().into(),
        }, &mut buf).unwrap();

        let full = buf.clone();

        // Header only.
        let mut partial = BytesMut::from(&full[..SIZE_OF_U32]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        // Header plus truncated body.
        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    // The encoder appends to the buffer; a frame queued behind an
    // unflushed one must not be lost.
    #[test]
    fn codec_queues_multiple_frames_without_loss() {
        let mut codec = CastMessageCodec;
        let mut buf = BytesMut::new();

        for n in 1..=2 {
            codec.encode(CastMessage {
                namespace: "ns".to_string(),
                source: "s".to_string(),
                destination: "d".to_string(),
                payload: format!(r#"{{"n":{n}}}"#).into(),
            }, &mut buf).unwrap();
        }

        for n in 1..=2 {
            let msg = codec.decode(&mut buf).unwrap().unwrap();
            let CastMessagePayload::String(s) = msg.payload else {
                panic!("expected string payload");
            };
            assert_eq!(s, format!(r#"{{"n":{n}}}"#));
        }

        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn codec_rejects_oversized_length_prefix() {
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        buf.extend_from_slice(b"garbage");

        let mut codec = CastMessageCodec;
        assert!(codec.decode(&mut buf).is_err());
    }

    #[tokio::test]
    async fn media_stop_on_dead_channel_is_noop() {
        let (task_cmd_tx, task_cmd_rx) = mpsc::channel(1);
        drop(task_cmd_rx);

        let mut client = Client {
            task_join_handle: None,
            task_cmd_tx,
            request_id_gen: RequestIdGen::new(),
            next_command_id: AtomicUsize::new(1),
            shared: Arc::new(Shared {
                config: Config {
                    addr: "127.0.0.1:8009".parse().unwrap(),
                    sender: None,
                },
                status_tx: broadcast::Sender::new(STATUS_BROADCAST_CHANNEL_CAPACITY),
                state_tx: watch::Sender::new(SessionState::Disconnected),
                fatal: std::sync::Mutex::new(None),
            }),
        };

        let media_session = MediaSession {
            app_session: AppSession {
                app_destination_id: "transport-1".to_string(),
                receiver_destination_id: DEFAULT_RECEIVER_ID.to_string(),
                app_session_id: "S1".to_string(),
            },
            media_session_id: 1,
        };

        let res = client.media_stop(&media_session).await.unwrap();
        assert!(res.is_none());
    }

    fn media_status(player_state: payload::media::PlayerState,
                    idle_reason: Option<payload::media::IdleReason>)
    -> payload::media::Status
    {
        payload::media::Status {
            entries: vec![payload::media::StatusEntry {
                media_session_id: 1,
                media: None,
                playback_rate: 1.0,
                player_state,
                idle_reason,
                current_time: Some(0.0),
                supported_media_commands: 0,
            }],
        }
    }

    #[test]
    fn media_state_maps_player_states() {
        use payload::media::{IdleReason, PlayerState};

        let tx = watch::Sender::new(SessionState::Connected);

        apply_media_state(&tx, &media_status(PlayerState::Buffering, None));
        assert_eq!(*tx.borrow(), SessionState::Loading);

        apply_media_state(&tx, &media_status(PlayerState::Playing, None));
        assert_eq!(*tx.borrow(), SessionState::Playing);

        apply_media_state(&tx, &media_status(PlayerState::Paused, None));
        assert_eq!(*tx.borrow(), SessionState::Paused);

        apply_media_state(&tx, &media_status(PlayerState::Idle,
                                             Some(IdleReason::Finished)));
        assert_eq!(*tx.borrow(), SessionState::Ended);
    }

    #[test]
    fn ended_is_not_resurrected_by_receiver_teardown() {
        use payload::media::{IdleReason, PlayerState};

        let tx = watch::Sender::new(SessionState::Ended);

        apply_media_state(&tx, &media_status(PlayerState::Idle,
                                             Some(IdleReason::Cancelled)));
        assert_eq!(*tx.borrow(), SessionState::Ended);
    }

    // A rejected or aborted load reports IDLE without FINISHED; the
    // session drops back to Connected and stays usable.
    #[test]
    fn idle_without_finished_returns_to_connected() {
        use payload::media::{IdleReason, PlayerState};

        let tx = watch::Sender::new(SessionState::Loading);

        apply_media_state(&tx, &media_status(PlayerState::Idle,
                                             Some(IdleReason::Error)));
        assert_eq!(*tx.borrow(), SessionState::Connected);
    }

    #[test]
    fn unknown_player_state_leaves_session_state_alone() {
        use payload::media::PlayerState;

        let tx = watch::Sender::new(SessionState::Playing);

        apply_media_state(&tx, &media_status(PlayerState::Unknown, None));
        assert_eq!(*tx.borrow(), SessionState::Playing);

        apply_media_state(&tx, &payload::media::Status { entries: vec![] });
        assert_eq!(*tx.borrow(), SessionState::Playing);
    }

    #[test]
    fn codec_rejects_unknown_protocol_version() {
        use crate::cast::cast_channel::cast_message::PayloadType;

        let mut proto_msg = crate::cast::cast_channel::CastMessage::new();
        proto_msg.protocol_version = Some(protobuf::EnumOrUnknown::from_i32(99));
        proto_msg.set_namespace("ns".to_string());
        proto_msg.set_source_id("s".to_string());
        proto_msg.set_destination_id("d".to_string());
        proto_msg.set_payload_type(PayloadType::STRING);
        proto_msg.set_payload_utf8("{}".to_string());

        let body = Message::write_to_bytes(&proto_msg).unwrap();
        let mut buf = BytesMut::new();
        buf.put_u32(body.len() as u32);
        buf.extend_from_slice(&body);

        let mut codec = CastMessageCodec;
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(),
                         Some(Error::ProtocolMismatch)));
    }
}
