//! The control channel and its protocol state machine, plus the background
//!  task that receives media packets while a stream is playing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::RtspError;
use crate::frame::Frame;
use crate::frame_sink::FrameSink;
use crate::wire::{encode_request, Method, RtspResponse};

/// Upper bound for a single blocking receive on the datagram socket. The
///  receive task re-checks its stop signal at least this often even when the
///  server sends nothing.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

const RECV_BUFFER_LEN: usize = 0x10000;

/// Protocol state as seen by the client. Transitions happen only when the
///  server acknowledged the corresponding request with a success status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connected, no stream negotiated yet.
    Init,
    /// A stream is set up (session id assigned), not playing.
    Ready,
    Playing,
    Paused,
    /// The stream was torn down; a new SETUP starts over.
    TornDown,
}

/// The operations a consumer drives the control channel with. A seam so that
///  session logic can be exercised without a live server.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StreamSource: Send {
    async fn setup(&mut self, media_name: &str) -> Result<(), RtspError>;
    async fn play(&mut self) -> Result<(), RtspError>;
    async fn pause(&mut self) -> Result<(), RtspError>;
    async fn teardown(&mut self) -> Result<(), RtspError>;

    /// Release all network resources, tearing down a still-open stream on a
    ///  best-effort basis. Infallible and idempotent.
    async fn close(&mut self);
}

struct ReceiverHandle {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// One client connection: the TCP control channel, the UDP media socket bound
///  at SETUP, and the request sequencing both share.
pub struct RtspConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    sink: Arc<dyn FrameSink>,
    state: ConnectionState,
    cseq: u32,
    media_name: Option<String>,
    session_id: Option<String>,
    rtp_socket: Option<Arc<UdpSocket>>,
    receiver: Option<ReceiverHandle>,
}

impl RtspConnection {
    /// Open the control channel. Decoded media packets are handed to `sink`
    ///  from a background task once a stream is playing.
    pub async fn connect(
        sink: Arc<dyn FrameSink>,
        server: &str,
        port: u16,
    ) -> Result<RtspConnection, RtspError> {
        let stream = TcpStream::connect((server, port)).await?;
        let (read_half, write_half) = stream.into_split();
        info!("control channel connected to {}:{}", server, port);

        Ok(RtspConnection {
            reader: BufReader::new(read_half),
            writer: write_half,
            sink,
            state: ConnectionState::Init,
            cseq: 1,
            media_name: None,
            session_id: None,
            rtp_socket: None,
            receiver: None,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Send one request and read its response. The request counter advances
    ///  only once the server acknowledged with a success status, so a failed
    ///  exchange can be retried under the same number.
    async fn exchange(
        &mut self,
        method: Method,
        session_id: Option<String>,
        client_port: Option<u16>,
    ) -> Result<RtspResponse, RtspError> {
        let target = self
            .media_name
            .clone()
            .ok_or(RtspError::InvalidState("no stream is set up"))?;

        let request = encode_request(method, &target, self.cseq, session_id.as_deref(), client_port);
        debug!("sending {} cseq={}", method.as_wire(), self.cseq);
        self.writer.write_all(request.as_bytes()).await?;

        let response = RtspResponse::read_from(&mut self.reader).await?.ensure_ok()?;
        self.cseq += 1;
        Ok(response)
    }

    /// Send a request that requires a negotiated session.
    async fn exchange_in_session(&mut self, method: Method) -> Result<RtspResponse, RtspError> {
        let session_id = self
            .session_id
            .clone()
            .ok_or(RtspError::InvalidState("no stream is set up"))?;
        self.exchange(method, Some(session_id), None).await
    }

    fn has_live_receiver(&self) -> bool {
        self.receiver
            .as_ref()
            .map(|r| !r.handle.is_finished())
            .unwrap_or(false)
    }

    async fn stop_receiver(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            receiver.stop.send(true).ok();
            if let Err(e) = receiver.handle.await {
                warn!("receive task ended abnormally: {}", e);
            }
        }
    }
}

#[async_trait]
impl StreamSource for RtspConnection {
    /// Bind the media socket, negotiate the stream, store the session id the
    ///  server assigned. On any failure the socket is released again so the
    ///  connection stays usable for another attempt.
    async fn setup(&mut self, media_name: &str) -> Result<(), RtspError> {
        match self.state {
            ConnectionState::Playing | ConnectionState::Paused => {
                return Err(RtspError::InvalidState("a stream is already active"));
            }
            _ => {}
        }

        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        let local_port = socket.local_addr()?.port();
        self.media_name = Some(media_name.to_string());

        let result = self.exchange(Method::Setup, None, Some(local_port)).await;
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.media_name = None;
                return Err(e);
            }
        };

        let session_id = match response.header("session") {
            Some(id) => id.to_string(),
            None => {
                self.media_name = None;
                return Err(RtspError::Protocol {
                    code: response.code,
                    message: "SETUP response carries no session id".to_string(),
                });
            }
        };

        info!("stream {:?} set up, session {}", media_name, session_id);
        self.session_id = Some(session_id);
        self.rtp_socket = Some(socket);
        self.state = ConnectionState::Ready;
        Ok(())
    }

    /// Ask the server to (re)start sending, and make sure a receive task is
    ///  draining the media socket. PLAY is sent again after a pause or when
    ///  buffer occupancy drops, so an already-running task is kept as is.
    async fn play(&mut self) -> Result<(), RtspError> {
        self.exchange_in_session(Method::Play).await?;

        if !self.has_live_receiver() {
            let socket = self
                .rtp_socket
                .clone()
                .expect("session id implies a bound media socket");
            let (stop_sender, stop_receiver) = watch::channel(false);
            let sink = self.sink.clone();
            let handle = tokio::spawn(receive_loop(socket, stop_receiver, sink));
            self.receiver = Some(ReceiverHandle {
                stop: stop_sender,
                handle,
            });
        }

        self.state = ConnectionState::Playing;
        Ok(())
    }

    /// Ask the server to stop sending and join the receive task. Once this
    ///  returns, no further sink callbacks happen until the next PLAY.
    async fn pause(&mut self) -> Result<(), RtspError> {
        self.exchange_in_session(Method::Pause).await?;
        self.stop_receiver().await;
        self.state = ConnectionState::Paused;
        Ok(())
    }

    /// End the stream. The session id and media socket are released; the
    ///  control channel itself stays open for a new SETUP.
    async fn teardown(&mut self) -> Result<(), RtspError> {
        self.exchange_in_session(Method::Teardown).await?;
        self.stop_receiver().await;
        self.rtp_socket = None;
        self.session_id = None;
        self.media_name = None;
        self.state = ConnectionState::TornDown;
        Ok(())
    }

    async fn close(&mut self) {
        if self.session_id.is_some() {
            if let Err(e) = self.teardown().await {
                warn!("teardown on close failed: {}", e);
            }
        }
        self.stop_receiver().await;
        if let Err(e) = self.writer.shutdown().await {
            debug!("control channel shutdown: {}", e);
        }
        self.rtp_socket = None;
        self.session_id = None;
    }
}

/// Drain the media socket, decoding datagrams and handing them to the sink.
///  Runs until told to stop, until the socket fails, or until the
///  end-of-stream sentinel arrives. Undecodable datagrams are dropped.
async fn receive_loop(
    socket: Arc<UdpSocket>,
    mut stop: watch::Receiver<bool>,
    sink: Arc<dyn FrameSink>,
) {
    debug!("receive task started on {:?}", socket.local_addr());
    let mut buf = vec![0u8; RECV_BUFFER_LEN];

    loop {
        select! {
            _ = stop.changed() => {
                debug!("receive task stopped");
                return;
            }
            recv_result = timeout(RECV_TIMEOUT, socket.recv_from(&mut buf)) => {
                let (len, _from) = match recv_result {
                    Err(_) => continue,
                    Ok(Err(e)) => {
                        warn!("media socket error, stopping receive task: {}", e);
                        return;
                    }
                    Ok(Ok(received)) => received,
                };

                let frame = match Frame::parse(&buf[..len]) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("dropping undecodable media packet: {}", e);
                        continue;
                    }
                };

                if frame.is_end_of_stream() {
                    debug!("end of stream at seq {}", frame.sequence_number());
                    sink.on_stream_ended(frame.sequence_number()).await;
                    return;
                }
                sink.on_frame(frame).await;
            }
        }
    }
}
