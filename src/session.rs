//! Playback session: the reorder buffer, the buffering thresholds and the
//!  fixed-rate playback scheduler, and the listener notifications driven by
//!  them.
//!
//! All state lives in an actor task. User commands, decoded frames from the
//!  receive task and render ticks are funneled through one event queue, so a
//!  frame arriving while a command is in flight can never observe (or corrupt)
//!  half-updated state. The public [Session] handle is a thin sender onto that
//!  queue.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::select;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::connection::{RtspConnection, StreamSource};
use crate::error::RtspError;
use crate::frame::Frame;
use crate::frame_sink::FrameSink;

/// Stop asking the server for more frames once this many are buffered.
pub const MAX_BUFFER_SIZE: usize = 100;
/// Ask the server for more frames again once the buffer falls below this.
pub const RESUME_THRESHOLD: usize = 80;
/// Frames that must be buffered before playback starts (unless the stream
///  already ended, in which case whatever is buffered is played out).
pub const MIN_PLAYBACK_THRESHOLD: usize = 50;
/// One frame per tick, i.e. 25 frames per second.
pub const PLAYBACK_INTERVAL: Duration = Duration::from_millis(40);

/// Observer for everything a session reports back to its user: played frames,
///  stream lifecycle and errors. Callbacks run on the session's actor task.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionListener: Send + Sync {
    /// A different stream is active now (or none, after a close).
    async fn video_name_changed(&self, name: Option<String>);

    /// The next frame is due for display.
    async fn frame_received(&self, frame: Frame);

    /// The stream ended and all buffered frames have been played.
    async fn video_ended(&self);

    async fn error_occurred(&self, error: Arc<RtspError>);
}

enum SessionEvent {
    Open(String),
    Play,
    Pause,
    Close,
    CloseConnection,
    AddListener(Arc<dyn SessionListener>),
    RemoveListener(Arc<dyn SessionListener>),
    FrameReceived(Frame),
    StreamEnded(u16),
}

/// Handle to a running session. All methods are fire-and-forget: they enqueue
///  a command for the actor task, and outcomes are reported through the
///  registered [SessionListener]s rather than as return values.
pub struct Session {
    events: UnboundedSender<SessionEvent>,
    actor: JoinHandle<()>,
}

impl Session {
    /// Connect to a server and start the session's actor task. Connecting is
    ///  the only operation that reports failure directly; everything after
    ///  goes through listeners.
    pub async fn connect(server: &str, port: u16) -> Result<Session, RtspError> {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        let sink = Arc::new(EventSender {
            events: sender.clone(),
        });
        let connection = RtspConnection::connect(sink, server, port).await?;
        let actor = tokio::spawn(SessionActor::new(connection).run(receiver));
        Ok(Session {
            events: sender,
            actor,
        })
    }

    /// Set up the given stream and start prefetching its frames. Playback
    ///  does not start until [Session::play].
    pub fn open(&self, video_name: &str) {
        self.send(SessionEvent::Open(video_name.to_string()));
    }

    pub fn play(&self) {
        self.send(SessionEvent::Play);
    }

    pub fn pause(&self) {
        self.send(SessionEvent::Pause);
    }

    /// Tear down the current stream. The connection stays usable for another
    ///  [Session::open].
    pub fn close(&self) {
        self.send(SessionEvent::Close);
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.send(SessionEvent::AddListener(listener));
    }

    pub fn remove_listener(&self, listener: Arc<dyn SessionListener>) {
        self.send(SessionEvent::RemoveListener(listener));
    }

    /// Shut the session down for good, tearing down a still-open stream on a
    ///  best-effort basis, and wait for the actor task to finish.
    pub async fn close_connection(self) {
        self.send(SessionEvent::CloseConnection);
        if let Err(e) = self.actor.await {
            warn!("session task ended abnormally: {}", e);
        }
    }

    fn send(&self, event: SessionEvent) {
        // a send error means the actor is gone; nothing left to notify
        self.events.send(event).ok();
    }
}

/// Adapter feeding the receive task's callbacks into the session's event
///  queue. This is what keeps the receive task from ever blocking on session
///  state.
struct EventSender {
    events: UnboundedSender<SessionEvent>,
}

#[async_trait]
impl FrameSink for EventSender {
    async fn on_frame(&self, frame: Frame) {
        self.events.send(SessionEvent::FrameReceived(frame)).ok();
    }

    async fn on_stream_ended(&self, sequence_number: u16) {
        self.events.send(SessionEvent::StreamEnded(sequence_number)).ok();
    }
}

struct SessionActor<C: StreamSource> {
    connection: C,
    listeners: Vec<Arc<dyn SessionListener>>,
    video_name: Option<String>,
    /// Received frames not yet played, keyed (and iterated) by sequence number.
    buffer: BTreeMap<u16, Frame>,
    last_frame_played: Option<u16>,
    is_playing: bool,
    user_requested_play: bool,
    video_has_ended: bool,
}

impl<C: StreamSource> SessionActor<C> {
    fn new(connection: C) -> SessionActor<C> {
        SessionActor {
            connection,
            listeners: vec![],
            video_name: None,
            buffer: BTreeMap::new(),
            last_frame_played: None,
            is_playing: false,
            user_requested_play: false,
            video_has_ended: false,
        }
    }

    async fn run(mut self, mut events: UnboundedReceiver<SessionEvent>) {
        let mut render_timer: Option<Interval> = None;

        loop {
            select! {
                event = events.recv() => {
                    match event {
                        None | Some(SessionEvent::CloseConnection) => break,
                        Some(event) => self.handle_event(event).await,
                    }
                }
                _ = async { render_timer.as_mut().expect("armed only while playing").tick().await },
                        if render_timer.is_some() => {
                    self.play_next_frame().await;
                }
            }

            // reconcile the timer with the playback state the handler left behind
            if self.is_playing && render_timer.is_none() {
                let mut timer = interval(PLAYBACK_INTERVAL);
                timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                render_timer = Some(timer);
            }
            if !self.is_playing {
                render_timer = None;
            }
        }

        self.is_playing = false;
        self.connection.close().await;
        debug!("session task finished");
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Open(video_name) => self.open(video_name).await,
            SessionEvent::Play => self.play().await,
            SessionEvent::Pause => self.pause(),
            SessionEvent::Close => self.close().await,
            SessionEvent::AddListener(listener) => self.add_listener(listener).await,
            SessionEvent::RemoveListener(listener) => {
                self.listeners.retain(|l| !Arc::ptr_eq(l, &listener));
            }
            SessionEvent::FrameReceived(frame) => self.process_received_frame(frame).await,
            SessionEvent::StreamEnded(sequence_number) => self.video_ended(sequence_number).await,
            SessionEvent::CloseConnection => {} // handled by the run loop
        }
    }

    async fn open(&mut self, video_name: String) {
        self.is_playing = false;
        self.user_requested_play = false;
        self.video_has_ended = false;
        self.buffer.clear();
        self.last_frame_played = None;

        match self.do_open(&video_name).await {
            Ok(()) => self.notify_name_changed().await,
            Err(e) => self.notify_error(e).await,
        }
    }

    async fn do_open(&mut self, video_name: &str) -> Result<(), RtspError> {
        self.connection.setup(video_name).await?;
        self.video_name = Some(video_name.to_string());

        // start fetching right away so frames are buffered before the user
        // asks for playback
        self.connection.play().await?;
        Ok(())
    }

    async fn play(&mut self) {
        self.user_requested_play = true;

        // nothing buffered yet: make sure frames are coming, playback starts
        // once enough of them arrived
        if self.buffer.is_empty() && !self.video_has_ended {
            if let Err(e) = self.connection.play().await {
                self.notify_error(e).await;
            }
            return;
        }

        if self.start_condition_holds() && !self.is_playing {
            self.is_playing = true;
        }

        if self.buffer.len() < RESUME_THRESHOLD && !self.video_has_ended {
            if let Err(e) = self.connection.play().await {
                self.notify_error(e).await;
            }
        }
    }

    /// Stops playback but not the frame fetch: the buffer keeps filling (up
    ///  to its size cap) so a later play resumes without re-buffering.
    fn pause(&mut self) {
        self.user_requested_play = false;
        self.is_playing = false;
    }

    async fn close(&mut self) {
        self.is_playing = false;
        self.user_requested_play = false;
        self.video_has_ended = false;

        if let Err(e) = self.connection.teardown().await {
            self.notify_error(e).await;
            return;
        }

        self.buffer.clear();
        self.last_frame_played = None;
        self.video_name = None;
        self.notify_name_changed().await;
    }

    async fn add_listener(&mut self, listener: Arc<dyn SessionListener>) {
        listener.video_name_changed(self.video_name.clone()).await;
        self.listeners.push(listener);
    }

    async fn process_received_frame(&mut self, frame: Frame) {
        let sequence_number = frame.sequence_number();
        if self
            .last_frame_played
            .is_some_and(|last| sequence_number <= last)
        {
            debug!("dropping late frame {}", sequence_number);
        }
        else {
            self.buffer.insert(sequence_number, frame);
        }

        let result = self.apply_flow_control().await;
        if let Err(e) = result {
            self.notify_error(e).await;
            return;
        }

        if self.user_requested_play && !self.is_playing && self.start_condition_holds() {
            self.is_playing = true;
        }
    }

    /// Feed buffer occupancy back to the server: stop the fetch at the cap,
    ///  resume it below the low-water mark.
    async fn apply_flow_control(&mut self) -> Result<(), RtspError> {
        if self.buffer.len() >= MAX_BUFFER_SIZE {
            self.connection.pause().await?;
        }
        else if self.buffer.len() < RESUME_THRESHOLD && !self.video_has_ended {
            self.connection.play().await?;
        }
        Ok(())
    }

    async fn video_ended(&mut self, sequence_number: u16) {
        debug!("stream ended at seq {}", sequence_number);
        self.video_has_ended = true;

        if self.buffer.is_empty() {
            self.notify_video_ended().await;
        }
        else if self.user_requested_play && !self.is_playing {
            // play out what is buffered even if below the start threshold
            self.is_playing = true;
        }
    }

    fn start_condition_holds(&self) -> bool {
        self.buffer.len() >= MIN_PLAYBACK_THRESHOLD
            || (self.video_has_ended && !self.buffer.is_empty())
    }

    /// One render tick: release the frame whose playback slot this is, or let
    ///  the slot pass if that frame never arrived.
    async fn play_next_frame(&mut self) {
        if self.buffer.is_empty() {
            self.is_playing = false;

            if self.video_has_ended {
                self.notify_video_ended().await;
            }
            else if let Err(e) = self.connection.play().await {
                self.notify_error(e).await;
            }
            return;
        }

        let expected = self.last_frame_played.map_or(0, |last| last.wrapping_add(1));

        if let Some(frame) = self.buffer.remove(&expected) {
            self.last_frame_played = Some(expected);
            self.deliver_frame(frame).await;
        }
        else {
            let first = *self
                .buffer
                .keys()
                .next()
                .expect("buffer checked non-empty above");
            if first > expected {
                // the frame for this slot never arrived; let the slot pass
                self.last_frame_played = Some(expected);
            }
            else {
                // stale frames are filtered on arrival, so this is unexpected
                warn!("frame {} buffered behind playback position {}", first, expected);
                let frame = self
                    .buffer
                    .remove(&first)
                    .expect("first key is present");
                self.last_frame_played = Some(first);
                self.deliver_frame(frame).await;
            }
        }

        if self.buffer.len() < RESUME_THRESHOLD && !self.video_has_ended {
            if let Err(e) = self.connection.play().await {
                self.notify_error(e).await;
            }
        }
    }

    async fn deliver_frame(&self, frame: Frame) {
        for listener in &self.listeners {
            listener.frame_received(frame.clone()).await;
        }
    }

    async fn notify_name_changed(&self) {
        for listener in &self.listeners {
            listener.video_name_changed(self.video_name.clone()).await;
        }
    }

    async fn notify_video_ended(&self) {
        for listener in &self.listeners {
            listener.video_ended().await;
        }
    }

    async fn notify_error(&self, error: RtspError) {
        warn!("reporting error to listeners: {}", error);
        let error = Arc::new(error);
        for listener in &self.listeners {
            listener.error_occurred(error.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;
    use rstest::rstest;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, UdpSocket};
    use tokio::time::sleep;

    use crate::connection::MockStreamSource;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum ListenerEvent {
        NameChanged(Option<String>),
        Frame(u16),
        Ended,
        Error(String),
    }

    struct CollectingListener {
        events: Mutex<Vec<ListenerEvent>>,
    }

    impl CollectingListener {
        fn new() -> Arc<CollectingListener> {
            Arc::new(CollectingListener {
                events: Mutex::new(vec![]),
            })
        }

        fn events(&self) -> Vec<ListenerEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SessionListener for CollectingListener {
        async fn video_name_changed(&self, name: Option<String>) {
            self.events
                .lock()
                .unwrap()
                .push(ListenerEvent::NameChanged(name));
        }

        async fn frame_received(&self, frame: Frame) {
            self.events
                .lock()
                .unwrap()
                .push(ListenerEvent::Frame(frame.sequence_number()));
        }

        async fn video_ended(&self) {
            self.events.lock().unwrap().push(ListenerEvent::Ended);
        }

        async fn error_occurred(&self, error: Arc<RtspError>) {
            self.events
                .lock()
                .unwrap()
                .push(ListenerEvent::Error(error.to_string()));
        }
    }

    fn frame(seq: u16) -> Frame {
        Frame::new(26, false, seq, 100, Bytes::from_static(b"abc"))
    }

    fn actor_with_listener(
        connection: MockStreamSource,
    ) -> (SessionActor<MockStreamSource>, Arc<CollectingListener>) {
        let mut actor = SessionActor::new(connection);
        let listener = CollectingListener::new();
        actor.listeners.push(listener.clone());
        (actor, listener)
    }

    #[tokio::test]
    async fn test_open_success() {
        let mut connection = MockStreamSource::new();
        connection
            .expect_setup()
            .withf(|name| name == "movie.mjpeg")
            .times(1)
            .returning(|_| Ok(()));
        connection.expect_play().times(1).returning(|| Ok(()));

        let (mut actor, listener) = actor_with_listener(connection);
        actor.open("movie.mjpeg".to_string()).await;

        assert_eq!(actor.video_name.as_deref(), Some("movie.mjpeg"));
        assert_eq!(
            listener.events(),
            vec![ListenerEvent::NameChanged(Some("movie.mjpeg".to_string()))]
        );
    }

    #[tokio::test]
    async fn test_open_setup_fails() {
        let mut connection = MockStreamSource::new();
        connection.expect_setup().times(1).returning(|_| {
            Err(RtspError::Protocol {
                code: 404,
                message: "Not Found".to_string(),
            })
        });

        let (mut actor, listener) = actor_with_listener(connection);
        actor.open("no-such-movie".to_string()).await;

        assert_eq!(actor.video_name, None);
        assert_eq!(
            listener.events(),
            vec![ListenerEvent::Error(
                "server replied 404 Not Found".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_open_resets_previous_stream_state() {
        let mut connection = MockStreamSource::new();
        connection.expect_setup().returning(|_| Ok(()));
        connection.expect_play().returning(|| Ok(()));

        let (mut actor, _listener) = actor_with_listener(connection);
        actor.buffer.insert(7, frame(7));
        actor.last_frame_played = Some(7);
        actor.is_playing = true;
        actor.user_requested_play = true;
        actor.video_has_ended = true;

        actor.open("other.mjpeg".to_string()).await;

        assert!(actor.buffer.is_empty());
        assert_eq!(actor.last_frame_played, None);
        assert!(!actor.is_playing);
        assert!(!actor.user_requested_play);
        assert!(!actor.video_has_ended);
    }

    #[tokio::test]
    async fn test_play_with_empty_buffer_requests_frames_only() {
        let mut connection = MockStreamSource::new();
        connection.expect_play().times(1).returning(|| Ok(()));

        let (mut actor, _listener) = actor_with_listener(connection);
        actor.play().await;

        assert!(actor.user_requested_play);
        assert!(!actor.is_playing);
    }

    #[rstest]
    #[case::below_threshold(49, false, false)]
    #[case::at_threshold(50, false, true)]
    #[case::ended_with_few_frames(3, true, true)]
    #[tokio::test]
    async fn test_play_start_condition(
        #[case] buffered: usize,
        #[case] ended: bool,
        #[case] expect_playing: bool,
    ) {
        let mut connection = MockStreamSource::new();
        if !ended {
            connection.expect_play().returning(|| Ok(()));
        }

        let (mut actor, _listener) = actor_with_listener(connection);
        for i in 0..buffered {
            actor.buffer.insert(i as u16, frame(i as u16));
        }
        actor.video_has_ended = ended;

        actor.play().await;

        assert!(actor.user_requested_play);
        assert_eq!(actor.is_playing, expect_playing);
    }

    #[tokio::test]
    async fn test_pause_keeps_fetching() {
        // no expectations: any control channel request fails the test
        let connection = MockStreamSource::new();

        let (mut actor, _listener) = actor_with_listener(connection);
        actor.is_playing = true;
        actor.user_requested_play = true;

        actor.pause();

        assert!(!actor.is_playing);
        assert!(!actor.user_requested_play);
    }

    #[rstest]
    #[case::reaches_cap(99, false, true, false)]
    #[case::below_low_water(10, false, false, true)]
    #[case::between_marks(85, false, false, false)]
    #[case::ended_no_resume(10, true, false, false)]
    #[tokio::test]
    async fn test_flow_control_on_frame_arrival(
        #[case] buffered: usize,
        #[case] ended: bool,
        #[case] expect_pause: bool,
        #[case] expect_play: bool,
    ) {
        let mut connection = MockStreamSource::new();
        connection
            .expect_pause()
            .times(usize::from(expect_pause))
            .returning(|| Ok(()));
        connection
            .expect_play()
            .times(usize::from(expect_play))
            .returning(|| Ok(()));

        let (mut actor, _listener) = actor_with_listener(connection);
        for i in 0..buffered {
            actor.buffer.insert(i as u16, frame(i as u16));
        }
        actor.video_has_ended = ended;

        actor.process_received_frame(frame(200)).await;

        assert_eq!(actor.buffer.len(), buffered + 1);
    }

    #[tokio::test]
    async fn test_stale_frames_are_dropped() {
        let mut connection = MockStreamSource::new();
        connection.expect_play().returning(|| Ok(()));

        let (mut actor, _listener) = actor_with_listener(connection);
        actor.last_frame_played = Some(10);

        actor.process_received_frame(frame(5)).await;
        actor.process_received_frame(frame(10)).await;
        actor.process_received_frame(frame(11)).await;

        assert_eq!(actor.buffer.keys().copied().collect::<Vec<_>>(), vec![11]);
    }

    #[tokio::test]
    async fn test_frame_arrival_starts_playback_once_threshold_reached() {
        let mut connection = MockStreamSource::new();
        connection.expect_play().returning(|| Ok(()));

        let (mut actor, _listener) = actor_with_listener(connection);
        actor.user_requested_play = true;
        for i in 0..MIN_PLAYBACK_THRESHOLD - 1 {
            actor.buffer.insert(i as u16, frame(i as u16));
        }
        assert!(!actor.is_playing);

        actor.process_received_frame(frame(1000)).await;

        assert!(actor.is_playing);
    }

    #[tokio::test]
    async fn test_render_ticks_deliver_in_order_and_skip_gaps() {
        let mut connection = MockStreamSource::new();
        connection.expect_play().returning(|| Ok(()));

        let (mut actor, listener) = actor_with_listener(connection);
        actor.is_playing = true;
        actor.last_frame_played = Some(9);
        actor.buffer.insert(12, frame(12));
        actor.buffer.insert(13, frame(13));

        actor.play_next_frame().await; // slot 10 passes silently
        actor.play_next_frame().await; // slot 11 passes silently
        actor.play_next_frame().await;
        actor.play_next_frame().await;

        assert_eq!(
            listener.events(),
            vec![ListenerEvent::Frame(12), ListenerEvent::Frame(13)]
        );
        assert_eq!(actor.last_frame_played, Some(13));
        assert!(actor.buffer.is_empty());
        assert!(actor.is_playing);
    }

    #[tokio::test]
    async fn test_render_tick_plays_oldest_frame_behind_playback_position() {
        let mut connection = MockStreamSource::new();
        connection.expect_play().returning(|| Ok(()));

        let (mut actor, listener) = actor_with_listener(connection);
        actor.is_playing = true;
        actor.last_frame_played = Some(20);
        actor.buffer.insert(18, frame(18));

        actor.play_next_frame().await;

        assert_eq!(listener.events(), vec![ListenerEvent::Frame(18)]);
        assert_eq!(actor.last_frame_played, Some(18));
    }

    #[tokio::test]
    async fn test_render_tick_on_empty_buffer_after_end_of_stream() {
        let connection = MockStreamSource::new();

        let (mut actor, listener) = actor_with_listener(connection);
        actor.is_playing = true;
        actor.video_has_ended = true;

        actor.play_next_frame().await;

        assert!(!actor.is_playing);
        assert_eq!(listener.events(), vec![ListenerEvent::Ended]);
    }

    #[tokio::test]
    async fn test_render_tick_on_empty_buffer_requests_more_frames() {
        let mut connection = MockStreamSource::new();
        connection.expect_play().times(1).returning(|| Ok(()));

        let (mut actor, listener) = actor_with_listener(connection);
        actor.is_playing = true;

        actor.play_next_frame().await;

        assert!(!actor.is_playing);
        assert_eq!(listener.events(), vec![]);
    }

    #[tokio::test]
    async fn test_video_ended_with_empty_buffer_notifies_immediately() {
        let connection = MockStreamSource::new();

        let (mut actor, listener) = actor_with_listener(connection);
        actor.video_ended(17).await;

        assert!(actor.video_has_ended);
        assert_eq!(listener.events(), vec![ListenerEvent::Ended]);
    }

    #[tokio::test]
    async fn test_video_ended_with_buffered_frames_plays_them_out() {
        let connection = MockStreamSource::new();

        let (mut actor, listener) = actor_with_listener(connection);
        actor.user_requested_play = true;
        actor.buffer.insert(0, frame(0));

        actor.video_ended(17).await;

        // already below the start threshold, the remaining frames still play
        assert!(actor.is_playing);
        assert_eq!(listener.events(), vec![]);
    }

    #[tokio::test]
    async fn test_close_success() {
        let mut connection = MockStreamSource::new();
        connection.expect_teardown().times(1).returning(|| Ok(()));

        let (mut actor, listener) = actor_with_listener(connection);
        actor.video_name = Some("movie.mjpeg".to_string());
        actor.buffer.insert(3, frame(3));
        actor.last_frame_played = Some(2);
        actor.is_playing = true;

        actor.close().await;

        assert!(actor.buffer.is_empty());
        assert_eq!(actor.last_frame_played, None);
        assert_eq!(actor.video_name, None);
        assert!(!actor.is_playing);
        assert_eq!(listener.events(), vec![ListenerEvent::NameChanged(None)]);
    }

    #[tokio::test]
    async fn test_close_teardown_fails() {
        let mut connection = MockStreamSource::new();
        connection.expect_teardown().times(1).returning(|| {
            Err(RtspError::Protocol {
                code: 455,
                message: "Method Not Valid in This State".to_string(),
            })
        });

        let (mut actor, listener) = actor_with_listener(connection);
        actor.video_name = Some("movie.mjpeg".to_string());
        actor.buffer.insert(3, frame(3));

        actor.close().await;

        // the teardown never took effect, so the stream state is kept
        assert_eq!(actor.video_name.as_deref(), Some("movie.mjpeg"));
        assert_eq!(actor.buffer.len(), 1);
        assert_eq!(
            listener.events(),
            vec![ListenerEvent::Error(
                "server replied 455 Method Not Valid in This State".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_add_listener_reports_current_name() {
        let connection = MockStreamSource::new();
        let mut actor = SessionActor::new(connection);
        actor.video_name = Some("movie.mjpeg".to_string());

        let listener = CollectingListener::new();
        actor.add_listener(listener.clone()).await;

        assert_eq!(
            listener.events(),
            vec![ListenerEvent::NameChanged(Some("movie.mjpeg".to_string()))]
        );
    }

    #[tokio::test]
    async fn test_remove_listener_stops_notifications() {
        let connection = MockStreamSource::new();
        let (mut actor, listener) = actor_with_listener(connection);

        actor
            .handle_event(SessionEvent::RemoveListener(listener.clone()))
            .await;
        actor.notify_video_ended().await;

        assert_eq!(listener.events(), vec![]);
    }

    fn rtp_packet(seq: u16, payload: &[u8]) -> Vec<u8> {
        let mut data = vec![0x80, 0x1a];
        data.extend_from_slice(&seq.to_be_bytes());
        data.extend_from_slice(&100u32.to_be_bytes());
        data.extend_from_slice(&[0, 0, 0, 0]);
        data.extend_from_slice(payload);
        data
    }

    /// A single-connection server that streams the given frames (followed by
    ///  the end-of-stream sentinel) after the first PLAY.
    async fn media_server(frames: Vec<u16>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let mut client_port: Option<u16> = None;
            let mut frames_sent = false;

            loop {
                let mut method = String::new();
                let mut cseq = String::new();
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).await.unwrap() == 0 {
                        return;
                    }
                    let line = line.trim_end();
                    if line.is_empty() {
                        break;
                    }
                    if method.is_empty() {
                        method = line.split(' ').next().unwrap().to_string();
                    }
                    if let Some(value) = line.strip_prefix("CSeq:") {
                        cseq = value.trim().to_string();
                    }
                    if let Some(value) = line.strip_prefix("Transport:") {
                        client_port = Some(value.rsplit('=').next().unwrap().trim().parse().unwrap());
                    }
                }

                let response = if method == "SETUP" {
                    format!("RTSP/1.0 200 OK\r\nCSeq: {}\r\nSession: 123456\r\n\r\n", cseq)
                }
                else {
                    format!("RTSP/1.0 200 OK\r\nCSeq: {}\r\n\r\n", cseq)
                };
                write_half.write_all(response.as_bytes()).await.unwrap();

                match method.as_str() {
                    "TEARDOWN" => return,
                    "PLAY" if !frames_sent => {
                        frames_sent = true;
                        let target =
                            std::net::SocketAddr::new(peer.ip(), client_port.unwrap());
                        for seq in &frames {
                            udp.send_to(&rtp_packet(*seq, b"abc"), target).await.unwrap();
                        }
                        udp.send_to(&rtp_packet(frames.len() as u16, b""), target)
                            .await
                            .unwrap();
                    }
                    _ => {}
                }
            }
        });

        port
    }

    #[tokio::test]
    async fn test_end_to_end_short_stream_playback() {
        let port = media_server(vec![0, 1, 2, 3, 4]).await;

        let session = Session::connect("127.0.0.1", port).await.unwrap();
        let listener = CollectingListener::new();
        session.add_listener(listener.clone());

        session.open("movie.mjpeg");
        sleep(Duration::from_millis(300)).await;

        session.play();
        sleep(Duration::from_millis(500)).await;

        let events = listener.events();
        let played: Vec<u16> = events
            .iter()
            .filter_map(|e| match e {
                ListenerEvent::Frame(seq) => Some(*seq),
                _ => None,
            })
            .collect();
        assert_eq!(played, vec![0, 1, 2, 3, 4]);

        let last_frame_pos = events
            .iter()
            .rposition(|e| matches!(e, ListenerEvent::Frame(_)))
            .unwrap();
        let ended_pos = events.iter().position(|e| *e == ListenerEvent::Ended).unwrap();
        assert!(ended_pos > last_frame_pos);

        assert!(events.contains(&ListenerEvent::NameChanged(Some("movie.mjpeg".to_string()))));
        assert!(!events.iter().any(|e| matches!(e, ListenerEvent::Error(_))));

        session.close_connection().await;
    }
}
