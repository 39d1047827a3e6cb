use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use parking_lot::{Mutex, ReentrantMutex};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::frame_decoder::FrameDecoder;

/// Typed event decoded from the chat stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Token(String),
    ToolCall(String),
    Error(String),
    Done,
}

/// Reasons an exchange ends without completing. The display text is what the
/// consumer sees in the terminal `Error` event.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Server error: {0}")]
    Status(u16),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
}

/// Body of a chat request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatRequest {
    pub message: String,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Cancellation handle for one stream. Cheap to clone; every clone controls
/// the same stream.
#[derive(Clone, Debug, Default)]
pub struct StreamHandle {
    aborted: Arc<AtomicBool>,
    task: Arc<Mutex<Option<AbortHandle>>>,
    // Held while a callback runs; reentrant so a callback may abort its own stream.
    dispatch: Arc<ReentrantMutex<()>>,
}

impl StreamHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop observing the response and suppress every later event. Idempotent.
    ///
    /// Waits for a callback that is already running, so none fires once this
    /// returns.
    pub fn abort(&self) {
        let _gate = self.dispatch.lock();
        if self.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        debug!("Stream aborted");
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Tie the network task to this handle so `abort` also stops it.
    pub fn attach(&self, task: AbortHandle) {
        if self.is_aborted() {
            task.abort();
            return;
        }
        *self.task.lock() = Some(task);
    }
}

/// Producer side of an event channel.
pub struct StreamSink {
    tx: mpsc::UnboundedSender<StreamEvent>,
    handle: StreamHandle,
}

impl StreamSink {
    /// Deliver an event. Returns false once the stream is aborted or nobody
    /// is listening.
    pub fn send(&self, event: StreamEvent) -> bool {
        if self.handle.is_aborted() {
            return false;
        }
        self.tx.send(event).is_ok()
    }

    pub fn is_aborted(&self) -> bool {
        self.handle.is_aborted()
    }

    pub fn handle(&self) -> StreamHandle {
        self.handle.clone()
    }
}

/// Consumer side: a lazy, finite, non-restartable sequence of events.
///
/// Ends after `Done`, after a transport failure (`Error` without `Done`), or
/// as soon as the stream is aborted, even if events are still queued.
pub struct StreamEvents {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    handle: StreamHandle,
}

impl StreamEvents {
    pub fn handle(&self) -> StreamHandle {
        self.handle.clone()
    }

    /// Feed every event to `callbacks` until the stream ends.
    pub async fn drive(mut self, mut callbacks: StreamCallbacks) {
        while let Some(event) = self.next().await {
            if !self.dispatch_unless_aborted(&mut callbacks, &event) {
                break;
            }
        }
    }

    fn dispatch_unless_aborted(
        &self,
        callbacks: &mut StreamCallbacks,
        event: &StreamEvent,
    ) -> bool {
        let _gate = self.handle.dispatch.lock();
        if self.handle.is_aborted() {
            return false;
        }
        callbacks.dispatch(event);
        true
    }
}

impl Stream for StreamEvents {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.handle.is_aborted() {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(_)) if self.handle.is_aborted() => Poll::Ready(None),
            other => other,
        }
    }
}

/// Connected sink/receiver pair sharing one cancellation handle.
pub fn event_channel() -> (StreamSink, StreamEvents) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = StreamHandle::new();
    (
        StreamSink {
            tx,
            handle: handle.clone(),
        },
        StreamEvents { rx, handle },
    )
}

type TextCallback = Box<dyn FnMut(&str) + Send>;

/// Optional per-event callbacks, for callers that prefer them to a stream.
#[derive(Default)]
pub struct StreamCallbacks {
    on_token: Option<TextCallback>,
    on_tool: Option<TextCallback>,
    on_error: Option<TextCallback>,
    on_done: Option<Box<dyn FnMut() + Send>>,
}

impl StreamCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_token(mut self, f: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_token = Some(Box::new(f));
        self
    }

    pub fn on_tool(mut self, f: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_tool = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_done(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.on_done = Some(Box::new(f));
        self
    }

    pub fn dispatch(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Token(text) => {
                if let Some(f) = self.on_token.as_mut() {
                    f(text);
                }
            }
            StreamEvent::ToolCall(name) => {
                if let Some(f) = self.on_tool.as_mut() {
                    f(name);
                }
            }
            StreamEvent::Error(message) => {
                if let Some(f) = self.on_error.as_mut() {
                    f(message);
                }
            }
            StreamEvent::Done => {
                if let Some(f) = self.on_done.as_mut() {
                    f();
                }
            }
        }
    }
}

/// Turns observations of a growing response body into events.
pub struct BodyObserver {
    decoder: FrameDecoder,
    sink: StreamSink,
}

impl BodyObserver {
    pub fn new(sink: StreamSink) -> Self {
        Self {
            decoder: FrameDecoder::new(),
            sink,
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.sink.is_aborted()
    }

    /// Deliver events for whatever was appended to `body` since last time.
    pub fn observe(&mut self, body: &[u8]) {
        if self.sink.is_aborted() {
            return;
        }
        for event in self.decoder.observe(body) {
            if !self.sink.send(event) {
                break;
            }
        }
    }

    /// Successful end of the exchange: flush the last line, then `Done`.
    pub fn complete(mut self, body: &[u8]) {
        if self.sink.is_aborted() {
            return;
        }
        for event in self.decoder.finish(body) {
            if !self.sink.send(event) {
                return;
            }
        }
        self.sink.send(StreamEvent::Done);
    }

    /// Failed end of the exchange: one `Error`, never followed by `Done`.
    pub fn fail(self, message: String) {
        self.sink.send(StreamEvent::Error(message));
    }
}

/// Something that can start a chat stream. The HTTP transport is the real
/// implementation; tests script their own.
pub trait StreamOpener: Send + Sync {
    fn open(&self, request: ChatRequest) -> StreamEvents;
}

/// Chat transport over one long-lived POST whose body grows as the reply is
/// generated.
#[derive(Clone)]
pub struct HttpStreamTransport {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

impl HttpStreamTransport {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint, token)
    }

    pub fn with_client(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            token: token.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Start the request on a background task and deliver events through the
    /// returned stream. Must be called inside a tokio runtime.
    pub fn open_stream(&self, request: ChatRequest) -> StreamEvents {
        let (sink, events) = event_channel();
        let handle = sink.handle();
        let task = tokio::spawn(Self::run(
            self.client.clone(),
            self.endpoint.clone(),
            self.token.clone(),
            request,
            BodyObserver::new(sink),
        ));
        handle.attach(task.abort_handle());
        events
    }

    /// Callback flavour of [`open_stream`](Self::open_stream).
    pub fn open_with_callbacks(&self, request: ChatRequest, callbacks: StreamCallbacks) -> StreamHandle {
        let events = self.open_stream(request);
        let handle = events.handle();
        tokio::spawn(events.drive(callbacks));
        handle
    }

    async fn run(
        client: reqwest::Client,
        endpoint: String,
        token: String,
        request: ChatRequest,
        mut observer: BodyObserver,
    ) {
        debug!(endpoint = %endpoint, "Opening chat stream");

        match Self::exchange(&client, &endpoint, &token, &request, &mut observer).await {
            Ok(Some(body)) => {
                debug!(bytes = body.len(), "Chat stream finished");
                observer.complete(&body);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = ?e, endpoint = %endpoint, "Chat stream failed");
                observer.fail(e.to_string());
            }
        }
    }

    /// Perform the request and feed the growing body to `observer`. Returns
    /// the complete body, or `None` when the stream was aborted midway.
    async fn exchange(
        client: &reqwest::Client,
        endpoint: &str,
        token: &str,
        request: &ChatRequest,
        observer: &mut BodyObserver,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let response = client
            .post(endpoint)
            .header(AUTHORIZATION, token)
            .header(ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        // The whole body is kept as an append-only log; the decoder's cursor
        // tracks how much of it has been read.
        let mut body = Vec::new();
        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            if observer.is_aborted() {
                return Ok(None);
            }
            body.extend_from_slice(&chunk?);
            observer.observe(&body);
        }

        Ok(Some(body))
    }
}

impl StreamOpener for HttpStreamTransport {
    fn open(&self, request: ChatRequest) -> StreamEvents {
        self.open_stream(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn collect(mut events: StreamEvents) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Some(event) = events.next().await {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_observer_emits_done_once_after_frames() {
        let (sink, events) = event_channel();
        let mut observer = BodyObserver::new(sink);
        let body = b"data: {\"type\":\"token\",\"content\":\"hi\"}\ndata: [DONE]\n";
        observer.observe(body);
        observer.complete(body);

        assert_eq!(
            collect(events).await,
            vec![StreamEvent::Token("hi".into()), StreamEvent::Done]
        );
    }

    #[tokio::test]
    async fn test_failure_is_not_followed_by_done() {
        let (sink, events) = event_channel();
        let observer = BodyObserver::new(sink);
        observer.fail("Network error: reset".into());

        assert_eq!(
            collect(events).await,
            vec![StreamEvent::Error("Network error: reset".into())]
        );
    }

    #[tokio::test]
    async fn test_no_callbacks_after_abort() {
        let (sink, events) = event_channel();
        let handle = sink.handle();
        let mut observer = BodyObserver::new(sink);

        let delivered = Arc::new(AtomicUsize::new(0));
        let after_abort = Arc::new(AtomicUsize::new(0));
        let aborted = Arc::new(AtomicBool::new(false));

        let count = |delivered: &Arc<AtomicUsize>, after: &Arc<AtomicUsize>, flag: &Arc<AtomicBool>| {
            let delivered = delivered.clone();
            let after = after.clone();
            let flag = flag.clone();
            move || {
                delivered.fetch_add(1, Ordering::SeqCst);
                if flag.load(Ordering::SeqCst) {
                    after.fetch_add(1, Ordering::SeqCst);
                }
            }
        };
        let on_token = count(&delivered, &after_abort, &aborted);
        let on_tool = count(&delivered, &after_abort, &aborted);
        let on_error = count(&delivered, &after_abort, &aborted);
        let on_done = count(&delivered, &after_abort, &aborted);
        let callbacks = StreamCallbacks::new()
            .on_token(move |_| on_token())
            .on_tool(move |_| on_tool())
            .on_error(move |_| on_error())
            .on_done(on_done);

        let frame = b"data: {\"type\":\"token\",\"content\":\"x\"}\n";
        let mut body = frame.to_vec();
        observer.observe(&body);

        let driver = tokio::spawn(events.drive(callbacks));
        tokio::task::yield_now().await;

        handle.abort();
        aborted.store(true, Ordering::SeqCst);

        for i in 0..100 {
            body.extend_from_slice(frame);
            if i % 10 == 0 {
                body.extend_from_slice(b"data: {\"type\":\"error\",\"content\":\"late\"}\n");
                body.extend_from_slice(b"data: {\"type\":\"tool_call\",\"tool\":\"late\"}\n");
            }
            observer.observe(&body);
        }
        observer.complete(&body);
        handle.abort();

        driver.await.unwrap();
        assert_eq!(after_abort.load(Ordering::SeqCst), 0);
        assert!(delivered.load(Ordering::SeqCst) <= 1);
    }

    #[tokio::test]
    async fn test_queued_events_are_dropped_on_abort() {
        let (sink, mut events) = event_channel();
        assert!(sink.send(StreamEvent::Token("a".into())));
        assert!(sink.send(StreamEvent::Token("b".into())));

        events.handle().abort();

        assert!(!sink.send(StreamEvent::Done));
        assert_eq!(events.next().await, None);
    }

    #[tokio::test]
    async fn test_callback_can_abort_its_own_stream() {
        let (sink, events) = event_channel();
        for text in ["a", "b", "c"] {
            assert!(sink.send(StreamEvent::Token(text.into())));
        }

        let handle = events.handle();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let callbacks = StreamCallbacks::new().on_token({
            let seen = seen.clone();
            move |text| {
                seen.lock().push(text.to_string());
                handle.abort();
            }
        });

        events.drive(callbacks).await;
        assert_eq!(*seen.lock(), vec!["a".to_string()]);
        assert!(!sink.send(StreamEvent::Done));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_abort_from_another_thread_waits_for_running_callback() {
        let (sink, events) = event_channel();
        let handle = events.handle();

        let producer = tokio::spawn(async move {
            while sink.send(StreamEvent::Token("x".into())) {
                tokio::task::yield_now().await;
            }
        });

        let delivered = Arc::new(AtomicUsize::new(0));
        let callbacks = StreamCallbacks::new().on_token({
            let delivered = delivered.clone();
            move |_| {
                std::thread::sleep(std::time::Duration::from_millis(2));
                delivered.fetch_add(1, Ordering::SeqCst);
            }
        });
        let driver = tokio::spawn(events.drive(callbacks));

        while delivered.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        handle.abort();
        let at_abort = delivered.load(Ordering::SeqCst);

        driver.await.unwrap();
        producer.await.unwrap();
        assert_eq!(delivered.load(Ordering::SeqCst), at_abort);
    }

    #[tokio::test]
    async fn test_http_stream_delivers_frames_then_done() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"type\":\"token\",\"content\":\"Hello \"}\n",
            "data: {\"type\":\"tool_call\",\"tool\":\"list_invoices\"}\n",
            "data: {not json}\n",
            "data: {\"type\":\"token\",\"content\":\"world\"}\n",
            "data: [DONE]\n",
        );
        Mock::given(method("POST"))
            .and(path("/api/method/niv_ai.niv_core.api.stream.stream_chat"))
            .and(header("authorization", "token abc:def"))
            .and(header("accept", "text/event-stream"))
            .and(body_json(serde_json::json!({"message": "hi"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .expect(1)
            .mount(&server)
            .await;

        let transport = HttpStreamTransport::new(
            format!("{}/api/method/niv_ai.niv_core.api.stream.stream_chat", server.uri()),
            "token abc:def",
        );
        let events = collect(transport.open(ChatRequest::new("hi"))).await;

        assert_eq!(
            events,
            vec![
                StreamEvent::Token("Hello ".into()),
                StreamEvent::ToolCall("list_invoices".into()),
                StreamEvent::Token("world".into()),
                StreamEvent::Done,
            ]
        );
    }

    /// Serve one request with `body` as a chunked response, pausing between
    /// chunks so the client sees the body grow.
    async fn serve_chunked(body: &'static str, cuts: Vec<usize>) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();

            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            let head_end = loop {
                let n = socket.read(&mut buf).await.unwrap();
                assert!(n > 0, "connection closed before request head");
                request.extend_from_slice(&buf[..n]);
                if let Some(pos) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };
            let head = String::from_utf8_lossy(&request[..head_end]).to_lowercase();
            let content_length: usize = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .map(|v| v.trim().parse().unwrap())
                .unwrap_or(0);
            while request.len() < head_end + content_length {
                let n = socket.read(&mut buf).await.unwrap();
                assert!(n > 0, "connection closed before request body");
                request.extend_from_slice(&buf[..n]);
            }

            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n",
                )
                .await
                .unwrap();

            let bytes = body.as_bytes();
            let mut start = 0;
            for end in cuts.into_iter().chain(std::iter::once(bytes.len())) {
                let chunk = &bytes[start..end];
                socket
                    .write_all(format!("{:x}\r\n", chunk.len()).as_bytes())
                    .await
                    .unwrap();
                socket.write_all(chunk).await.unwrap();
                socket.write_all(b"\r\n").await.unwrap();
                socket.flush().await.unwrap();
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                start = end;
            }
            socket.write_all(b"0\r\n\r\n").await.unwrap();
            socket.flush().await.unwrap();
        });

        format!("http://{addr}/stream")
    }

    #[tokio::test]
    async fn test_chunked_body_split_mid_line_and_mid_character() {
        let body = concat!(
            "data: {\"type\":\"token\",\"content\":\"Grüß \"}\n",
            ": ping\n",
            "data: {\"type\":\"tool_call\",\"tool\":\"stock_balance\"}\n",
            "data: {broken\n",
            "data: {\"type\":\"token\",\"content\":\"Gott\"}\n",
            "data: [DONE]\n",
            "data: {\"type\":\"token\",\"content\":\"!\"}",
        );
        // One cut lands between the two bytes of the umlaut.
        let umlaut = body.find('ü').unwrap();
        let mut cuts = vec![4, 27, umlaut + 1, 60, 61, 95, body.len() - 3];
        cuts.sort_unstable();
        cuts.dedup();
        assert!(!body.is_char_boundary(umlaut + 1));

        let endpoint = serve_chunked(body, cuts).await;
        let transport = HttpStreamTransport::new(endpoint, "token abc:def");
        let events = collect(transport.open(ChatRequest::new("Stock?"))).await;

        assert_eq!(
            events,
            vec![
                StreamEvent::Token("Grüß ".into()),
                StreamEvent::ToolCall("stock_balance".into()),
                StreamEvent::Token("Gott".into()),
                StreamEvent::Token("!".into()),
                StreamEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_http_error_status_reports_error_without_done() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let transport = HttpStreamTransport::new(server.uri(), "token");
        let events = collect(transport.open(ChatRequest::new("hi"))).await;

        assert_eq!(events, vec![StreamEvent::Error("Server error: 502".into())]);
    }

    #[tokio::test]
    async fn test_unreachable_host_reports_network_error() {
        let transport = HttpStreamTransport::new("http://127.0.0.1:1/stream", "token");
        let events = collect(transport.open(ChatRequest::new("hi"))).await;

        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Error(message) => assert!(message.starts_with("Network error")),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_callbacks_flavour() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("data: {\"type\":\"token\",\"content\":\"ok\"}\n"),
            )
            .mount(&server)
            .await;

        let tokens = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let mut done_tx = Some(done_tx);
        let callbacks = StreamCallbacks::new()
            .on_token({
                let tokens = tokens.clone();
                move |text| tokens.lock().push(text.to_string())
            })
            .on_done(move || {
                if let Some(tx) = done_tx.take() {
                    let _ = tx.send(());
                }
            });

        let transport = HttpStreamTransport::new(server.uri(), "token");
        let handle = transport.open_with_callbacks(ChatRequest::new("hi"), callbacks);
        done_rx.await.unwrap();

        assert_eq!(*tokens.lock(), vec!["ok".to_string()]);
        handle.abort();
        handle.abort();
        assert!(handle.is_aborted());
    }
}
