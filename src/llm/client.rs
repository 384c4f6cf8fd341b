use super::frames::FrameDecoder;
use super::{ChatError, ChatSession, ChatTurn, ContextDocument, Role};
use crate::config::ChatConfig;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Lazy sequence of answer fragments for one question.
///
/// Dropping it before the end closes the response body and leaves the
/// session without an assistant turn for this question.
pub type ChatStream = BoxStream<'static, Result<String, ChatError>>;

#[derive(Serialize)]
struct AskRequest {
    messages: Vec<WireMessage>,
    files: Vec<ContextDocument>,
}

#[derive(Serialize)]
struct WireMessage {
    role: Role,
    text: String,
}

impl From<&ChatTurn> for WireMessage {
    fn from(turn: &ChatTurn) -> Self {
        Self {
            role: turn.role,
            text: turn.text.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamingChatClient {
    client: Client,
    config: ChatConfig,
}

impl StreamingChatClient {
    pub fn new(config: ChatConfig) -> Self {
        Self::with_client(Client::new(), config)
    }

    pub fn with_client(client: Client, config: ChatConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Start a fresh conversation. No request is made until the first question.
    pub fn initialize(&self, session: &ChatSession, documents: &[ContextDocument]) {
        session.reset();
        info!(documents = documents.len(), "Chat session initialized");
    }

    /// Ask `question` with the full session history and `documents` as context.
    ///
    /// Fails with [`ChatError::Configuration`] before touching the session or
    /// the network when the endpoint is not configured. Otherwise the question
    /// is appended to the history right away and the request is sent when the
    /// returned stream is first polled.
    pub fn ask(
        &self,
        session: &ChatSession,
        question: &str,
        documents: &[ContextDocument],
    ) -> Result<ChatStream, ChatError> {
        let endpoint = self.config.endpoint()?;
        let history = session.push_and_snapshot(ChatTurn::user(question));
        let body = AskRequest {
            messages: history.iter().map(WireMessage::from).collect(),
            files: documents.to_vec(),
        };
        let client = self.client.clone();
        let session = session.clone();

        Ok(Box::pin(async_stream::stream! {
            info!(
                url = %endpoint.url,
                turns = body.messages.len(),
                files = body.files.len(),
                "Sending question"
            );

            let response = match client
                .post(&endpoint.url)
                .header("apikey", &endpoint.api_key)
                .bearer_auth(&endpoint.api_key)
                .json(&body)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(error = %e, "Request failed");
                    yield Err(ChatError::Http(e));
                    return;
                }
            };

            if !response.status().is_success() {
                yield Err(response_to_error(response).await);
                return;
            }

            let mut byte_stream = response.bytes_stream();
            let mut decoder = FrameDecoder::new();
            let mut answer = String::new();

            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let received = decoder.bytes_received();
                        warn!(error = %e, received, "Answer stream broke off");
                        yield Err(ChatError::Http(e));
                        return;
                    }
                };
                debug!(bytes = chunk.len(), "Chunk received");

                for fragment in decoder.push(&chunk) {
                    answer.push_str(&fragment);
                    yield Ok(fragment);
                }
            }

            for fragment in decoder.finish() {
                answer.push_str(&fragment);
                yield Ok(fragment);
            }

            if decoder.bytes_received() == 0 {
                yield Err(ChatError::Protocol("response had no body".into()));
                return;
            }
            if decoder.frames_parsed() == 0 {
                yield Err(ChatError::Protocol(
                    "stream ended without any data frames".into(),
                ));
                return;
            }

            info!(
                chars = answer.chars().count(),
                frames = decoder.frames_parsed(),
                dropped = decoder.frames_dropped(),
                "Answer complete"
            );
            session.push(ChatTurn::assistant(answer));
        }))
    }
}

async fn response_to_error(response: reqwest::Response) -> ChatError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&text)
        .ok()
        .and_then(|body| {
            body.get("error")
                .and_then(|e| e.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| format!("Request failed with status {}", status));

    warn!(status = status.as_u16(), %message, "Endpoint rejected question");
    ChatError::Transport {
        status: status.as_u16(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const KEY: &str = "test-key";

    fn frame(text: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({ "candidates": [{ "content": { "parts": [{ "text": text }] } }] })
        )
    }

    fn sse(fragments: &[&str]) -> ResponseTemplate {
        let body: String = fragments.iter().map(|f| frame(f)).collect();
        ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
    }

    fn documents() -> Vec<ContextDocument> {
        vec![ContextDocument {
            id: "doc-1".into(),
            name: "faq.md".into(),
            file_type: "md".into(),
            content: "The Semesterticket is a pass.".into(),
            size: 29,
        }]
    }

    fn client_for(server: &MockServer) -> StreamingChatClient {
        StreamingChatClient::new(ChatConfig::new(server.uri(), KEY))
    }

    async fn collect(stream: ChatStream) -> Vec<Result<String, ChatError>> {
        stream.collect().await
    }

    /// Read one request off `socket`, headers and `content-length` body.
    async fn read_request(socket: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
            let length = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_ask_appends_turns_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/functions/v1/faq-chat"))
            .and(header("apikey", KEY))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(sse(&["It ", "is ", "a pass."]))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let session = ChatSession::new();
        session.push(ChatTurn::user("Hi"));
        session.push(ChatTurn::assistant("Hello!"));

        let stream = client
            .ask(&session, "What is the Semesterticket?", &documents())
            .unwrap();
        let fragments: Vec<String> = collect(stream)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(fragments, vec!["It ", "is ", "a pass."]);

        let history = session.history();
        let turns: Vec<_> = history.iter().map(|t| (t.role, t.text.as_str())).collect();
        assert_eq!(
            turns,
            vec![
                (Role::User, "Hi"),
                (Role::Assistant, "Hello!"),
                (Role::User, "What is the Semesterticket?"),
                (Role::Assistant, "It is a pass."),
            ]
        );

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["messages"].as_array().unwrap().len(), 3);
        assert_eq!(body["messages"][2]["role"], "user");
        assert_eq!(body["messages"][2]["text"], "What is the Semesterticket?");
        assert_eq!(body["files"][0]["name"], "faq.md");
        assert_eq!(body["files"][0]["type"], "md");
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_end_stream() {
        let server = MockServer::start().await;
        let body = format!("{}data: {{not json\n\n{}", frame("one "), frame("two"));
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let session = ChatSession::new();
        let results = collect(client.ask(&session, "q", &[]).unwrap()).await;
        let fragments: Vec<String> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(fragments, vec!["one ", "two"]);
        assert_eq!(session.history()[1].text, "one two");
    }

    #[tokio::test]
    async fn test_cancellation_leaves_no_assistant_turn() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(sse(&["It ", "is ", "a pass."]))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let session = ChatSession::new();
        let mut stream = client
            .ask(&session, "What is the Semesterticket?", &[])
            .unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, "It ");
        drop(stream);

        let history = session.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_body_cut_short_fails_without_assistant_turn() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            // Promise far more body than is sent, then hang up
            let head = "HTTP/1.1 200 OK\r\n\
                        content-type: text/event-stream\r\n\
                        content-length: 10000\r\n\r\n";
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(frame("part").as_bytes()).await.unwrap();
            socket.flush().await.unwrap();
        });

        let client = StreamingChatClient::new(ChatConfig::new(format!("http://{}", addr), KEY));
        let session = ChatSession::new();
        let results = collect(client.ask(&session, "q", &[]).unwrap()).await;
        server.await.unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap(), "part");
        assert!(matches!(results[1], Err(ChatError::Http(_))));
        let history = session.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_connection_refused_fails_without_assistant_turn() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = StreamingChatClient::new(ChatConfig::new(format!("http://{}", addr), KEY));
        let session = ChatSession::new();
        let results = collect(client.ask(&session, "q", &[]).unwrap()).await;
        assert!(matches!(results.as_slice(), [Err(ChatError::Http(_))]));
        assert_eq!(session.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_configuration_fails_before_anything() {
        let client = StreamingChatClient::new(ChatConfig::default());
        let session = ChatSession::new();
        let result = client.ask(&session, "q", &documents());
        assert!(matches!(result, Err(ChatError::Configuration(_))));
        assert!(session.is_empty());
    }

    #[tokio::test]
    async fn test_transport_error_uses_server_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .set_body_json(serde_json::json!({ "error": "quota exceeded" })),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        let session = ChatSession::new();
        let results = collect(client.ask(&session, "q", &[]).unwrap()).await;
        assert_eq!(results.len(), 1);
        match &results[0] {
            Err(ChatError::Transport { status, message }) => {
                assert_eq!(*status, 429);
                assert_eq!(message, "quota exceeded");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        // The question stays, nothing is answered
        assert_eq!(session.len(), 1);
    }

    #[tokio::test]
    async fn test_transport_error_generic_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("<html>bad gateway</html>"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let session = ChatSession::new();
        let results = collect(client.ask(&session, "q", &[]).unwrap()).await;
        match &results[0] {
            Err(ChatError::Transport { status, message }) => {
                assert_eq!(*status, 502);
                assert!(message.starts_with("Request failed with status 502"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_body_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let session = ChatSession::new();
        let results = collect(client.ask(&session, "q", &[]).unwrap()).await;
        assert!(matches!(results.as_slice(), [Err(ChatError::Protocol(_))]));
        assert_eq!(session.len(), 1);
    }

    #[tokio::test]
    async fn test_stream_without_data_frames_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(": keep-alive\n\n", "text/event-stream"),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        let session = ChatSession::new();
        let results = collect(client.ask(&session, "q", &[]).unwrap()).await;
        assert!(matches!(results.as_slice(), [Err(ChatError::Protocol(_))]));
        assert_eq!(session.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_asks_do_not_cross_streams() {
        let server = MockServer::start().await;
        // The second request also carries the first question, so match it first.
        Mock::given(method("POST"))
            .and(body_string_contains("Where is the library?"))
            .respond_with(sse(&["Next ", "to the mensa."]))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("When is enrolment?"))
            .respond_with(sse(&["In ", "March."]))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let session = ChatSession::new();
        let first = client.ask(&session, "When is enrolment?", &[]).unwrap();
        let second = client.ask(&session, "Where is the library?", &[]).unwrap();

        let (first, second) = futures::join!(collect(first), collect(second));
        let first: Vec<String> = first.into_iter().map(|r| r.unwrap()).collect();
        let second: Vec<String> = second.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(first, vec!["In ", "March."]);
        assert_eq!(second, vec!["Next ", "to the mensa."]);

        let history = session.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].text, "When is enrolment?");
        assert_eq!(history[1].text, "Where is the library?");
        let mut answers: Vec<_> = history[2..].iter().map(|t| t.text.clone()).collect();
        answers.sort();
        assert_eq!(answers, vec!["In March.", "Next to the mensa."]);
    }

    #[tokio::test]
    async fn test_initialize_discards_history() {
        let client = StreamingChatClient::new(ChatConfig::default());
        let session = ChatSession::new();
        session.push(ChatTurn::user("old"));
        client.initialize(&session, &documents());
        assert!(session.is_empty());
    }
}
