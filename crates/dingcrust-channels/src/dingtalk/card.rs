use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Method;
use serde_json::{Value, json};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::api::DingTalkApi;
use super::error::DingTalkError;
use super::route::{CardRoute, ConversationKind};

const CREATE_PATH: &str = "/v1.0/card/instances/createAndDeliver";
const UPDATE_PATH: &str = "/v1.0/card/instances";
const STREAMING_PATH: &str = "/v1.0/card/streaming";

/// Card field the template renders the reply into.
const CONTENT_KEY: &str = "msgContent";
/// Shown when a card is finalized before any content arrived.
pub const EMPTY_CARD_PLACEHOLDER: &str = "...";
/// Announce is retried immediately this many times before streaming
/// proceeds without it.
const ANNOUNCE_ATTEMPTS: usize = 2;

/// Position of a card in the remote protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardPhase {
    Created,
    Inputing,
    Streaming,
    StreamClosed,
    Finished,
}

/// A remote call that moves a card forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardStep {
    Announce,
    Stream,
    CloseStream,
    Finish,
}

impl CardPhase {
    /// Transition function of the card protocol.
    ///
    /// Streaming is tolerated straight from `Created` so a card whose
    /// announce failed can still render.
    pub fn next(self, step: CardStep) -> Result<CardPhase, DingTalkError> {
        use CardPhase::*;
        match (self, step) {
            (Created, CardStep::Announce) => Ok(Inputing),
            (Created | Inputing | Streaming, CardStep::Stream) => Ok(Streaming),
            (Created | Inputing | Streaming, CardStep::CloseStream) => Ok(StreamClosed),
            (StreamClosed, CardStep::Finish) => Ok(Finished),
            (phase, step) => Err(DingTalkError::Protocol { phase, step }),
        }
    }

    pub fn is_terminal(self) -> bool {
        self == CardPhase::Finished
    }
}

/// Remote `flowStatus` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    Inputing,
    Finished,
}

impl FlowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FlowStatus::Inputing => "2",
            FlowStatus::Finished => "3",
        }
    }
}

/// Local mirror of one in-flight remote card.
#[derive(Debug, Clone)]
pub struct CardState {
    id: String,
    content: String,
    phase: CardPhase,
    announced_input: bool,
    announce_abandoned: bool,
    created_at: Instant,
}

impl CardState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: String::new(),
            phase: CardPhase::Created,
            announced_input: false,
            announce_abandoned: false,
            created_at: Instant::now(),
        }
    }

    /// `outTrackId` of the card.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn append(&mut self, text: &str) {
        self.content.push_str(text);
    }

    pub fn phase(&self) -> CardPhase {
        self.phase
    }

    pub fn announced_input(&self) -> bool {
        self.announced_input
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// True once the card has been open for longer than `ttl`.
    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.age() > ttl
    }

    fn advance(&mut self, step: CardStep) -> Result<(), DingTalkError> {
        self.phase = self.phase.next(step)?;
        Ok(())
    }
}

fn new_track_id() -> String {
    format!("card_{}", Uuid::new_v4().simple())
}

/// Drives the card protocol: create, announce, stream, close, finish.
///
/// Every step after `create` is best-effort: remote failures are logged and
/// absorbed so a broken card never interrupts the conversation.
pub struct CardLifecycle {
    api: Arc<DingTalkApi>,
    robot_code: String,
    template_id: String,
}

impl CardLifecycle {
    pub fn new(
        api: Arc<DingTalkApi>,
        robot_code: impl Into<String>,
        template_id: impl Into<String>,
    ) -> Self {
        Self {
            api,
            robot_code: robot_code.into(),
            template_id: template_id.into(),
        }
    }

    pub fn api(&self) -> &Arc<DingTalkApi> {
        &self.api
    }

    fn create_body(&self, track_id: &str, route: &CardRoute) -> Value {
        let mut body = json!({
            "cardTemplateId": self.template_id,
            "outTrackId": track_id,
            "cardData": { "cardParamMap": {} },
            "callbackType": "STREAM",
            "imGroupOpenSpaceModel": { "supportForward": true },
            "imRobotOpenSpaceModel": { "supportForward": true },
            "openSpaceId": route.open_space_id(),
            "userIdType": 1,
        });
        match route.kind {
            ConversationKind::Group => {
                body["imGroupOpenDeliverModel"] = json!({ "robotCode": self.robot_code });
            }
            ConversationKind::Direct => {
                body["imRobotOpenDeliverModel"] = json!({ "spaceType": "IM_ROBOT" });
            }
        }
        body
    }

    /// Create and deliver an empty card. An error here means no card exists
    /// remotely and the caller must not register one.
    pub async fn create(&self, route: &CardRoute) -> Result<CardState, DingTalkError> {
        let track_id = new_track_id();
        let body = self.create_body(&track_id, route);
        self.api
            .call("card create", Method::POST, CREATE_PATH, &body)
            .await
            .inspect_err(|e| error!("dingtalk: {e}"))?;
        debug!("dingtalk: card {track_id} created in {}", route.open_space_id());
        Ok(CardState::new(track_id))
    }

    async fn put_card_data(
        &self,
        card: &CardState,
        status: FlowStatus,
        content: &str,
    ) -> Result<(), DingTalkError> {
        let body = json!({
            "outTrackId": card.id,
            "cardData": {
                "cardParamMap": {
                    "flowStatus": status.as_str(),
                    CONTENT_KEY: content,
                    "staticMsgContent": "",
                    "sys_full_json_obj": json!({ "order": [CONTENT_KEY] }).to_string(),
                }
            }
        });
        self.api
            .call("card update", Method::PUT, UPDATE_PATH, &body)
            .await?;
        debug!("dingtalk: card {} flowStatus={}", card.id, status.as_str());
        Ok(())
    }

    /// Announce "input in progress" once per card.
    ///
    /// Only a confirmed announce sets `announced_input`. After
    /// `ANNOUNCE_ATTEMPTS` failures the card streams without it and the
    /// announce is not tried again.
    pub async fn ensure_inputing(&self, card: &mut CardState) {
        if card.announced_input || card.announce_abandoned {
            return;
        }
        if let Err(e) = card.phase.next(CardStep::Announce) {
            warn!("dingtalk: card {} skipping announce: {e}", card.id);
            return;
        }

        for attempt in 1..=ANNOUNCE_ATTEMPTS {
            match self.put_card_data(card, FlowStatus::Inputing, "").await {
                Ok(()) => {
                    card.announced_input = true;
                    card.phase = CardPhase::Inputing;
                    return;
                }
                Err(e) => {
                    warn!(
                        "dingtalk: card {} announce attempt {attempt}/{ANNOUNCE_ATTEMPTS} failed: {e}",
                        card.id
                    );
                }
            }
        }
        card.announce_abandoned = true;
        warn!(
            "dingtalk: card {} streaming without input announce (degraded)",
            card.id
        );
    }

    /// Replace the card's displayed content with `content`.
    pub async fn stream(&self, card: &mut CardState, content: &str, is_finalize: bool) {
        let step = if is_finalize {
            CardStep::CloseStream
        } else {
            CardStep::Stream
        };
        if let Err(e) = card.phase.next(step) {
            warn!("dingtalk: card {} stream skipped: {e}", card.id);
            return;
        }

        self.ensure_inputing(card).await;

        // The phase moves on the attempt, not the outcome: a failed close
        // must not keep the card from being finished.
        if let Err(e) = card.advance(step) {
            warn!("dingtalk: card {} stream skipped: {e}", card.id);
            return;
        }

        let body = json!({
            "outTrackId": card.id,
            "guid": Uuid::new_v4().simple().to_string(),
            "key": CONTENT_KEY,
            "content": content,
            "isFull": true,
            "isFinalize": is_finalize,
            "isError": false,
        });
        match self
            .api
            .call("card stream", Method::PUT, STREAMING_PATH, &body)
            .await
        {
            Ok(_) => debug!("dingtalk: card {} streamed (finalize={is_finalize})", card.id),
            Err(e) => error!("dingtalk: {e}"),
        }
    }

    /// Close the stream channel and mark the card finished, sending the
    /// accumulated content (or a placeholder) one last time.
    ///
    /// Both calls are attempted regardless of the other's outcome. Finishing
    /// an already finished card does nothing.
    pub async fn finish(&self, card: &mut CardState) {
        if card.phase.is_terminal() {
            debug!("dingtalk: card {} already finished", card.id);
            return;
        }

        let content = if card.content.is_empty() {
            EMPTY_CARD_PLACEHOLDER.to_string()
        } else {
            card.content.clone()
        };

        if card.phase != CardPhase::StreamClosed {
            self.stream(card, &content, true).await;
        }

        if let Err(e) = card.advance(CardStep::Finish) {
            warn!("dingtalk: card {} finish skipped: {e}", card.id);
            return;
        }
        if let Err(e) = self
            .put_card_data(card, FlowStatus::Finished, &content)
            .await
        {
            error!("dingtalk: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    async fn mock_dingtalk(stream_status: u16, update_status: u16) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1.0/oauth2/accessToken"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"accessToken": "tok", "expireIn": 7200})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(CREATE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(UPDATE_PATH))
            .respond_with(ResponseTemplate::new(update_status))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(STREAMING_PATH))
            .respond_with(ResponseTemplate::new(stream_status))
            .mount(&server)
            .await;
        server
    }

    fn lifecycle(server: &MockServer) -> CardLifecycle {
        let api = Arc::new(DingTalkApi::new(server.uri(), "ding-app", "s3cret"));
        CardLifecycle::new(api, "ding-app", "tpl.schema")
    }

    fn group_route() -> CardRoute {
        CardRoute {
            kind: ConversationKind::Group,
            conversation_id: "cid-1".into(),
            sender_staff_id: "staff-1".into(),
            sender_id: "sender-1".into(),
        }
    }

    async fn card_calls(server: &MockServer) -> Vec<Request> {
        server
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.url.path() != "/v1.0/oauth2/accessToken")
            .collect()
    }

    fn body(request: &Request) -> Value {
        serde_json::from_slice(&request.body).unwrap()
    }

    #[test]
    fn transitions_follow_protocol_order() {
        use CardPhase::*;
        assert_eq!(Created.next(CardStep::Announce).unwrap(), Inputing);
        assert_eq!(Inputing.next(CardStep::Stream).unwrap(), Streaming);
        assert_eq!(Streaming.next(CardStep::Stream).unwrap(), Streaming);
        assert_eq!(Streaming.next(CardStep::CloseStream).unwrap(), StreamClosed);
        assert_eq!(StreamClosed.next(CardStep::Finish).unwrap(), Finished);
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        use CardPhase::*;
        assert!(Created.next(CardStep::Finish).is_err());
        assert!(Inputing.next(CardStep::Announce).is_err());
        assert!(StreamClosed.next(CardStep::Stream).is_err());
        assert!(Finished.next(CardStep::CloseStream).is_err());
        let err = Finished.next(CardStep::Stream).unwrap_err();
        assert!(matches!(
            err,
            DingTalkError::Protocol { phase: Finished, step: CardStep::Stream }
        ));
    }

    #[test]
    fn content_is_append_only() {
        let mut card = CardState::new("card_x");
        card.append("a\n\n");
        card.append("b");
        assert_eq!(card.content(), "a\n\nb");
        assert!(!card.is_expired(Duration::from_secs(600)));
    }

    #[tokio::test]
    async fn create_builds_group_delivery_body() {
        let server = mock_dingtalk(200, 200).await;
        let card = lifecycle(&server).create(&group_route()).await.unwrap();

        assert!(card.id().starts_with("card_"));
        assert_eq!(card.phase(), CardPhase::Created);

        let calls = card_calls(&server).await;
        let sent = body(&calls[0]);
        assert_eq!(sent["cardTemplateId"], "tpl.schema");
        assert_eq!(sent["outTrackId"], card.id());
        assert_eq!(sent["callbackType"], "STREAM");
        assert_eq!(sent["openSpaceId"], "dtv1.card//IM_GROUP.cid-1");
        assert_eq!(sent["imGroupOpenDeliverModel"]["robotCode"], "ding-app");
        assert!(sent.get("imRobotOpenDeliverModel").is_none());
        assert_eq!(sent["cardData"], json!({"cardParamMap": {}}));
    }

    #[tokio::test]
    async fn create_builds_direct_delivery_body() {
        let server = mock_dingtalk(200, 200).await;
        let route = CardRoute {
            kind: ConversationKind::Direct,
            ..group_route()
        };
        lifecycle(&server).create(&route).await.unwrap();

        let sent = body(&card_calls(&server).await[0]);
        assert_eq!(sent["openSpaceId"], "dtv1.card//IM_ROBOT.staff-1");
        assert_eq!(sent["imRobotOpenDeliverModel"]["spaceType"], "IM_ROBOT");
        assert!(sent.get("imGroupOpenDeliverModel").is_none());
    }

    #[tokio::test]
    async fn create_failure_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1.0/oauth2/accessToken"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"accessToken": "tok", "expireIn": 7200})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(CREATE_PATH))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = lifecycle(&server).create(&group_route()).await.unwrap_err();
        assert!(matches!(err, DingTalkError::Remote { status: 500, .. }));
    }

    #[tokio::test]
    async fn announce_is_sent_once_across_streams() {
        let server = mock_dingtalk(200, 200).await;
        let lifecycle = lifecycle(&server);
        let mut card = CardState::new("card_a");

        lifecycle.stream(&mut card, "one", false).await;
        lifecycle.stream(&mut card, "one two", false).await;
        lifecycle.stream(&mut card, "one two three", false).await;

        let calls = card_calls(&server).await;
        let announces = calls.iter().filter(|r| r.url.path() == UPDATE_PATH).count();
        assert_eq!(announces, 1);
        assert_eq!(calls[0].url.path(), UPDATE_PATH, "announce precedes first stream");
        assert_eq!(body(&calls[0])["cardData"]["cardParamMap"]["flowStatus"], "2");
        assert!(card.announced_input());
        assert_eq!(card.phase(), CardPhase::Streaming);
    }

    #[tokio::test]
    async fn failed_announce_retries_then_streams_degraded() {
        let server = mock_dingtalk(200, 503).await;
        let lifecycle = lifecycle(&server);
        let mut card = CardState::new("card_b");

        lifecycle.stream(&mut card, "hello", false).await;
        lifecycle.stream(&mut card, "hello again", false).await;

        let paths: Vec<_> = card_calls(&server)
            .await
            .iter()
            .map(|r| r.url.path().to_string())
            .collect();
        assert_eq!(
            paths,
            vec![UPDATE_PATH, UPDATE_PATH, STREAMING_PATH, STREAMING_PATH],
            "two announce attempts, then streaming without further announces"
        );
        assert!(!card.announced_input());
    }

    #[tokio::test]
    async fn stream_sends_full_buffer_with_fresh_guid() {
        let server = mock_dingtalk(200, 200).await;
        let lifecycle = lifecycle(&server);
        let mut card = CardState::new("card_c");

        lifecycle.stream(&mut card, "a", false).await;
        lifecycle.stream(&mut card, "a b", false).await;

        let streams: Vec<Value> = card_calls(&server)
            .await
            .iter()
            .filter(|r| r.url.path() == STREAMING_PATH)
            .map(body)
            .collect();
        assert_eq!(streams[1]["content"], "a b");
        assert_eq!(streams[1]["isFull"], true);
        assert_eq!(streams[1]["key"], "msgContent");
        assert_ne!(streams[0]["guid"], streams[1]["guid"]);
    }

    #[tokio::test]
    async fn finish_closes_stream_then_marks_finished() {
        let server = mock_dingtalk(200, 200).await;
        let lifecycle = lifecycle(&server);
        let mut card = CardState::new("card_d");
        card.append("final words");

        lifecycle.finish(&mut card).await;

        let calls = card_calls(&server).await;
        let last_two: Vec<Value> = calls[calls.len() - 2..].iter().map(body).collect();
        assert_eq!(last_two[0]["isFinalize"], true);
        assert_eq!(last_two[0]["content"], "final words");
        let params = &last_two[1]["cardData"]["cardParamMap"];
        assert_eq!(params["flowStatus"], "3");
        assert_eq!(params["msgContent"], "final words");
        assert_eq!(params["sys_full_json_obj"], r#"{"order":["msgContent"]}"#);
        assert_eq!(card.phase(), CardPhase::Finished);
    }

    #[tokio::test]
    async fn finish_uses_placeholder_for_empty_card() {
        let server = mock_dingtalk(200, 200).await;
        let mut card = CardState::new("card_e");
        lifecycle(&server).finish(&mut card).await;

        let calls = card_calls(&server).await;
        let close = calls
            .iter()
            .map(body)
            .find(|b| b["isFinalize"] == true)
            .expect("close-stream call");
        assert_eq!(close["content"], EMPTY_CARD_PLACEHOLDER);
    }

    #[tokio::test]
    async fn finish_attempts_update_even_when_close_fails() {
        let server = mock_dingtalk(500, 200).await;
        let mut card = CardState::new("card_f");
        card.append("x");
        lifecycle(&server).finish(&mut card).await;

        let calls = card_calls(&server).await;
        let last = body(calls.last().unwrap());
        assert_eq!(last["cardData"]["cardParamMap"]["flowStatus"], "3");
        assert_eq!(card.phase(), CardPhase::Finished);
    }

    #[tokio::test]
    async fn finishing_twice_is_a_no_op() {
        let server = mock_dingtalk(200, 200).await;
        let lifecycle = lifecycle(&server);
        let mut card = CardState::new("card_g");
        lifecycle.finish(&mut card).await;
        let before = card_calls(&server).await.len();

        lifecycle.finish(&mut card).await;
        lifecycle.stream(&mut card, "late", false).await;
        assert_eq!(card_calls(&server).await.len(), before);
    }
}
