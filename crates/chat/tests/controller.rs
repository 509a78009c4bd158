use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::channel::mpsc;
use medigraph::chat::{FALLBACK_MESSAGE, TurnState};
use medigraph::{ChatController, RequestProfile, Turn, TurnOutcome, TurnProgress};
use medigraph_triage::{
    BoxFuture, ChunkStream, FailureKind, TriageBackend, TriageError, TriageRequest, TriageResult,
};

type ChunkSender = mpsc::UnboundedSender<TriageResult<Bytes>>;

enum Scripted {
    Stream(mpsc::UnboundedReceiver<TriageResult<Bytes>>),
    Fail(TriageError),
    Panic,
}

/// Hands out one scripted response per request, in the order they were queued.
#[derive(Default)]
struct ChannelBackend {
    responses: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<TriageRequest>>,
}

impl ChannelBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push_stream(&self) -> ChunkSender {
        let (tx, rx) = mpsc::unbounded();
        self.responses.lock().unwrap().push_back(Scripted::Stream(rx));
        tx
    }

    fn push_failure(&self, error: TriageError) {
        self.responses.lock().unwrap().push_back(Scripted::Fail(error));
    }

    fn push_panic(&self) {
        self.responses.lock().unwrap().push_back(Scripted::Panic);
    }

    fn requests(&self) -> Vec<TriageRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl TriageBackend for ChannelBackend {
    fn endpoint(&self) -> &str {
        "channel://triage"
    }

    fn open_stream<'a>(
        &'a self,
        request: &'a TriageRequest,
    ) -> BoxFuture<'a, TriageResult<ChunkStream>> {
        self.requests.lock().unwrap().push(request.clone());
        let response = self.responses.lock().unwrap().pop_front();

        Box::pin(async move {
            match response {
                Some(Scripted::Stream(rx)) => {
                    let stream: ChunkStream = Box::pin(rx);
                    Ok(stream)
                }
                Some(Scripted::Fail(error)) => Err(error),
                Some(Scripted::Panic) => panic!("scripted backend panic"),
                None => Err(unavailable()),
            }
        })
    }
}

fn unavailable() -> TriageError {
    TriageError::Status {
        stage: "scripted-response",
        status: 503,
        body: "reasoner offline".to_string(),
    }
}

fn send(tx: &ChunkSender, text: &str) {
    tx.unbounded_send(Ok(Bytes::copy_from_slice(text.as_bytes())))
        .expect("stream still open");
}

async fn pump(controller: &mut ChatController) -> TurnProgress {
    tokio::time::timeout(Duration::from_secs(5), controller.pump())
        .await
        .expect("stream event within timeout")
}

async fn wait_idle(controller: &mut ChatController) -> Option<TurnOutcome> {
    tokio::time::timeout(Duration::from_secs(5), controller.wait_idle())
        .await
        .expect("turn settles within timeout")
}

fn controller(backend: &Arc<ChannelBackend>) -> ChatController {
    ChatController::new(backend.clone(), RequestProfile::default())
}

#[tokio::test]
async fn completed_turn_concatenates_chunks_in_order() {
    let backend = ChannelBackend::new();
    let tx = backend.push_stream();
    let mut controller = controller(&backend);

    assert!(controller.submit("chest pain when climbing stairs"));
    assert!(controller.is_streaming());

    send(&tx, "Seek ");
    assert_eq!(pump(&mut controller).await, TurnProgress::Delta("Seek ".into()));
    send(&tx, "urgent care.");
    drop(tx);

    assert_eq!(wait_idle(&mut controller).await, Some(TurnOutcome::Completed));
    assert_eq!(
        controller.log().turns(),
        &[
            Turn::user("chest pain when climbing stairs"),
            Turn::assistant("Seek urgent care."),
        ]
    );
    assert_eq!(controller.state(), TurnState::Idle);
    assert_eq!(controller.log().active_index(), None);

    let requests = backend.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].symptoms, "chest pain when climbing stairs");
    assert_eq!(requests[0].history, "None provided");
    assert_eq!(requests[0].user_id, "web_user");
    assert_eq!(requests[0].session_id, controller.session_id().to_string());
}

#[tokio::test]
async fn blank_submit_is_ignored() {
    let backend = ChannelBackend::new();
    let mut controller = controller(&backend);

    assert!(!controller.submit("   \n"));
    assert!(controller.log().is_empty());
    assert!(!controller.is_streaming());
    assert_eq!(pump(&mut controller).await, TurnProgress::Idle);
    assert!(backend.requests().is_empty());
}

#[tokio::test]
async fn submit_while_streaming_is_not_queued() {
    let backend = ChannelBackend::new();
    let tx = backend.push_stream();
    let mut controller = controller(&backend);

    assert!(controller.submit("headache"));
    assert!(!controller.submit("also dizzy"));
    assert_eq!(controller.log().len(), 2);

    send(&tx, "Hydrate.");
    drop(tx);
    assert_eq!(wait_idle(&mut controller).await, Some(TurnOutcome::Completed));

    assert_eq!(
        controller.log().turns(),
        &[Turn::user("headache"), Turn::assistant("Hydrate.")]
    );
    assert_eq!(backend.requests().len(), 1);
}

#[tokio::test]
async fn stop_keeps_streamed_text_and_closes_the_body() {
    let backend = ChannelBackend::new();
    let tx = backend.push_stream();
    let mut controller = controller(&backend);

    assert!(controller.submit("twisted ankle"));
    send(&tx, "Rest and ice");
    assert_eq!(
        pump(&mut controller).await,
        TurnProgress::Delta("Rest and ice".into())
    );

    assert_eq!(controller.stop().as_deref(), Some(""));
    assert_eq!(controller.stop(), None);
    assert_eq!(controller.state(), TurnState::Idle);

    // Late chunks never reach the log.
    let _ = tx.unbounded_send(Ok(Bytes::from_static(b" then see a doctor")));
    assert_eq!(pump(&mut controller).await, TurnProgress::Idle);
    assert_eq!(
        controller.log().turns(),
        &[Turn::user("twisted ankle"), Turn::assistant("Rest and ice")]
    );

    tokio::time::timeout(Duration::from_secs(5), async {
        while !tx.is_closed() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("ingestion task drops the body after stop");
}

#[tokio::test]
async fn stop_applies_deltas_that_were_never_pumped() {
    let backend = ChannelBackend::new();
    let tx = backend.push_stream();
    let mut controller = controller(&backend);

    assert!(controller.submit("swollen knee"));
    send(&tx, "Elevate ");
    send(&tx, "the leg");
    // Let the ingestion task forward both chunks without pumping them.
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(controller.stop().as_deref(), Some("Elevate the leg"));
    assert_eq!(
        controller.log().turns(),
        &[Turn::user("swollen knee"), Turn::assistant("Elevate the leg")]
    );
    assert!(!controller.is_streaming());
    assert_eq!(pump(&mut controller).await, TurnProgress::Idle);
}

#[tokio::test]
async fn pump_replays_deltas_queued_before_the_worker_exited() {
    let backend = ChannelBackend::new();
    let tx = backend.push_stream();
    let mut controller = controller(&backend);

    assert!(controller.submit("mild burn"));
    send(&tx, "Cool water, ");
    send(&tx, "no ice.");
    drop(tx);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(pump(&mut controller).await, TurnProgress::Delta("Cool water, ".into()));
    assert_eq!(pump(&mut controller).await, TurnProgress::Delta("no ice.".into()));
    assert_eq!(
        pump(&mut controller).await,
        TurnProgress::Finished(TurnOutcome::Completed)
    );
    assert_eq!(controller.log().last(), Some(&Turn::assistant("Cool water, no ice.")));
}

#[tokio::test]
async fn regenerate_replaces_the_last_answer() {
    let backend = ChannelBackend::new();
    let first = backend.push_stream();
    let second = backend.push_stream();
    let mut controller = controller(&backend);

    assert!(controller.submit("itchy rash"));
    send(&first, "Try antihistamines.");
    drop(first);
    assert_eq!(wait_idle(&mut controller).await, Some(TurnOutcome::Completed));

    assert!(controller.regenerate());
    assert_eq!(
        controller.log().turns(),
        &[Turn::user("itchy rash"), Turn::assistant("")]
    );
    assert_eq!(controller.log().active_index(), Some(1));

    send(&second, "Avoid scratching.");
    drop(second);
    assert_eq!(wait_idle(&mut controller).await, Some(TurnOutcome::Completed));

    assert_eq!(
        controller.log().turns(),
        &[Turn::user("itchy rash"), Turn::assistant("Avoid scratching.")]
    );
    let requests = backend.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].symptoms, "itchy rash");
    assert_eq!(requests[1].session_id, requests[0].session_id);
}

#[tokio::test]
async fn regenerate_on_empty_log_does_nothing() {
    let backend = ChannelBackend::new();
    let mut controller = controller(&backend);

    assert!(!controller.regenerate());
    assert!(controller.log().is_empty());
    assert!(!controller.is_streaming());
    assert!(backend.requests().is_empty());
}

#[tokio::test]
async fn regenerate_while_streaming_is_ignored() {
    let backend = ChannelBackend::new();
    let tx = backend.push_stream();
    let mut controller = controller(&backend);

    assert!(controller.submit("nausea"));
    assert!(!controller.regenerate());
    assert_eq!(controller.log().len(), 2);

    drop(tx);
    assert_eq!(wait_idle(&mut controller).await, Some(TurnOutcome::Completed));
}

#[tokio::test]
async fn transport_failure_installs_the_fallback() {
    let backend = ChannelBackend::new();
    backend.push_failure(unavailable());
    let mut controller = controller(&backend);

    assert!(controller.submit("help"));
    assert_eq!(
        wait_idle(&mut controller).await,
        Some(TurnOutcome::Failed(FailureKind::Transport))
    );

    assert_eq!(
        controller.log().turns(),
        &[Turn::user("help"), Turn::assistant(FALLBACK_MESSAGE)]
    );
    assert!(!controller.is_streaming());
    assert_eq!(controller.log().active_index(), None);
}

#[tokio::test]
async fn mid_stream_failure_replaces_partial_text() {
    let backend = ChannelBackend::new();
    let tx = backend.push_stream();
    let mut controller = ChatController::new(
        backend.clone(),
        RequestProfile {
            fallback_message: "The triage service is unavailable.".to_string(),
            ..RequestProfile::default()
        },
    );

    assert!(controller.submit("shortness of breath"));
    send(&tx, "Sit upright and");
    assert_eq!(
        pump(&mut controller).await,
        TurnProgress::Delta("Sit upright and".into())
    );
    tx.unbounded_send(Err(TriageError::ReadTimeout {
        stage: "scripted-chunk",
        timeout: Duration::from_secs(30),
    }))
    .expect("stream still open");

    assert_eq!(
        wait_idle(&mut controller).await,
        Some(TurnOutcome::Failed(FailureKind::Stream))
    );
    assert_eq!(
        controller.log().last(),
        Some(&Turn::assistant("The triage service is unavailable."))
    );
}

#[tokio::test]
async fn body_ending_inside_a_character_is_a_stream_failure() {
    let backend = ChannelBackend::new();
    let tx = backend.push_stream();
    let mut controller = controller(&backend);

    assert!(controller.submit("fever"));
    tx.unbounded_send(Ok(Bytes::copy_from_slice(&"é".as_bytes()[..1])))
        .expect("stream still open");
    drop(tx);

    assert_eq!(
        wait_idle(&mut controller).await,
        Some(TurnOutcome::Failed(FailureKind::Stream))
    );
    assert_eq!(controller.log().last(), Some(&Turn::assistant(FALLBACK_MESSAGE)));
}

#[tokio::test]
async fn new_session_while_streaming_discards_the_old_stream() {
    let backend = ChannelBackend::new();
    let old = backend.push_stream();
    let fresh = backend.push_stream();
    let mut controller = controller(&backend);
    let first_session = controller.session_id();

    assert!(controller.submit("back pain"));
    send(&old, "Stretch");
    assert_eq!(pump(&mut controller).await, TurnProgress::Delta("Stretch".into()));

    let second_session = controller.new_session();
    assert_ne!(first_session, second_session);
    assert_eq!(controller.session_id(), second_session);
    assert!(controller.log().is_empty());
    assert!(!controller.is_streaming());

    let _ = old.unbounded_send(Ok(Bytes::from_static(b" gently")));
    assert_eq!(pump(&mut controller).await, TurnProgress::Idle);
    assert!(controller.log().is_empty());

    assert!(controller.submit("sore throat"));
    send(&fresh, "Gargle salt water.");
    drop(fresh);
    assert_eq!(wait_idle(&mut controller).await, Some(TurnOutcome::Completed));

    assert_eq!(
        controller.log().turns(),
        &[Turn::user("sore throat"), Turn::assistant("Gargle salt water.")]
    );
    let requests = backend.requests();
    assert_eq!(requests[0].session_id, first_session.to_string());
    assert_eq!(requests[1].session_id, second_session.to_string());
}

#[tokio::test]
async fn worker_crash_ends_the_turn_with_the_fallback() {
    let backend = ChannelBackend::new();
    backend.push_panic();
    let mut controller = controller(&backend);

    assert!(controller.submit("cough"));
    assert_eq!(
        wait_idle(&mut controller).await,
        Some(TurnOutcome::Failed(FailureKind::Stream))
    );
    assert_eq!(
        controller.log().turns(),
        &[Turn::user("cough"), Turn::assistant(FALLBACK_MESSAGE)]
    );
}

#[tokio::test]
async fn snapshot_reflects_the_streaming_turn() {
    let backend = ChannelBackend::new();
    let tx = backend.push_stream();
    let mut controller = controller(&backend);

    assert!(controller.submit("ear ache"));
    send(&tx, "Warm compress");
    pump(&mut controller).await;

    let snapshot = controller.snapshot();
    assert_eq!(snapshot.session_id, controller.session_id());
    assert!(snapshot.is_streaming);
    assert_eq!(snapshot.active_index, Some(1));
    assert_eq!(snapshot.turns[1], Turn::assistant("Warm compress"));

    drop(tx);
    wait_idle(&mut controller).await;
    assert!(!controller.snapshot().is_streaming);
}
