use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use metrics::counter;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

use crate::client::Classifier;
use crate::encoder::ImageEncoder;
use crate::error::{CommandError, WorkflowError};
use crate::ranker::rank;
use crate::types::{Classification, ImageHandle, Phase, WorkflowState};
use crate::validator::{RawFile, validate};

type Outcome = Result<Classification, WorkflowError>;
type InFlight = BoxFuture<'static, (u64, Outcome)>;

enum Command {
    SubmitFile {
        file: RawFile,
        reply: oneshot::Sender<WorkflowState>,
    },
    Classify {
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
}

/// The transition rules, without any I/O.
///
/// `generation` advances on every accepted submission and every started
/// classification; a settlement carrying an older generation is stale and
/// is dropped.
#[derive(Debug, Default)]
pub struct Workflow {
    state: WorkflowState,
    generation: u64,
}

impl Workflow {
    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    /// Replaces whatever was staged, shown or in flight.
    pub fn submit_file(&mut self, file: RawFile) -> &WorkflowState {
        self.generation += 1;
        self.state = match validate(file) {
            Ok(image) => WorkflowState::Ready { image },
            Err(err) => WorkflowState::Failed {
                image: None,
                error: err.into(),
            },
        };
        &self.state
    }

    /// Moves to `Loading` and hands out the ticket the result must present.
    pub fn begin_classify(&mut self) -> Result<(u64, ImageHandle), CommandError> {
        let image = match &self.state {
            WorkflowState::Idle | WorkflowState::Failed { image: None, .. } => {
                return Err(CommandError::NoImage);
            }
            WorkflowState::Loading { .. } => return Err(CommandError::AlreadyLoading),
            WorkflowState::Ready { image }
            | WorkflowState::Success { image, .. }
            | WorkflowState::Failed {
                image: Some(image), ..
            } => image.clone(),
        };

        self.generation += 1;
        self.state = WorkflowState::Loading {
            image: image.clone(),
        };
        Ok((self.generation, image))
    }

    /// Returns false when the outcome belongs to an abandoned request.
    pub fn settle(&mut self, ticket: u64, outcome: Outcome) -> bool {
        if ticket != self.generation {
            return false;
        }
        let WorkflowState::Loading { image } = &self.state else {
            return false;
        };

        let image = image.clone();
        self.state = match outcome {
            Ok(outcome) => WorkflowState::Success { image, outcome },
            Err(error) => WorkflowState::Failed {
                image: Some(image),
                error,
            },
        };
        true
    }
}

#[tracing::instrument(
    skip_all,
    fields(request_id = %request_id, file = %image.name(), size = image.size())
)]
async fn run_pipeline(
    encoder: Arc<dyn ImageEncoder>,
    classifier: Arc<dyn Classifier>,
    image: ImageHandle,
    request_id: Uuid,
) -> Outcome {
    let payload = encoder.encode(image).await?;
    let response = classifier.classify(payload).await?;

    let Some(prediction) = response.first() else {
        return Err(WorkflowError::NoFaceDetected);
    };
    if response.len() > 1 {
        tracing::debug!(
            ignored = response.len() - 1,
            "Server returned several predictions, using the first"
        );
    }

    let ranked = rank(prediction)?;
    Ok(Classification {
        request_id,
        label: prediction.class_name.clone(),
        ranked,
        completed_at: Utc::now(),
    })
}

/// Cloneable command side of a running [`WorkflowController`].
#[derive(Clone)]
pub struct WorkflowHandle {
    command_tx: flume::Sender<Command>,
    state_rx: watch::Receiver<WorkflowState>,
}

impl WorkflowHandle {
    /// Validates and stages a file, returning the resulting state.
    pub async fn submit_file(&self, file: RawFile) -> Result<WorkflowState, CommandError> {
        let (reply, reply_rx) = oneshot::channel();
        self.command_tx
            .send_async(Command::SubmitFile { file, reply })
            .await
            .map_err(|_| CommandError::ControllerStopped)?;

        reply_rx.await.map_err(|_| CommandError::ControllerStopped)
    }

    /// Starts classifying the staged image. Returns once the workflow is
    /// `Loading`, not when the result arrives; see [`Self::settled`].
    pub async fn classify(&self) -> Result<(), CommandError> {
        let (reply, reply_rx) = oneshot::channel();
        self.command_tx
            .send_async(Command::Classify { reply })
            .await
            .map_err(|_| CommandError::ControllerStopped)?;

        reply_rx.await.map_err(|_| CommandError::ControllerStopped)?
    }

    pub fn state(&self) -> WorkflowState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkflowState> {
        self.state_rx.clone()
    }

    /// Waits until no classification is in flight.
    pub async fn settled(&self) -> Result<WorkflowState, CommandError> {
        let mut state_rx = self.state_rx.clone();
        let state = state_rx
            .wait_for(|state| state.phase() != Phase::Loading)
            .await
            .map_err(|_| CommandError::ControllerStopped)?;
        Ok(WorkflowState::clone(&state))
    }
}

/// Owns the workflow state and runs at most one pipeline at a time.
pub struct WorkflowController {
    command_rx: flume::Receiver<Command>,
    state_tx: watch::Sender<WorkflowState>,
    workflow: Workflow,
    encoder: Arc<dyn ImageEncoder>,
    classifier: Arc<dyn Classifier>,
    in_flight: Option<InFlight>,
}

impl WorkflowController {
    pub fn new(
        encoder: Arc<dyn ImageEncoder>,
        classifier: Arc<dyn Classifier>,
    ) -> (WorkflowHandle, Self) {
        let (command_tx, command_rx) = flume::bounded(0); // Rendezvous channel
        let (state_tx, state_rx) = watch::channel(WorkflowState::Idle);

        let controller = Self {
            command_rx,
            state_tx,
            workflow: Workflow::default(),
            encoder,
            classifier,
            in_flight: None,
        };

        let handle = WorkflowHandle {
            command_tx,
            state_rx,
        };

        (handle, controller)
    }

    /// Runs until every [`WorkflowHandle`] is dropped. A request still in
    /// flight at that point is abandoned.
    #[tracing::instrument(skip(self))]
    pub async fn run_forever(mut self) {
        loop {
            tokio::select! {
                command = self.command_rx.recv_async() => {
                    match command {
                        Ok(command) => self.handle_command(command),
                        Err(_) => {
                            tracing::info!("All workflow handles dropped, stopping controller");
                            break;
                        }
                    }
                }

                (ticket, outcome) = next_settlement(&mut self.in_flight) => {
                    self.in_flight = None;
                    self.settle(ticket, outcome);
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SubmitFile { file, reply } => {
                if self.in_flight.take().is_some() {
                    counter!("classification_stale_results_total").increment(1);
                    tracing::info!("New file submitted, abandoning in-flight classification");
                }

                let state = self.workflow.submit_file(file).clone();
                if let Some(error) = state.error() {
                    counter!("classification_failures_total", "kind" => error.kind()).increment(1);
                    tracing::warn!(kind = error.kind(), %error, "File rejected");
                }
                self.publish();
                let _ = reply.send(state);
            }
            Command::Classify { reply } => {
                let result = self.start_pipeline();
                if let Err(err) = &result {
                    tracing::warn!(error = %err, "Classify request rejected");
                }
                let _ = reply.send(result);
            }
        }
    }

    fn start_pipeline(&mut self) -> Result<(), CommandError> {
        let (ticket, image) = self.workflow.begin_classify()?;
        let request_id = Uuid::new_v4();
        counter!("classification_requests_total").increment(1);

        let pipeline = run_pipeline(
            self.encoder.clone(),
            self.classifier.clone(),
            image,
            request_id,
        )
        .map(move |outcome| (ticket, outcome))
        .boxed();

        self.in_flight = Some(pipeline);
        self.publish();
        Ok(())
    }

    fn settle(&mut self, ticket: u64, outcome: Outcome) {
        if !self.workflow.settle(ticket, outcome) {
            counter!("classification_stale_results_total").increment(1);
            tracing::debug!(ticket, "Discarding stale classification result");
            return;
        }

        match self.workflow.state() {
            WorkflowState::Success { outcome, .. } => tracing::info!(
                request_id = %outcome.request_id,
                label = %outcome.label,
                completed_at = %outcome.completed_at,
                "Classification succeeded"
            ),
            WorkflowState::Failed { error, .. } => {
                counter!("classification_failures_total", "kind" => error.kind()).increment(1);
                tracing::warn!(kind = error.kind(), %error, "Classification failed");
            }
            _ => {}
        }
        self.publish();
    }

    fn publish(&self) {
        let state = self.workflow.state().clone();
        tracing::debug!(phase = ?state.phase(), "Workflow transition");
        self.state_tx.send_replace(state);
    }
}

async fn next_settlement(in_flight: &mut Option<InFlight>) -> (u64, Outcome) {
    match in_flight {
        Some(pipeline) => pipeline.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::parse_response;
    use crate::encoder::Base64Encoder;
    use crate::error::ClientError;
    use crate::types::{ClassificationResponse, EncodedPayload, MAX_IMAGE_BYTES, RankedEntry};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    const MESSI_RESPONSE: &str = r#"[{"class":"messi","class_probability":[[70,10,5,10,5]],"class_dictionary":{"messi":0,"virat":1,"serena":2,"roger":3,"sharapova":4}}]"#;

    type Reply = Result<ClassificationResponse, ClientError>;

    fn messi() -> Reply {
        Ok(parse_response(MESSI_RESPONSE.as_bytes()).unwrap())
    }

    /// Answers each call with the next scripted reply.
    struct ScriptedClassifier {
        replies: Mutex<VecDeque<Reply>>,
        calls: AtomicUsize,
    }

    impl ScriptedClassifier {
        fn new(replies: impl IntoIterator<Item = Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().collect()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Classifier for ScriptedClassifier {
        async fn classify(&self, _payload: EncodedPayload) -> Reply {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected classify call")
        }
    }

    /// Holds every request until released.
    struct GatedClassifier {
        release: Notify,
        calls: AtomicUsize,
    }

    impl GatedClassifier {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                release: Notify::new(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Classifier for GatedClassifier {
        async fn classify(&self, _payload: EncodedPayload) -> Reply {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            messi()
        }
    }

    fn start(classifier: Arc<dyn Classifier>) -> WorkflowHandle {
        let (handle, controller) = WorkflowController::new(Arc::new(Base64Encoder), classifier);
        tokio::spawn(controller.run_forever());
        handle
    }

    fn jpeg(size: usize) -> RawFile {
        RawFile::new("face.jpg", "image/jpeg", vec![0xFF; size])
    }

    #[tokio::test]
    async fn successful_classification_ranks_first_prediction() {
        let classifier = ScriptedClassifier::new([messi()]);
        let handle = start(classifier.clone());

        let staged = handle.submit_file(jpeg(2_000_000)).await.unwrap();
        assert_eq!(staged.phase(), Phase::Ready);
        assert_eq!(staged.image().map(ImageHandle::size), Some(2_000_000));

        handle.classify().await.unwrap();
        let state = handle.settled().await.unwrap();

        assert_eq!(state.phase(), Phase::Success);
        assert_eq!(state.winning_label(), Some("messi"));
        assert_eq!(
            state.ranked().unwrap().entries()[0],
            RankedEntry {
                label: "messi".into(),
                probability: 70.0
            }
        );
        assert!(state.error().is_none());
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_response_means_no_face() {
        let handle = start(ScriptedClassifier::new([Ok(Vec::new())]));
        handle.submit_file(jpeg(64)).await.unwrap();
        handle.classify().await.unwrap();

        let state = handle.settled().await.unwrap();
        assert_eq!(state.error(), Some(&WorkflowError::NoFaceDetected));
        assert!(state.image().is_some());
    }

    #[tokio::test]
    async fn server_error_keeps_status_code() {
        let handle = start(ScriptedClassifier::new([Err(ClientError::Server(500))]));
        handle.submit_file(jpeg(64)).await.unwrap();
        handle.classify().await.unwrap();

        let state = handle.settled().await.unwrap();
        assert_eq!(state.error(), Some(&WorkflowError::ServerError(500)));
        assert_eq!(state.error_message().as_deref(), Some("Server error: 500"));
    }

    #[tokio::test]
    async fn oversized_file_fails_before_any_request() {
        let classifier = ScriptedClassifier::new(Vec::<Reply>::new());
        let handle = start(classifier.clone());

        let file = RawFile::new("report.pdf", "image/png", vec![0; 15 * 1024 * 1024]);
        let state = handle.submit_file(file).await.unwrap();
        assert_eq!(state.error(), Some(&WorkflowError::TooLarge));

        assert_eq!(handle.classify().await, Err(CommandError::NoImage));
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn second_classify_while_loading_is_rejected() {
        let classifier = GatedClassifier::new();
        let handle = start(classifier.clone());
        handle.submit_file(jpeg(64)).await.unwrap();

        handle.classify().await.unwrap();
        assert_eq!(handle.state().phase(), Phase::Loading);
        assert_eq!(handle.classify().await, Err(CommandError::AlreadyLoading));
        assert_eq!(handle.state().phase(), Phase::Loading);

        classifier.release.notify_one();
        let state = handle.settled().await.unwrap();
        assert_eq!(state.phase(), Phase::Success);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn new_file_abandons_request_in_flight() {
        let classifier = GatedClassifier::new();
        let handle = start(classifier.clone());
        handle.submit_file(jpeg(64)).await.unwrap();
        handle.classify().await.unwrap();

        // let the pipeline reach the classifier
        while classifier.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let replacement = RawFile::new("other.png", "image/png", vec![1; 32]);
        let state = handle.submit_file(replacement).await.unwrap();
        assert_eq!(state.phase(), Phase::Ready);

        classifier.release.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let state = handle.state();
        assert_eq!(state.phase(), Phase::Ready);
        assert_eq!(state.image().map(ImageHandle::name), Some("other.png"));
        assert!(state.ranked().is_none());
    }

    #[tokio::test]
    async fn failed_classification_can_be_retried() {
        let handle = start(ScriptedClassifier::new([
            Err(ClientError::Connection("refused".into())),
            messi(),
        ]));
        handle.submit_file(jpeg(64)).await.unwrap();

        handle.classify().await.unwrap();
        let failed = handle.settled().await.unwrap();
        assert!(matches!(failed.error(), Some(WorkflowError::ConnectionFailed(_))));

        handle.classify().await.unwrap();
        let state = handle.settled().await.unwrap();
        assert_eq!(state.winning_label(), Some("messi"));
    }

    #[tokio::test]
    async fn dangling_index_is_a_malformed_response() {
        let body = br#"[{"class":"messi","class_probability":[[100]],"class_dictionary":{"messi":0,"roger":3}}]"#;
        let handle = start(ScriptedClassifier::new([Ok(parse_response(body).unwrap())]));
        handle.submit_file(jpeg(64)).await.unwrap();
        handle.classify().await.unwrap();

        let state = handle.settled().await.unwrap();
        assert!(matches!(state.error(), Some(WorkflowError::MalformedResponse(_))));
    }

    #[tokio::test]
    async fn submitting_clears_previous_result() {
        let handle = start(ScriptedClassifier::new([messi()]));
        handle.submit_file(jpeg(64)).await.unwrap();
        handle.classify().await.unwrap();
        assert_eq!(handle.settled().await.unwrap().phase(), Phase::Success);

        let state = handle
            .submit_file(RawFile::new("notes.txt", "text/plain", b"hi".to_vec()))
            .await
            .unwrap();
        assert_eq!(state.error(), Some(&WorkflowError::NotAnImage));
        assert!(state.ranked().is_none());
        assert!(state.image().is_none());
    }

    #[tokio::test]
    async fn classify_without_image_is_rejected() {
        let handle = start(ScriptedClassifier::new(Vec::<Reply>::new()));
        assert_eq!(handle.classify().await, Err(CommandError::NoImage));
        assert_eq!(handle.state(), WorkflowState::Idle);
    }

    #[tokio::test]
    async fn controller_stops_when_handles_are_dropped() {
        let classifier = ScriptedClassifier::new(Vec::<Reply>::new());
        let (handle, controller) = WorkflowController::new(Arc::new(Base64Encoder), classifier);
        let task = tokio::spawn(controller.run_forever());
        drop(handle);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn stale_settlement_is_discarded() {
        let mut workflow = Workflow::default();
        workflow.submit_file(jpeg(16));
        let (ticket, _) = workflow.begin_classify().unwrap();

        workflow.submit_file(jpeg(32));
        assert!(!workflow.settle(ticket, Err(WorkflowError::NoFaceDetected)));
        assert_eq!(workflow.state().phase(), Phase::Ready);
        assert_eq!(workflow.state().image().map(ImageHandle::size), Some(32));
    }

    #[test]
    fn boundary_sized_image_is_staged() {
        let mut workflow = Workflow::default();
        let state = workflow.submit_file(jpeg(MAX_IMAGE_BYTES));
        assert_eq!(state.phase(), Phase::Ready);
    }
}
