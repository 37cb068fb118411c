//! End-to-end tests of the recognition pipeline with scripted backends.

use image::{Rgba, RgbaImage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vision_navigator::config::{TimingConfig, MAX_CACHE_TTL};
use vision_navigator::handoff::{self, ConsumerQueue};
use vision_navigator::{
    BackendAdapter, BackendKind, Config, ConsentPolicy, FailureKind, FallbackController,
    NavigationError, NavigationState, NormalizeOptions, PolicyConsent, RecognitionError,
    RecognitionEvent, RecognitionOrchestrator, RecognitionStatus, ResultCache, Screenshot,
};

const THREE_ELEMENTS: &str = r#"Sure, here they are:
[
  {"type":"icon_button","text":"","bbox":[100,500,140,540],"confidence":0.92,"actionable":true},
  {"type":"text","text":"Team meeting","bbox":[10,10,300,40],"confidence":0.88,"actionable":false},
  {"type":"button","text":"Leave","bbox":[400,500,480,540],"confidence":0.95,"actionable":true}
]"#;

const LOW_CONFIDENCE_BUTTON: &str =
    r#"[{"type":"button","text":"Delete","bbox":[20,20,80,50],"confidence":0.65,"actionable":true}]"#;

enum Reply {
    Raw(&'static str),
    After(Duration, &'static str),
    Fail(FailureKind),
    Hang,
    Panic,
}

struct FakeBackend {
    kind: BackendKind,
    reply: Reply,
    calls: AtomicUsize,
}

impl FakeBackend {
    fn new(kind: BackendKind, reply: Reply) -> Arc<Self> {
        Arc::new(Self {
            kind,
            reply,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl BackendAdapter for FakeBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn model_name(&self) -> &str {
        "fake-model"
    }

    fn ready(&self) -> bool {
        true
    }

    async fn run_model(&self, _: &Screenshot, _: Duration) -> Result<String, FailureKind> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.reply {
            Reply::Raw(raw) => Ok(raw.to_string()),
            Reply::After(delay, raw) => {
                tokio::time::sleep(*delay).await;
                Ok(raw.to_string())
            }
            Reply::Fail(failure) => Err(failure.clone()),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok("[]".to_string())
            }
            Reply::Panic => panic!("backend crashed"),
        }
    }
}

fn screenshot(shade: u8) -> Screenshot {
    Screenshot::new(
        RgbaImage::from_pixel(640, 600, Rgba([shade, shade, shade, 255])),
        "test window",
    )
}

fn engine(
    adapters: Vec<Arc<FakeBackend>>,
    cache: Option<Arc<ResultCache>>,
    consent: ConsentPolicy,
) -> (Arc<RecognitionOrchestrator>, ConsumerQueue) {
    let config = Config::default();
    let adapters: Vec<Arc<dyn BackendAdapter>> = adapters
        .into_iter()
        .map(|a| a as Arc<dyn BackendAdapter>)
        .collect();

    let controller = FallbackController::new(
        adapters,
        Arc::new(PolicyConsent::new(consent)),
        &TimingConfig::default(),
        NormalizeOptions::default(),
    );

    let (handoff, queue) = handoff::channel();
    let orchestrator = RecognitionOrchestrator::new(&config, controller, cache, Some(handoff));
    (Arc::new(orchestrator), queue)
}

fn memory_cache(ttl: Duration, max_entries: usize) -> Arc<ResultCache> {
    Arc::new(ResultCache::open_in_memory(ttl, max_entries).unwrap())
}

#[tokio::test(start_paused = true)]
async fn test_timeout_then_remote_result_is_cached() {
    let gpu = FakeBackend::new(BackendKind::AcceleratedLocal, Reply::Hang);
    let cloud = FakeBackend::new(BackendKind::RemoteApi, Reply::Raw(THREE_ELEMENTS));
    let cache = memory_cache(Duration::from_secs(300), 100);
    let (orchestrator, _queue) = engine(
        vec![gpu.clone(), cloud.clone()],
        Some(cache.clone()),
        ConsentPolicy::Always,
    );

    let shot = screenshot(1);
    let first = orchestrator.recognize(&shot).await.unwrap();

    assert_eq!(first.backend_used, BackendKind::RemoteApi);
    assert_eq!(first.status, RecognitionStatus::Success);
    assert_eq!(first.elements.len(), 3);
    assert!(!first.from_cache);
    assert!(first.latency_ms >= 15_000);
    assert_eq!(first.expires_at - first.created_at, chrono::Duration::seconds(300));
    // Reading order and placeholder text
    assert_eq!(first.elements[0].text, "Team meeting");
    assert_eq!(first.elements[1].text, "unrecognized button");
    assert!(cache.contains(&shot.fingerprint()).unwrap());

    let second = orchestrator.recognize(&shot).await.unwrap();
    assert!(second.from_cache);
    assert_eq!(second.elements, first.elements);
    assert_eq!(second.backend_used, BackendKind::RemoteApi);
    assert_eq!(cache.hit_count(&shot.fingerprint()).unwrap(), Some(1));

    // No backend ran for the hit
    assert_eq!(gpu.calls(), 1);
    assert_eq!(cloud.calls(), 1);

    let stats = orchestrator.stats();
    assert_eq!(stats.recognitions, 2);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.fallbacks, 1);
    assert_eq!(stats.remote_uses, 1);
}

#[tokio::test(start_paused = true)]
async fn test_fallback_answers_within_first_timeout() {
    let gpu = FakeBackend::new(BackendKind::AcceleratedLocal, Reply::Hang);
    let cpu = FakeBackend::new(BackendKind::CpuLocal, Reply::Raw(THREE_ELEMENTS));
    let (orchestrator, _queue) = engine(vec![gpu, cpu], None, ConsentPolicy::Ask);

    let started = tokio::time::Instant::now();
    let result = orchestrator.recognize(&screenshot(2)).await.unwrap();

    assert_eq!(result.backend_used, BackendKind::CpuLocal);
    assert!(started.elapsed() < Duration::from_secs(16));
}

#[tokio::test]
async fn test_zero_ttl_always_runs_backend() {
    let cpu = FakeBackend::new(BackendKind::CpuLocal, Reply::Raw(THREE_ELEMENTS));
    let cache = memory_cache(Duration::ZERO, 100);
    let (orchestrator, _queue) = engine(vec![cpu.clone()], Some(cache), ConsentPolicy::Ask);

    let shot = screenshot(3);
    assert!(!orchestrator.recognize(&shot).await.unwrap().from_cache);
    assert!(!orchestrator.recognize(&shot).await.unwrap().from_cache);
    assert_eq!(cpu.calls(), 2);
}

#[tokio::test]
async fn test_lru_keeps_recently_used_screenshot() {
    let cpu = FakeBackend::new(BackendKind::CpuLocal, Reply::Raw(THREE_ELEMENTS));
    let cache = memory_cache(Duration::from_secs(300), 2);
    let (orchestrator, _queue) =
        engine(vec![cpu.clone()], Some(cache.clone()), ConsentPolicy::Ask);

    let (a, b, c) = (screenshot(10), screenshot(11), screenshot(12));
    orchestrator.recognize(&a).await.unwrap();
    orchestrator.recognize(&b).await.unwrap();
    assert!(orchestrator.recognize(&a).await.unwrap().from_cache);
    orchestrator.recognize(&c).await.unwrap();

    assert!(cache.contains(&a.fingerprint()).unwrap());
    assert!(!cache.contains(&b.fingerprint()).unwrap());
    assert!(cache.contains(&c.fingerprint()).unwrap());
    assert_eq!(cpu.calls(), 3);
}

#[tokio::test]
async fn test_all_backends_failed_is_typed_and_not_cached() {
    let gpu = FakeBackend::new(
        BackendKind::AcceleratedLocal,
        Reply::Fail(FailureKind::Unavailable("no device".to_string())),
    );
    let cpu = FakeBackend::new(
        BackendKind::CpuLocal,
        Reply::Fail(FailureKind::TransientError("out of memory".to_string())),
    );
    let cache = memory_cache(Duration::from_secs(300), 100);
    let (orchestrator, _queue) = engine(vec![gpu, cpu], Some(cache.clone()), ConsentPolicy::Ask);

    let shot = screenshot(4);
    let err = orchestrator.recognize(&shot).await.unwrap_err();

    assert_eq!(
        err,
        RecognitionError::AllBackendsFailed {
            last: FailureKind::TransientError("out of memory".to_string())
        }
    );
    assert!(!cache.contains(&shot.fingerprint()).unwrap());
    assert_eq!(cache.stats().unwrap().entries, 0);
}

#[tokio::test]
async fn test_second_submit_rejected_while_busy() {
    let gpu = FakeBackend::new(BackendKind::AcceleratedLocal, Reply::Hang);
    let (orchestrator, mut queue) = engine(vec![gpu], None, ConsentPolicy::Ask);

    let handle = orchestrator.submit(screenshot(5)).unwrap();
    assert!(orchestrator.is_busy());
    assert!(matches!(
        orchestrator.submit(screenshot(6)),
        Err(RecognitionError::Busy)
    ));
    assert!(matches!(
        orchestrator.recognize(&screenshot(6)).await,
        Err(RecognitionError::Busy)
    ));

    assert!(orchestrator.cancel());
    handle.await.unwrap();

    assert!(matches!(
        queue.recv().await,
        Some(RecognitionEvent::Failed(RecognitionError::Cancelled))
    ));
    assert!(!orchestrator.is_busy());
    assert_eq!(orchestrator.stats().busy_rejections, 2);
}

#[tokio::test]
async fn test_cancel_abandons_running_backend() {
    let gpu = FakeBackend::new(BackendKind::AcceleratedLocal, Reply::Hang);
    let cpu = FakeBackend::new(BackendKind::CpuLocal, Reply::Raw(THREE_ELEMENTS));
    let (orchestrator, mut queue) = engine(vec![gpu.clone(), cpu.clone()], None, ConsentPolicy::Ask);

    let handle = orchestrator.submit(screenshot(7)).unwrap();
    // Let the worker reach the first backend
    while gpu.calls() == 0 {
        tokio::task::yield_now().await;
    }

    let cancelled_at = std::time::Instant::now();
    assert!(orchestrator.cancel());
    handle.await.unwrap();
    assert!(cancelled_at.elapsed() < Duration::from_secs(1));

    assert!(matches!(
        queue.recv().await,
        Some(RecognitionEvent::Failed(RecognitionError::Cancelled))
    ));
    // Cancelled requests do not move on to the next backend
    assert_eq!(cpu.calls(), 0);
    assert_eq!(orchestrator.stats().cancellations, 1);

    // The slot is free again
    assert!(orchestrator.submit(screenshot(8)).is_ok());
    assert!(orchestrator.cancel());
}

#[tokio::test]
async fn test_backend_panic_becomes_internal_error() {
    let gpu = FakeBackend::new(BackendKind::AcceleratedLocal, Reply::Panic);
    let (orchestrator, mut queue) = engine(vec![gpu], None, ConsentPolicy::Ask);

    orchestrator.submit(screenshot(9)).unwrap().await.unwrap();

    assert!(matches!(
        queue.recv().await,
        Some(RecognitionEvent::Failed(RecognitionError::Internal(_)))
    ));
    assert!(!orchestrator.is_busy());
}

#[tokio::test]
async fn test_recognize_panic_becomes_internal_error() {
    let gpu = FakeBackend::new(BackendKind::AcceleratedLocal, Reply::Panic);
    let (orchestrator, _queue) = engine(vec![gpu], None, ConsentPolicy::Ask);

    let shot = screenshot(9);
    let outcome = orchestrator.recognize(&shot).await;

    assert!(matches!(
        outcome,
        Err(RecognitionError::Internal(msg)) if msg.contains("backend crashed")
    ));
    assert_eq!(orchestrator.stats().failures, 1);
    assert!(!orchestrator.is_busy());

    // The engine still takes new work
    assert!(orchestrator.submit(screenshot(16)).is_ok());
}

#[tokio::test]
async fn test_huge_ttl_result_still_cached() {
    let cpu = FakeBackend::new(BackendKind::CpuLocal, Reply::Raw(THREE_ELEMENTS));
    let cache = memory_cache(Duration::from_secs(10_000_000_000_000), 10);
    let (orchestrator, _queue) = engine(vec![cpu.clone()], Some(cache), ConsentPolicy::Ask);

    let shot = screenshot(17);
    let first = orchestrator.recognize(&shot).await.unwrap();
    assert_eq!(
        first.expires_at - first.created_at,
        chrono::Duration::from_std(MAX_CACHE_TTL).unwrap()
    );

    assert!(orchestrator.recognize(&shot).await.unwrap().from_cache);
    assert_eq!(cpu.calls(), 1);
}

#[tokio::test]
async fn test_cached_recognition_is_fast() {
    let cpu = FakeBackend::new(BackendKind::CpuLocal, Reply::Raw(THREE_ELEMENTS));
    let cache = memory_cache(Duration::from_secs(300), 10);
    let (orchestrator, _queue) = engine(vec![cpu], Some(cache), ConsentPolicy::Ask);

    let shot = Screenshot::new(
        RgbaImage::from_pixel(64, 64, Rgba([40, 40, 40, 255])),
        "small window",
    );
    orchestrator.recognize(&shot).await.unwrap();

    let started = std::time::Instant::now();
    let second = orchestrator.recognize(&shot).await.unwrap();
    let elapsed = started.elapsed();

    assert!(second.from_cache);
    assert!(elapsed < Duration::from_millis(10), "cache hit took {:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_progress_then_result_delivered_in_order() {
    let cpu = FakeBackend::new(
        BackendKind::CpuLocal,
        Reply::After(Duration::from_secs(7), THREE_ELEMENTS),
    );
    let (orchestrator, mut queue) = engine(vec![cpu], None, ConsentPolicy::Ask);

    orchestrator.submit(screenshot(13)).unwrap();

    match queue.recv().await {
        Some(RecognitionEvent::Progress { elapsed }) => {
            assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(6));
        }
        other => panic!("expected progress, got {:?}", other),
    }
    match queue.recv().await {
        Some(RecognitionEvent::Completed(result)) => assert_eq!(result.elements.len(), 3),
        other => panic!("expected result, got {:?}", other),
    }
}

#[tokio::test]
async fn test_low_confidence_element_needs_confirmation() {
    let cpu = FakeBackend::new(BackendKind::CpuLocal, Reply::Raw(LOW_CONFIDENCE_BUTTON));
    let (orchestrator, _queue) = engine(vec![cpu], None, ConsentPolicy::Ask);

    let result = orchestrator.recognize(&screenshot(14)).await.unwrap();
    assert_eq!(result.status, RecognitionStatus::PartialSuccess);

    let mut navigation = NavigationState::new(Config::default().recognition.activation_threshold);
    navigation.load(result.elements);
    navigation.next();

    assert_eq!(
        navigation.activate(),
        Err(NavigationError::NeedsConfirmation {
            description: "Delete".to_string(),
            center: (50, 35),
            confidence: 0.65,
        })
    );
    assert_eq!(navigation.force_activate(), Ok((50, 35)));
}

#[tokio::test]
async fn test_remote_refused_without_consent() {
    let cloud = FakeBackend::new(BackendKind::RemoteApi, Reply::Raw(THREE_ELEMENTS));
    let (orchestrator, _queue) = engine(vec![cloud.clone()], None, ConsentPolicy::Ask);

    let err = orchestrator.recognize(&screenshot(15)).await.unwrap_err();
    assert!(matches!(err, RecognitionError::AllBackendsFailed { .. }));
    assert_eq!(cloud.calls(), 0);
}
