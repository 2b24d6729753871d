use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use forge_core::config::BatchConfig;
use forge_core::{DomainEvent, EventLevel};
use forge_pipeline::{
    Admission, Batch, BatchPipeline, FlushReason, MemoryEventStore, PersistBatches,
    PipelineError, SourceFilter,
};
use tokio::time::sleep;

fn config(window_ms: u64, max: usize) -> BatchConfig {
    BatchConfig {
        flush_window_ms: window_ms,
        max_batch_size: max,
    }
}

fn collect(pipeline: &BatchPipeline) -> Arc<Mutex<Vec<Arc<Batch>>>> {
    let out = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&out);
    pipeline.on_batch(move |b: &Arc<Batch>| sink.lock().unwrap().push(Arc::clone(b)));
    out
}

fn ev(i: usize) -> DomainEvent {
    DomainEvent::new(EventLevel::Info, "api", format!("event {i}"))
}

#[tokio::test(start_paused = true)]
async fn burst_of_150_flushes_100_then_50() {
    let pipeline = BatchPipeline::spawn(config(1000, 100), Arc::new(SourceFilter::default()));
    let batches = collect(&pipeline);

    for i in 0..150 {
        assert_eq!(pipeline.submit(ev(i)).unwrap(), Admission::Accepted);
    }
    // Well under the window: only the size-triggered batch exists.
    sleep(Duration::from_millis(10)).await;
    {
        let got = batches.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].len(), 100);
        assert_eq!(got[0].reason, FlushReason::Size);
    }

    sleep(Duration::from_millis(1100)).await;
    let got = batches.lock().unwrap();
    let sizes: Vec<_> = got.iter().map(|b| b.len()).collect();
    assert_eq!(sizes, vec![100, 50]);
    assert_eq!(got[1].reason, FlushReason::Window);
}

#[tokio::test(start_paused = true)]
async fn steady_trickle_still_flushes_every_window() {
    let pipeline = BatchPipeline::spawn(config(1000, 100), Arc::new(SourceFilter::default()));
    let batches = collect(&pipeline);

    // One event every 300 ms for 3 s. Each submission must not push the
    // window out, so a flush lands at least once per second.
    for i in 0..10 {
        pipeline.submit(ev(i)).unwrap();
        sleep(Duration::from_millis(300)).await;
    }
    sleep(Duration::from_millis(1000)).await;

    let got = batches.lock().unwrap();
    assert!(got.len() >= 3, "expected at least 3 windows, got {}", got.len());
    assert!(got.iter().all(|b| b.reason == FlushReason::Window));
    assert_eq!(got.iter().map(|b| b.len()).sum::<usize>(), 10);
}

#[tokio::test(start_paused = true)]
async fn batches_are_never_empty_and_never_share_events() {
    let pipeline = BatchPipeline::spawn(config(50, 7), Arc::new(SourceFilter::default()));
    let batches = collect(&pipeline);

    for i in 0..40 {
        pipeline.submit(ev(i)).unwrap();
        if i % 9 == 0 {
            sleep(Duration::from_millis(60)).await;
        }
    }
    sleep(Duration::from_millis(500)).await;

    let got = batches.lock().unwrap();
    let mut ids = HashSet::new();
    for batch in got.iter() {
        assert!(!batch.is_empty());
        for event in batch.events() {
            assert!(ids.insert(event.id.clone()), "event in two batches");
        }
    }
    assert_eq!(ids.len(), 40);

    let seqs: Vec<_> = got.iter().map(|b| b.seq).collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    assert_eq!(seqs, sorted);
}

#[tokio::test(start_paused = true)]
async fn idle_pipeline_emits_nothing() {
    let pipeline = BatchPipeline::spawn(config(100, 10), Arc::new(SourceFilter::default()));
    let batches = collect(&pipeline);
    sleep(Duration::from_secs(10)).await;
    pipeline.flush();
    sleep(Duration::from_millis(1)).await;
    assert!(batches.lock().unwrap().is_empty());
}

#[tokio::test]
async fn every_consumer_sees_the_same_batch() {
    let pipeline = BatchPipeline::spawn(config(1000, 2), Arc::new(SourceFilter::default()));
    let a = collect(&pipeline);
    let b = collect(&pipeline);

    pipeline.submit(ev(0)).unwrap();
    pipeline.submit(ev(1)).unwrap();
    pipeline.shutdown().await;

    let a = a.lock().unwrap();
    let b = b.lock().unwrap();
    assert_eq!(a.len(), 1);
    assert!(Arc::ptr_eq(&a[0], &b[0]));
}

#[tokio::test]
async fn shutdown_drains_then_rejects() {
    let pipeline = BatchPipeline::spawn(config(60_000, 100), Arc::new(SourceFilter::default()));
    let batches = collect(&pipeline);

    for i in 0..5 {
        pipeline.submit(ev(i)).unwrap();
    }
    pipeline.shutdown().await;

    {
        let got = batches.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].len(), 5);
        assert_eq!(got[0].reason, FlushReason::Drain);
    }

    assert_eq!(pipeline.submit(ev(99)), Err(PipelineError::ShutDown));
    assert_eq!(pipeline.stats().rejected, 1);
    // A second shutdown is harmless.
    pipeline.shutdown().await;
}

#[tokio::test]
async fn filtered_events_never_reach_consumers() {
    let pipeline = BatchPipeline::spawn(config(1000, 100), Arc::new(SourceFilter::default()));
    let batches = collect(&pipeline);

    let meta = DomainEvent::new(EventLevel::Info, "forge_pipeline::pipeline", "batch flushed");
    assert_eq!(pipeline.submit(meta).unwrap(), Admission::Filtered);
    pipeline.submit(ev(1)).unwrap();
    pipeline.shutdown().await;

    let got = batches.lock().unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].events()[0].message, "event 1");
    let stats = pipeline.stats();
    assert_eq!((stats.submitted, stats.filtered), (1, 1));
}

#[tokio::test]
async fn persist_adapter_appends_in_order() {
    let pipeline = BatchPipeline::spawn(config(1000, 3), Arc::new(SourceFilter::default()));
    let store = Arc::new(MemoryEventStore::new(100));
    pipeline.on_batch(PersistBatches::new(Arc::clone(&store)));

    for i in 0..4 {
        pipeline.submit(ev(i)).unwrap();
    }
    pipeline.shutdown().await;

    let msgs: Vec<_> = store.recent(10).into_iter().map(|e| e.message).collect();
    assert_eq!(msgs, vec!["event 3", "event 2", "event 1", "event 0"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn accepted_events_are_never_lost_across_shutdown() {
    let pipeline = BatchPipeline::spawn(config(1000, 64), Arc::new(SourceFilter::default()));
    let batches = collect(&pipeline);

    let submitters: Vec<_> = (0..4)
        .map(|t| {
            let pipeline = pipeline.clone();
            std::thread::spawn(move || {
                let mut accepted = 0usize;
                for i in 0.. {
                    match pipeline.submit(ev(t * 1_000_000 + i)) {
                        Ok(_) => accepted += 1,
                        Err(PipelineError::ShutDown) => break,
                    }
                    if i % 64 == 0 {
                        std::thread::sleep(Duration::from_micros(200));
                    }
                }
                accepted
            })
        })
        .collect();

    sleep(Duration::from_millis(20)).await;
    pipeline.shutdown().await;
    let accepted: usize = submitters.into_iter().map(|s| s.join().unwrap()).sum();

    let flushed: usize = batches.lock().unwrap().iter().map(|b| b.len()).sum();
    assert!(accepted > 0);
    assert_eq!(flushed, accepted);
    assert_eq!(pipeline.stats().events_flushed as usize, accepted);
}
