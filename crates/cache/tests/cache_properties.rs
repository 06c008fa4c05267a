//! End-to-end properties of the decode/upload cache, driven through the
//! public API: task issuance, the at-raster fallback, budget idempotence
//! under cancellation, variant reuse and orphaning, and the decode race
//! between the task system and the at-raster path.

use rasterline_cache::{CacheConfig, ImageCache, TracingInfo, UploadTask};
use rasterline_core::{
    Bitmap, DrawImage, FilterQuality, IntRect, IntSize, PixelSource, PixelSourceError,
    SourceImage, Transform2d,
};
use rasterline_render::{BackendCounters, GraphicsContext, TestBackend};
use rasterline_scheduler::{CacheTask, TaskRunner, WorkerPoolConfig};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

struct TestSource {
    size: IntSize,
    decodes: AtomicU32,
}

impl TestSource {
    fn new(width: u32, height: u32) -> Self {
        Self {
            size: IntSize::new(width, height),
            decodes: AtomicU32::new(0),
        }
    }
}

impl PixelSource for TestSource {
    fn size(&self) -> IntSize {
        self.size
    }

    fn decode(&self) -> Result<Bitmap, PixelSourceError> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        Ok(Bitmap::new_filled(self.size, [42, 42, 42, 255]))
    }
}

/// Source whose decode blocks until two threads are decoding at once.
struct GatedSource {
    size: IntSize,
    barrier: Barrier,
    decodes: AtomicU32,
}

impl PixelSource for GatedSource {
    fn size(&self) -> IntSize {
        self.size
    }

    fn decode(&self) -> Result<Bitmap, PixelSourceError> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        self.barrier.wait();
        Ok(Bitmap::new_filled(self.size, [9, 9, 9, 255]))
    }
}

fn gpu_cache(byte_limit: usize) -> (Arc<ImageCache>, BackendCounters) {
    let backend = TestBackend::new();
    let counters = backend.counters();
    let context = Arc::new(GraphicsContext::new(Box::new(backend)));
    let config = CacheConfig::new()
        .with_byte_limit(byte_limit)
        .with_preferred_item_limit(100);
    (Arc::new(ImageCache::new(config, context)), counters)
}

fn draw(image: &SourceImage, quality: FilterQuality, scale: f32) -> DrawImage {
    DrawImage::new(image.clone(), quality, Transform2d::scale(scale, scale))
}

/// Run an issued task graph inline, the way the runner would
fn run_task_graph(task: &Arc<UploadTask>) {
    if let Some(decode) = task.decode_task().cloned() {
        decode.run();
        decode.on_complete();
    }
    task.run();
    task.on_complete();
}

#[test]
fn skipped_requests_touch_nothing() {
    let (cache, counters) = gpu_cache(1 << 20);
    let image = SourceImage::new(Arc::new(TestSource::new(100, 100)));

    // Empty clipped sub-rectangle
    let off_image = draw(&image, FilterQuality::Low, 1.0)
        .with_src_rect(IntRect::new(500, 500, 10, 10));
    // Zero scale component
    let flat = draw(&image, FilterQuality::Low, 0.0);

    for desc in [&off_image, &flat] {
        let result = cache.get_task_for_image_and_ref(desc, TracingInfo::default());
        assert!(result.task.is_none());
        assert!(!result.needs_unref);

        let context = cache.context().clone();
        let mut guard = context.lock();
        let decoded = cache.get_decoded_image_for_draw(&mut guard, desc);
        assert!(decoded.surface.is_none());
    }

    assert_eq!(cache.bytes_used(), 0);
    assert_eq!(cache.item_count(), 0);
    assert_eq!(counters.created(), 0);
    let stats = cache.stats();
    assert_eq!(stats.tasks_issued, 0);
    assert_eq!(stats.at_raster_decodes, 0);
}

#[test]
fn equivalent_draws_share_one_record_and_task() {
    let (cache, _) = gpu_cache(1 << 20);
    let source = Arc::new(TestSource::new(500, 200));
    let image = SourceImage::new(source.clone());

    // Scale 0.5 and 0.49 with Medium quality canonicalize to the same
    // downsample level
    let a = draw(&image, FilterQuality::Medium, 0.5);
    let b = draw(&image, FilterQuality::Medium, 0.49);

    let first = cache.get_task_for_image_and_ref(&a, TracingInfo::default());
    let second = cache.get_task_for_image_and_ref(&b, TracingInfo::default());
    let task_a = first.task.expect("task for 0.5");
    let task_b = second.task.expect("task for 0.49");
    assert!(
        Arc::ptr_eq(&task_a, &task_b),
        "second request piggybacks on the in-flight task"
    );

    run_task_graph(&task_a);
    assert_eq!(source.decodes.load(Ordering::SeqCst), 1, "one decode total");
    assert_eq!(cache.item_count(), 1);
    assert_eq!(cache.bytes_used(), 250 * 100 * 4);

    cache.unref_image(&a);
    cache.unref_image(&b);
    assert_eq!(cache.bytes_used(), 250 * 100 * 4, "variant stays resident");
}

/// Worker task that blocks until released, to pin the single worker
/// thread while other tasks sit in the queue.
struct BlockerTask {
    started: Arc<Barrier>,
    release: Arc<Barrier>,
}

impl CacheTask for BlockerTask {
    fn run(&self) {
        self.started.wait();
        self.release.wait();
    }
    fn on_complete(&self) {}
    fn affinity(&self) -> rasterline_scheduler::TaskAffinity {
        rasterline_scheduler::TaskAffinity::Worker
    }
}

#[test]
fn cancel_then_unref_is_budget_idempotent() {
    let (cache, counters) = gpu_cache(1 << 20);
    let image = SourceImage::new(Arc::new(TestSource::new(128, 128)));
    let desc = draw(&image, FilterQuality::Low, 1.0);
    let before = cache.bytes_used();

    // Pin the single worker so the victim tasks provably never run
    let runner =
        TaskRunner::new(WorkerPoolConfig::new(1).with_poll_interval(Duration::from_millis(1)));
    let started = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    runner.submit(Arc::new(BlockerTask {
        started: started.clone(),
        release: release.clone(),
    }));
    started.wait();

    let result = cache.get_task_for_image_and_ref(&desc, TracingInfo::default());
    let upload = result.task.expect("task issued");
    let decode = upload.decode_task().expect("decode dependency").clone();
    let decode_id = runner.submit(decode);
    // The upload waits on its decode dependency, so it stays pending too
    let upload_id = runner.submit(upload.clone() as Arc<dyn CacheTask>);

    assert!(runner.cancel(upload_id));
    assert!(runner.cancel(decode_id));
    cache.unref_image(&desc);

    assert_eq!(cache.bytes_used(), before);
    assert_eq!(counters.created(), 0);

    release.wait();
    assert!(runner.wait_until_idle(Duration::from_secs(5)));
    runner.shutdown();
}

#[test]
fn growing_scale_orphans_stale_variant() {
    let (cache, counters) = gpu_cache(1 << 20);
    let image = SourceImage::new(Arc::new(TestSource::new(500, 200)));

    // Cache a deep variant (mip 2)
    let small = draw(&image, FilterQuality::Medium, 0.2);
    let result = cache.get_task_for_image_and_ref(&small, TracingInfo::default());
    run_task_graph(&result.task.expect("task issued"));
    cache.unref_image(&small);
    assert_eq!(cache.bytes_used(), 125 * 50 * 4);

    // Slightly larger scale still fits the cached variant's detail
    let similar = draw(&image, FilterQuality::Medium, 0.22);
    let reuse = cache.get_task_for_image_and_ref(&similar, TracingInfo::default());
    assert!(reuse.task.is_none(), "served from the cached variant");
    cache.unref_image(&similar);

    // A scale past the variant's mip level orphans it
    let big = draw(&image, FilterQuality::Medium, 0.45);
    let result = cache.get_task_for_image_and_ref(&big, TracingInfo::default());
    let task = result.task.expect("new variant needs new work");
    run_task_graph(&task);
    cache.unref_image(&big);

    assert_eq!(
        cache.bytes_used(),
        250 * 100 * 4,
        "exactly one resident variant after the old one is released"
    );
    let context = cache.context().clone();
    let mut guard = context.lock();
    cache.flush_deferred_releases(&mut guard);
    drop(guard);
    assert_eq!(counters.live_textures(), 1);
}

#[test]
fn zero_budget_forces_at_raster_with_no_net_bytes() {
    let (cache, counters) = gpu_cache(1 << 20);
    cache.set_aggressively_free_resources(true);

    let image = SourceImage::new(Arc::new(TestSource::new(64, 64)));
    let desc = draw(&image, FilterQuality::Low, 1.0);

    let result = cache.get_task_for_image_and_ref(&desc, TracingInfo::default());
    assert!(result.task.is_none(), "zero budget admits nothing");
    assert!(!result.needs_unref);

    let context = cache.context().clone();
    let mut guard = context.lock();
    let decoded = cache.get_decoded_image_for_draw(&mut guard, &desc);
    assert!(decoded.at_raster);
    assert!(decoded.surface.is_some());
    assert_eq!(cache.bytes_used(), 0);

    cache.draw_with_image_finished(&mut guard, &desc, decoded);
    drop(guard);

    assert_eq!(cache.bytes_used(), 0, "no net change after the draw");
    assert_eq!(counters.live_textures(), 0);
}

#[test]
fn concurrent_task_and_at_raster_decode_converge_on_one_result() {
    let (cache, _) = gpu_cache(1 << 20);
    let source = Arc::new(GatedSource {
        size: IntSize::new(80, 80),
        barrier: Barrier::new(2),
        decodes: AtomicU32::new(0),
    });
    let image = SourceImage::new(source.clone());
    let desc = draw(&image, FilterQuality::Low, 1.0);

    let result = cache.get_task_for_image_and_ref(&desc, TracingInfo::default());
    let upload = result.task.expect("task issued");
    let decode = upload.decode_task().expect("decode dependency").clone();

    // The task decodes on a worker while the raster thread decodes the
    // same record inline; the gate guarantees both are mid-decode at
    // once, so the loser must discard its result.
    let worker = thread::spawn(move || {
        decode.run();
        decode.on_complete();
    });

    let context = cache.context().clone();
    let mut guard = context.lock();
    let decoded = cache.get_decoded_image_for_draw(&mut guard, &desc);
    drop(guard);
    let surface = decoded.surface.clone().expect("inline surface");
    worker.join().expect("worker decode");

    assert_eq!(source.decodes.load(Ordering::SeqCst), 2, "both decoded");
    let report = cache.memory_report();
    assert_eq!(report.len(), 1);
    assert_eq!(
        report[0].decoded_bytes,
        80 * 80 * 4,
        "one resident decode buffer, the duplicate was discarded"
    );
    assert!(surface.is_gpu());

    // The upload task now finds the surface resident and is a no-op
    upload.run();
    upload.on_complete();

    let mut guard = context.lock();
    cache.draw_with_image_finished(&mut guard, &desc, decoded);
    drop(guard);
    cache.unref_image(&desc);
}

#[test]
fn medium_above_half_scale_shares_low_quality_canonical_decode() {
    let (cache, _) = gpu_cache(1 << 20);
    let source = Arc::new(TestSource::new(500, 200));
    let image = SourceImage::new(source.clone());

    // Low-quality draw caches the canonical full-resolution decode
    let low = draw(&image, FilterQuality::Low, 0.7);
    let result = cache.get_task_for_image_and_ref(&low, TracingInfo::default());
    run_task_graph(&result.task.expect("task issued"));
    cache.unref_image(&low);
    assert_eq!(source.decodes.load(Ordering::SeqCst), 1);

    // Medium draws above half scale decode at full size and reuse it
    for scale in [0.6, 0.8, 0.99] {
        let medium = draw(&image, FilterQuality::Medium, scale);
        let result = cache.get_task_for_image_and_ref(&medium, TracingInfo::default());
        assert!(result.task.is_none(), "no duplicate work at scale {scale}");
        assert!(result.needs_unref);
        cache.unref_image(&medium);
    }

    assert_eq!(source.decodes.load(Ordering::SeqCst), 1, "single decode");
    assert_eq!(cache.item_count(), 1);
    assert_eq!(cache.bytes_used(), 500 * 200 * 4);
}

#[test]
fn runner_drives_task_graphs_to_resident_surfaces() {
    let (cache, counters) = gpu_cache(64 << 20);
    let runner = TaskRunner::new(WorkerPoolConfig::new(4).with_poll_interval(Duration::from_millis(1)));

    let mut draws = Vec::new();
    for i in 0u32..16 {
        let image = SourceImage::new(Arc::new(TestSource::new(32 + i, 32 + i)));
        let desc = draw(&image, FilterQuality::Low, 1.0);
        let result = cache.get_task_for_image_and_ref(&desc, TracingInfo { frame_id: 1 });
        let task = result.task.expect("task issued");
        runner.submit(task as Arc<dyn CacheTask>);
        draws.push(desc);
    }

    assert!(runner.wait_until_idle(Duration::from_secs(10)));
    assert_eq!(counters.created(), 16, "every image uploaded exactly once");

    // Everything is now served from the cache
    for desc in &draws {
        let result = cache.get_task_for_image_and_ref(desc, TracingInfo { frame_id: 2 });
        assert!(result.task.is_none());
        assert!(result.needs_unref);
        cache.unref_image(desc);
        cache.unref_image(desc);
    }

    runner.shutdown();
}

#[test]
fn bytes_used_stays_within_limit_under_random_load() {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    let limit = 400 * 1024;
    let (cache, _) = gpu_cache(limit);
    let mut rng = StdRng::seed_from_u64(7);

    let images: Vec<SourceImage> = (0..24)
        .map(|_| {
            let side = rng.gen_range(16u32..128);
            SourceImage::new(Arc::new(TestSource::new(side, side)))
        })
        .collect();

    let context = cache.context().clone();
    for _ in 0..200 {
        let image = &images[rng.gen_range(0..images.len())];
        let quality = match rng.gen_range(0..3) {
            0 => FilterQuality::Low,
            1 => FilterQuality::Medium,
            _ => FilterQuality::High,
        };
        let scale = rng.gen_range(0.1f32..1.5);
        let desc = draw(image, quality, scale);

        let result = cache.get_task_for_image_and_ref(&desc, TracingInfo::default());
        match result.task {
            Some(task) => {
                run_task_graph(&task);
                cache.unref_image(&desc);
            }
            None => {
                if result.needs_unref {
                    cache.unref_image(&desc);
                } else {
                    // Over budget or superseded: fall back to at-raster
                    let mut guard = context.lock();
                    let decoded = cache.get_decoded_image_for_draw(&mut guard, &desc);
                    cache.draw_with_image_finished(&mut guard, &desc, decoded);
                }
            }
        }

        assert!(
            cache.bytes_used() <= limit,
            "budget exceeded: {} > {}",
            cache.bytes_used(),
            limit
        );
    }
}
