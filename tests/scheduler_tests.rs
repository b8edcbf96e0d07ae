use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use skysweep::config::{QueueConfig, SchedulerConfig};
use skysweep::queue::{handler_fn, Task, TaskQueue};
use skysweep::scheduler::{ScheduleEntry, Scheduler, SchedulerState};

async fn queue_with_counter(kind: &str) -> (TaskQueue, Arc<AtomicU32>) {
    let (queue, _rx) = TaskQueue::new(&QueueConfig {
        workers: 2,
        ..QueueConfig::default()
    });
    let counter = Arc::new(AtomicU32::new(0));
    let count = Arc::clone(&counter);
    queue
        .register_handler(
            kind,
            handler_fn(move |_payload, _cancel| {
                let count = Arc::clone(&count);
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .await;
    (queue, counter)
}

fn fast_scheduler(queue: TaskQueue) -> Scheduler {
    Scheduler::new(
        queue,
        SchedulerConfig {
            tick: Duration::from_millis(5),
            graceful_timeout: Duration::from_secs(1),
        },
        2,
    )
}

/// Over a long run, the number of fires tracks the configured interval: the
/// jitter moves individual fire times around but cannot change the rate.
#[tokio::test]
async fn fire_rate_tracks_interval_over_many_fires() {
    let (queue, counter) = queue_with_counter("tick").await;

    let scheduler = fast_scheduler(queue);
    scheduler
        .register(
            ScheduleEntry::new("fast-cycle", Duration::from_millis(20), || {
                Task::new("fast-cycle", "tick")
            })
            .with_jitter(Duration::from_millis(2)),
        )
        .await;

    scheduler.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    scheduler.stop(Duration::from_millis(500)).await;

    // 3s / 20ms ≈ 150 fires; leave slack for tick granularity and load
    let fired = counter.load(Ordering::SeqCst);
    assert!(fired >= 100, "too few fires: {fired}");
    assert!(fired <= 160, "too many fires: {fired}");
}

#[tokio::test]
async fn independent_entries_fire_independently() {
    let (queue, counter_a) = queue_with_counter("a").await;
    let counter_b = Arc::new(AtomicU32::new(0));
    let count_b = Arc::clone(&counter_b);
    queue
        .register_handler(
            "b",
            handler_fn(move |_payload, _cancel| {
                let count_b = Arc::clone(&count_b);
                async move {
                    count_b.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .await;

    let scheduler = fast_scheduler(queue);
    scheduler
        .register(ScheduleEntry::new("entry-a", Duration::from_millis(30), || {
            Task::new("entry-a", "a")
        }))
        .await;
    scheduler
        .register(ScheduleEntry::new("entry-b", Duration::from_millis(90), || {
            Task::new("entry-b", "b")
        }))
        .await;

    scheduler.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;
    scheduler.stop(Duration::from_millis(500)).await;

    let a = counter_a.load(Ordering::SeqCst);
    let b = counter_b.load(Ordering::SeqCst);
    assert!(a >= 2 && b >= 2, "both entries should fire (a={a}, b={b})");
    assert!(a > b, "the faster entry should fire more often (a={a}, b={b})");
}

#[tokio::test]
async fn entry_registered_while_running_takes_effect() {
    let (queue, counter) = queue_with_counter("late").await;

    let scheduler = fast_scheduler(queue);
    scheduler.start().await.unwrap();
    assert_eq!(scheduler.state().await, SchedulerState::Running);

    scheduler
        .register(ScheduleEntry::new(
            "late-entry",
            Duration::from_millis(25),
            || Task::new("late-entry", "late"),
        ))
        .await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    scheduler.stop(Duration::from_millis(500)).await;
    assert!(counter.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn stop_prevents_further_fires() {
    let (queue, counter) = queue_with_counter("burst").await;

    let scheduler = fast_scheduler(queue.clone());
    scheduler
        .register(ScheduleEntry::new("burst", Duration::from_millis(20), || {
            Task::new("burst", "burst")
        }))
        .await;
    scheduler.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    scheduler.stop(Duration::from_millis(500)).await;

    let at_stop = counter.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        counter.load(Ordering::SeqCst),
        at_stop,
        "fires continued after stop"
    );
    assert_eq!(queue.running_count().await, 0);
}
