use gridflux::scheduler::ScheduledTask;
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::test(start_paused = true)]
async fn replacing_a_task_cancels_the_pending_timer() {
    let (tx, mut rx) = mpsc::unbounded_channel::<&'static str>();

    let mut slot = Some(ScheduledTask::once(Duration::from_secs(5), tx.clone(), "old"));
    assert!(!slot.as_ref().unwrap().is_finished());
    // Superseding the timer before it fires drops and aborts it
    slot = Some(ScheduledTask::once(Duration::from_secs(5), tx, "new"));

    tokio::time::advance(Duration::from_secs(10)).await;
    assert_eq!(rx.recv().await, Some("new"));
    tokio::task::yield_now().await;
    assert!(rx.try_recv().is_err());
    drop(slot);
}

#[tokio::test(start_paused = true)]
async fn explicit_cancel_prevents_delivery() {
    let (tx, mut rx) = mpsc::unbounded_channel::<u8>();
    let task = ScheduledTask::once(Duration::from_secs(1), tx, 1);
    task.cancel();

    tokio::time::advance(Duration::from_secs(5)).await;
    tokio::task::yield_now().await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn one_shot_reports_finished_after_firing() {
    let (tx, mut rx) = mpsc::unbounded_channel::<u8>();
    let task = ScheduledTask::once(Duration::from_secs(1), tx, 1);
    assert!(!task.is_finished());

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(rx.recv().await, Some(1));
    tokio::task::yield_now().await;
    assert!(task.is_finished());
}

#[tokio::test(start_paused = true)]
async fn repeating_stops_when_the_receiver_is_dropped() {
    let (tx, rx) = mpsc::unbounded_channel::<&'static str>();
    let task = ScheduledTask::repeating(Duration::from_secs(1), tx, || "tick");
    drop(rx);

    tokio::time::advance(Duration::from_secs(3)).await;
    tokio::task::yield_now().await;
    assert!(task.is_finished());
}
