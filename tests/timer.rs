use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use evio::{EventLoopThread, TimerId, Timestamp};

mod util;

use util::{init, recv_within};

#[test]
fn run_after_fires_once_after_the_delay() {
    init();

    let mut host = EventLoopThread::new("run-after");
    let event_loop = host.start_loop();

    let started = Instant::now();
    let (tx, rx) = mpsc::channel();
    event_loop.run_after(Duration::from_millis(50), move || {
        tx.send(()).unwrap();
    });

    recv_within(&rx, Duration::from_secs(5));
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[test]
fn run_at_fires_at_the_absolute_time() {
    init();

    let mut host = EventLoopThread::new("run-at");
    let event_loop = host.start_loop();

    let (tx, rx) = mpsc::channel();
    event_loop.run_at(Timestamp::now() + Duration::from_millis(30), move || {
        tx.send(Timestamp::now()).unwrap();
    });

    let fired_at = recv_within(&rx, Duration::from_secs(5));
    assert!(fired_at.is_valid());
}

#[test]
fn cancelled_one_shot_never_fires() {
    init();

    let mut host = EventLoopThread::new("cancel");
    let event_loop = host.start_loop();

    let count = Arc::new(AtomicUsize::new(0));
    let counted = count.clone();
    let id = event_loop.run_after(Duration::from_millis(300), move || {
        counted.fetch_add(1, Ordering::SeqCst);
    });
    event_loop.cancel(id);

    thread::sleep(Duration::from_millis(500));
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn earlier_timer_fires_before_later_timer() {
    init();

    let mut host = EventLoopThread::new("ordering");
    let event_loop = host.start_loop();

    let order = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();

    // Registered out of order on purpose.
    let recorded = order.clone();
    let done = tx.clone();
    event_loop.run_after(Duration::from_millis(120), move || {
        recorded.lock().unwrap().push("late");
        done.send(()).unwrap();
    });
    let recorded = order.clone();
    event_loop.run_after(Duration::from_millis(40), move || {
        recorded.lock().unwrap().push("early");
    });

    recv_within(&rx, Duration::from_secs(5));
    assert_eq!(*order.lock().unwrap(), vec!["early", "late"]);
}

#[test]
fn periodic_timer_fires_at_roughly_the_configured_rate() {
    init();

    let mut host = EventLoopThread::new("periodic");
    let event_loop = host.start_loop();

    let count = Arc::new(AtomicUsize::new(0));
    let counted = count.clone();
    let id = event_loop.run_every(Duration::from_millis(10), move || {
        counted.fetch_add(1, Ordering::SeqCst);
    });

    thread::sleep(Duration::from_secs(1));
    event_loop.cancel(id);
    let fired = count.load(Ordering::SeqCst);
    // ~100 expected; wide margins keep a loaded machine from flaking this.
    assert!((80..=115).contains(&fired), "fired {} times", fired);

    // And cancellation stops it.
    let after_cancel = count.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(100));
    assert!(count.load(Ordering::SeqCst) <= after_cancel + 1);
}

#[test]
fn periodic_timer_cancelled_from_its_own_callback_never_rearms() {
    init();

    let mut host = EventLoopThread::new("self-cancel");
    let event_loop = host.start_loop();

    let count = Arc::new(AtomicUsize::new(0));
    let slot: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));

    let counted = count.clone();
    let held = slot.clone();
    let cancelling_loop = event_loop.clone();
    let id = event_loop.run_every(Duration::from_millis(20), move || {
        let fired = counted.fetch_add(1, Ordering::SeqCst) + 1;
        if fired == 3 {
            // Cancelling mid-callback lands in the cancelling set, so the
            // rearm right after this call is skipped.
            if let Some(id) = held.lock().unwrap().clone() {
                cancelling_loop.cancel(id);
            }
        }
    });
    *slot.lock().unwrap() = Some(id);

    thread::sleep(Duration::from_millis(400));
    assert_eq!(count.load(Ordering::SeqCst), 3);
}

#[test]
fn timers_can_be_scheduled_from_the_loop_thread() {
    init();

    let mut host = EventLoopThread::new("nested");
    let event_loop = host.start_loop();

    let (tx, rx) = mpsc::channel();
    let inner_loop = event_loop.clone();
    event_loop.run_in_loop(move || {
        let tx = tx.clone();
        inner_loop.run_after(Duration::from_millis(20), move || tx.send(()).unwrap());
    });

    recv_within(&rx, Duration::from_secs(5));
}

#[test]
fn cancel_is_idempotent_and_survives_fired_timers() {
    init();

    let mut host = EventLoopThread::new("stale-cancel");
    let event_loop = host.start_loop();

    let (tx, rx) = mpsc::channel();
    let id = event_loop.run_after(Duration::from_millis(20), move || tx.send(()).unwrap());
    recv_within(&rx, Duration::from_secs(5));

    // The timer is long gone; cancelling its id must be a harmless no-op.
    event_loop.cancel(id.clone());
    event_loop.cancel(id);
}
