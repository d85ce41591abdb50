use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use evio::{EventLoop, EventLoopThread, EventLoopThreadPool};

mod util;

use util::{init, recv_within};

#[test]
fn one_loop_per_thread() {
    init();

    let _first = EventLoop::new().unwrap();
    let second = catch_unwind(AssertUnwindSafe(EventLoop::new));
    assert!(second.is_err());
}

#[test]
fn second_loop_allowed_after_first_dropped() {
    init();

    let first = EventLoop::new().unwrap();
    drop(first);
    let _second = EventLoop::new().unwrap();
}

#[test]
fn current_returns_this_threads_loop() {
    init();

    assert!(EventLoop::current().is_none());
    let event_loop = EventLoop::new().unwrap();
    let current = EventLoop::current().unwrap();
    assert!(Arc::ptr_eq(&event_loop, &current));
}

#[test]
fn loop_only_operations_panic_off_thread() {
    init();

    let mut host = EventLoopThread::new("affinity");
    let event_loop = host.start_loop();
    assert!(!event_loop.is_in_loop_thread());

    let result = catch_unwind(AssertUnwindSafe(|| event_loop.assert_in_loop_thread()));
    assert!(result.is_err());
}

#[test]
fn run_must_happen_on_owning_thread() {
    init();

    let event_loop = EventLoop::new().unwrap();
    let off_thread = thread::spawn({
        let event_loop = event_loop.clone();
        move || catch_unwind(AssertUnwindSafe(|| event_loop.run())).is_err()
    });
    assert!(off_thread.join().unwrap());
}

#[test]
fn tasks_run_in_submission_order() {
    init();

    let mut host = EventLoopThread::new("ordering");
    let event_loop = host.start_loop();

    let order = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();
    for i in 0..100 {
        let order = order.clone();
        let tx = tx.clone();
        event_loop.queue_in_loop(move || {
            order.lock().unwrap().push(i);
            if i == 99 {
                tx.send(()).unwrap();
            }
        });
    }

    recv_within(&rx, Duration::from_secs(5));
    let order = order.lock().unwrap();
    assert_eq!(*order, (0..100).collect::<Vec<_>>());
}

#[test]
fn run_in_loop_is_immediate_on_the_loop_thread() {
    init();

    let mut host = EventLoopThread::new("immediate");
    let event_loop = host.start_loop();

    let (tx, rx) = mpsc::channel();
    let inner_loop = event_loop.clone();
    event_loop.queue_in_loop(move || {
        // Already on the loop thread: this must run synchronously.
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        inner_loop.run_in_loop(move || flag.store(true, Ordering::SeqCst));
        tx.send(ran.load(Ordering::SeqCst)).unwrap();
    });

    assert!(recv_within(&rx, Duration::from_secs(5)));
}

#[test]
fn tasks_posted_during_drain_still_run() {
    init();

    let mut host = EventLoopThread::new("requeue");
    let event_loop = host.start_loop();

    let (tx, rx) = mpsc::channel();
    let inner_loop = event_loop.clone();
    event_loop.queue_in_loop(move || {
        let tx = tx.clone();
        // Posted while the loop drains its queue; the wakeup write keeps
        // the follow-up from stalling behind the next poll.
        inner_loop.queue_in_loop(move || tx.send(()).unwrap());
    });

    recv_within(&rx, Duration::from_secs(5));
}

#[test]
fn quit_from_another_thread_wakes_the_loop() {
    init();

    let event_loop = EventLoop::new().unwrap();
    let quitter = {
        let event_loop = event_loop.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            event_loop.quit();
        })
    };
    // Returns promptly despite the ten-second poll timeout.
    event_loop.run();
    quitter.join().unwrap();
}

#[test]
fn poll_return_time_advances() {
    init();

    let mut host = EventLoopThread::new("stamp");
    let event_loop = host.start_loop();

    let (tx, rx) = mpsc::channel();
    let stamped = event_loop.clone();
    event_loop.queue_in_loop(move || tx.send(stamped.poll_return_time()).unwrap());
    let stamp = recv_within(&rx, Duration::from_secs(5));
    assert!(stamp.is_valid());
}

#[test]
fn pool_round_robins_workers() {
    init();

    let mut host = EventLoopThread::new("pool-base");
    let base_loop = host.start_loop();

    let pool = Arc::new(EventLoopThreadPool::new(base_loop.clone(), "pool"));
    pool.set_thread_num(3);

    let (tx, rx) = mpsc::channel();
    let started = pool.clone();
    base_loop.run_in_loop(move || {
        started.start();
        let a = started.get_next_loop();
        let b = started.get_next_loop();
        let c = started.get_next_loop();
        let a_again = started.get_next_loop();
        tx.send((
            Arc::ptr_eq(&a, &b),
            Arc::ptr_eq(&b, &c),
            Arc::ptr_eq(&a, &a_again),
        ))
        .unwrap();
    });

    let (ab, bc, aa) = recv_within(&rx, Duration::from_secs(5));
    assert!(!ab);
    assert!(!bc);
    assert!(aa);
}

#[test]
fn pool_without_workers_hands_out_base_loop() {
    init();

    let mut host = EventLoopThread::new("pool-empty");
    let base_loop = host.start_loop();

    let pool = Arc::new(EventLoopThreadPool::new(base_loop.clone(), "empty"));
    let (tx, rx) = mpsc::channel();
    let started = pool.clone();
    let base = base_loop.clone();
    base_loop.run_in_loop(move || {
        started.start();
        tx.send(Arc::ptr_eq(&started.get_next_loop(), &base)).unwrap();
    });

    assert!(recv_within(&rx, Duration::from_secs(5)));
}
