//! Timer and delayed-callback behavior on a simulated clock.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use pollux::{Error, EventLoop, SimClock, TimerPolicy};

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

fn sim_loop() -> (Arc<SimClock>, EventLoop) {
    let clock = Arc::new(SimClock::new());
    let mut el = EventLoop::with_clock(clock.clone()).unwrap();
    el.start().unwrap();
    (clock, el)
}

#[test]
fn cyclic_phase_is_aligned_to_base_time() {
    let (clock, mut el) = sim_loop();
    clock.advance(ms(120));

    let count = Rc::new(Cell::new(0u32));
    let counter = count.clone();
    el.add_cyclic_callback(
        move |_| counter.set(counter.get() + 1),
        ms(50),
        Some(Duration::ZERO),
        TimerPolicy::OnceInCurrent,
    )
    .unwrap();

    // base 0, interval 50, now 120: first fire at 150.
    assert_eq!(el.next_cyclic_time(), Some(ms(150)));
    el.run(Duration::ZERO).unwrap();
    assert_eq!(count.get(), 0);

    clock.advance(ms(30));
    let next = el.run(Duration::ZERO).unwrap();
    assert_eq!(count.get(), 1);
    assert_eq!(el.next_cyclic_time(), Some(ms(200)));
    assert_eq!(next, Some(SystemTime::UNIX_EPOCH + ms(200)));
}

#[test]
fn once_in_current_catches_up_after_a_gap() {
    let (clock, mut el) = sim_loop();
    clock.advance(ms(120));

    let count = Rc::new(Cell::new(0u32));
    let counter = count.clone();
    el.add_cyclic_callback(
        move |_| counter.set(counter.get() + 1),
        ms(50),
        Some(Duration::ZERO),
        TimerPolicy::OnceInCurrent,
    )
    .unwrap();

    clock.advance(ms(30)); // 150
    el.run(Duration::ZERO).unwrap();
    assert_eq!(count.get(), 1);

    // 500 ms gap: slots 200, 250, ..., 650 each fire once.
    clock.advance(ms(500)); // 650
    el.run(Duration::ZERO).unwrap();
    assert_eq!(count.get(), 11);
    assert_eq!(el.next_cyclic_time(), Some(ms(700)));
}

#[test]
fn current_time_skips_missed_slots() {
    let (clock, mut el) = sim_loop();
    clock.advance(ms(120));

    let count = Rc::new(Cell::new(0u32));
    let counter = count.clone();
    el.add_cyclic_callback(
        move |_| counter.set(counter.get() + 1),
        ms(50),
        Some(Duration::ZERO),
        TimerPolicy::CurrentTime,
    )
    .unwrap();

    clock.advance(ms(30)); // 150
    el.run(Duration::ZERO).unwrap();
    assert_eq!(count.get(), 1);

    clock.advance(ms(500)); // 650
    el.run(Duration::ZERO).unwrap();
    assert_eq!(count.get(), 2);
    // Rhythm restarts from the late fire.
    assert_eq!(el.next_cyclic_time(), Some(ms(700)));
}

#[test]
fn timed_callback_fires_exactly_once() {
    let (clock, mut el) = sim_loop();

    let count = Rc::new(Cell::new(0u32));
    let counter = count.clone();
    el.add_timed_callback(move |_| counter.set(counter.get() + 1), ms(10))
        .unwrap();

    el.run(Duration::ZERO).unwrap();
    assert_eq!(count.get(), 0);

    clock.advance(ms(10));
    el.run(Duration::ZERO).unwrap();
    assert_eq!(count.get(), 1);
    assert_eq!(el.next_cyclic_time(), None);

    clock.advance(ms(100));
    el.run(Duration::ZERO).unwrap();
    assert_eq!(count.get(), 1);
}

#[test]
fn remove_and_modify_through_the_loop() {
    let (clock, mut el) = sim_loop();

    let count = Rc::new(Cell::new(0u32));
    let counter = count.clone();
    let id = el
        .add_cyclic_callback(
            move |_| counter.set(counter.get() + 1),
            ms(50),
            None,
            TimerPolicy::CurrentTime,
        )
        .unwrap();

    // modify recomputes the next fire as if newly added: base 0, interval
    // 100, now 30 -> 100.
    clock.advance(ms(30));
    el.modify_cyclic_callback(id, ms(100), Some(Duration::ZERO), TimerPolicy::CurrentTime)
        .unwrap();
    assert_eq!(el.next_cyclic_time(), Some(ms(100)));

    el.remove_cyclic_callback(id);
    // Unknown ids are a no-op.
    el.remove_cyclic_callback(id);
    assert_eq!(el.next_cyclic_time(), None);

    clock.advance(ms(200));
    el.run(Duration::ZERO).unwrap();
    assert_eq!(count.get(), 0);
}

#[test]
fn timer_can_remove_itself_from_its_callback() {
    let (clock, mut el) = sim_loop();

    let count = Arc::new(Mutex::new(0u32));
    let counter = count.clone();
    let id_cell: Rc<Cell<Option<pollux::TimerId>>> = Rc::new(Cell::new(None));
    let id_inner = id_cell.clone();
    let id = el
        .add_cyclic_callback(
            move |el| {
                *counter.lock().unwrap() += 1;
                if let Some(id) = id_inner.get() {
                    el.remove_cyclic_callback(id);
                }
            },
            ms(10),
            None,
            TimerPolicy::CurrentTime,
        )
        .unwrap();
    id_cell.set(Some(id));

    clock.advance(ms(10));
    el.run(Duration::ZERO).unwrap();
    clock.advance(ms(50));
    el.run(Duration::ZERO).unwrap();
    assert_eq!(*count.lock().unwrap(), 1);
    assert_eq!(el.next_cyclic_time(), None);
}

#[test]
fn delayed_callbacks_run_fifo_and_defer_new_enqueues() {
    let (_clock, mut el) = sim_loop();

    let order = Arc::new(Mutex::new(Vec::new()));
    let a = order.clone();
    let c = order.clone();
    el.add_delayed_callback(move |el| {
        a.lock().unwrap().push(1);
        let nested = c.clone();
        // Enqueued mid-cycle: runs in the next cycle.
        el.add_delayed_callback(move |_| nested.lock().unwrap().push(3));
    });
    let b = order.clone();
    el.add_delayed_callback(move |_| b.lock().unwrap().push(2));

    el.run(Duration::ZERO).unwrap();
    assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    el.run(Duration::ZERO).unwrap();
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
}

#[test]
fn cross_thread_delayed_callback_wakes_the_poller() {
    let mut el = EventLoop::new().unwrap();
    el.start().unwrap();

    let sender = el.delayed_sender();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        sender.send(move |_| flag.store(true, Ordering::SeqCst));
    });

    // A 10 s timeout returns early because the enqueue wakes the poller.
    let start = std::time::Instant::now();
    el.run(Duration::from_secs(10)).unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));

    // The callback itself runs at the start of the next cycle.
    el.run(Duration::ZERO).unwrap();
    assert!(ran.load(Ordering::SeqCst));
    handle.join().unwrap();
}

#[test]
fn callback_panic_is_contained() {
    let (clock, mut el) = sim_loop();

    let count = Rc::new(Cell::new(0u32));
    let counter = count.clone();
    el.add_timed_callback(|_| panic!("application bug"), ms(5)).unwrap();
    el.add_timed_callback(move |_| counter.set(counter.get() + 1), ms(5))
        .unwrap();

    clock.advance(ms(5));
    // The panicking callback is caught at the dispatcher boundary; the
    // second one still fires and the loop stays usable.
    el.run(Duration::ZERO).unwrap();
    assert_eq!(count.get(), 1);
    assert_eq!(el.run(Duration::ZERO), Ok(None));
}

#[test]
fn zero_interval_is_invalid() {
    let (_clock, mut el) = sim_loop();
    let r = el.add_cyclic_callback(|_| {}, Duration::ZERO, None, TimerPolicy::CurrentTime);
    assert!(matches!(r, Err(Error::InvalidArgument(_))));
}
