use parking_lot::Mutex;
use std::sync::Arc;
use tallylog::ChangeNotifier;

#[test]
fn test_each_listener_sees_records_in_fifo_order() {
    let notifier: ChangeNotifier<u32> = ChangeNotifier::new();

    let a: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let b: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_a = Arc::clone(&a);
    let sink_b = Arc::clone(&b);
    notifier.subscribe(Box::new(move |n| sink_a.lock().push(*n)));
    notifier.subscribe(Box::new(move |n| sink_b.lock().push(*n)));

    notifier.emit(&[1, 2]);
    notifier.emit(&[3]);

    assert_eq!(*a.lock(), vec![1, 2, 3]);
    assert_eq!(*b.lock(), vec![1, 2, 3]);
}

#[test]
fn test_unsubscribe_is_targeted_and_idempotent() {
    let notifier: ChangeNotifier<u32> = ChangeNotifier::new();

    let kept = Arc::new(Mutex::new(0u32));
    let removed = Arc::new(Mutex::new(0u32));
    let sink_kept = Arc::clone(&kept);
    let sink_removed = Arc::clone(&removed);

    notifier.subscribe(Box::new(move |_| *sink_kept.lock() += 1));
    let token = notifier.subscribe(Box::new(move |_| *sink_removed.lock() += 1));

    notifier.emit(&[1]);
    notifier.unsubscribe(token);
    notifier.unsubscribe(token);
    notifier.emit(&[2]);

    assert_eq!(*kept.lock(), 2);
    assert_eq!(*removed.lock(), 1);
}

#[test]
fn test_panicking_listener_does_not_block_the_others() {
    let notifier: ChangeNotifier<u32> = ChangeNotifier::new();

    let after = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&after);
    notifier.subscribe(Box::new(|_| panic!("listener bug")));
    notifier.subscribe(Box::new(move |n| sink.lock().push(*n)));

    // Delivery continues past the panicking listener, on every record.
    notifier.emit(&[1, 2, 3]);
    assert_eq!(*after.lock(), vec![1, 2, 3]);
}

#[test]
fn test_clear_drops_every_listener() {
    let notifier: ChangeNotifier<u32> = ChangeNotifier::new();

    let count = Arc::new(Mutex::new(0u32));
    let sink = Arc::clone(&count);
    notifier.subscribe(Box::new(move |_| *sink.lock() += 1));
    assert_eq!(notifier.len(), 1);

    notifier.clear();
    assert!(notifier.is_empty());
    notifier.emit(&[1]);
    assert_eq!(*count.lock(), 0);
}

#[test]
fn test_emit_with_no_listeners_is_fine() {
    let notifier: ChangeNotifier<u32> = ChangeNotifier::new();
    notifier.emit(&[1, 2, 3]);
}
