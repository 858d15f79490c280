use std::sync::Arc;
use std::time::{Duration, Instant};

use epoch_rcu::Rcu;

fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

#[test]
fn every_snapshot_dropped_exactly_once() {
    let vals: Vec<Arc<u32>> = (0..3).map(Arc::new).collect();

    {
        let rcu = Rcu::new(vals[0].clone());

        let v1 = vals[1].clone();
        rcu.update(move |_| Ok(v1)).unwrap();
        let v2 = vals[2].clone();
        rcu.update(move |_| Ok(v2)).unwrap();

        // Both displaced snapshots come back once their grace periods end.
        assert!(wait_for(
            || Arc::strong_count(&vals[0]) == 1 && Arc::strong_count(&vals[1]) == 1,
            Duration::from_secs(5)
        ));
        // The published one is still owned by the instance.
        assert_eq!(Arc::strong_count(&vals[2]), 2);
    }

    // Teardown frees the final published value too.
    assert_eq!(
        vals.iter().map(Arc::strong_count).collect::<Vec<_>>(),
        [1, 1, 1]
    );
}

#[test]
fn guard_blocks_reclamation_of_a_displaced_snapshot() {
    let val = Arc::new(1u32);
    let rcu = Rcu::new(val.clone());

    let guard = rcu.read().unwrap();
    rcu.update(|_| Ok(Arc::new(2))).unwrap();

    // A fresh nested read sees the new snapshot once it is applied...
    assert!(wait_for(
        || **rcu.read().unwrap() == 2,
        Duration::from_secs(5)
    ));

    // ...but the displaced one cannot be freed while we are pinned.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(Arc::strong_count(&val), 2);

    drop(guard);
    assert!(wait_for(
        || Arc::strong_count(&val) == 1,
        Duration::from_secs(5)
    ));
}

#[test]
fn queued_captures_do_not_leak_across_shutdown() {
    let payload = Arc::new(0u32);
    let captured = Arc::new(1u32);

    {
        let rcu = Rcu::new(payload.clone());
        // Park the reclaimer so the second update is still queued when
        // shutdown starts draining.
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let slow = payload.clone();
        rcu.update(move |_| {
            release_rx.recv().ok();
            Ok(slow)
        })
        .unwrap();
        let held = captured.clone();
        rcu.update(move |_| Ok(held)).unwrap();
        release_tx.send(()).unwrap();
    }

    assert_eq!(Arc::strong_count(&payload), 1);
    assert_eq!(Arc::strong_count(&captured), 1);
}
