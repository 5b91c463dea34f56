//! Black-box end-to-end scenarios exercised against the public API only.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use fiberhub::event::Event;
use fiberhub::fiber;
use fiberhub::hub::{self, Hub};
use fiberhub::mailbox::Mailbox;
use fiberhub::pool::FiberPool;
use fiberhub::timeout::{timeout, ExcOrFactory, Outcome, Timeout};
use fiberhub::tpool::Tpool;

#[test]
fn event_fan_in() {
    let hub = Hub::new_for_test();
    hub::use_hub(hub.clone());
    let evt: Event<i32> = Event::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    for _ in 0..2 {
        let evt = evt.clone();
        let seen = seen.clone();
        hub.spawn(move || {
            seen.lock().unwrap().push(evt.wait()?);
            Ok(())
        });
    }
    let evt2 = evt.clone();
    hub.spawn(move || {
        evt2.send(Ok(4))?;
        Ok(())
    });
    hub.run();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|v| *v == 4));
}

#[test]
fn timeout_raises_identity_matched_exception() {
    let hub = Hub::new_for_test();
    hub::use_hub(hub.clone());
    hub.spawn(|| {
        let t = Timeout::new(Some(Duration::from_millis(10)), ExcOrFactory::Suppress);
        let outcome: Outcome<()> = t.scope(|| {
            fiber::sleep(Duration::from_millis(20))?;
            Ok(())
        })?;
        assert_eq!(outcome, Outcome::TimedOut);
        Ok(())
    });
    hub.run();
}

#[test]
fn timeout_cancel_leaves_no_trailing_exception() {
    let hub = Hub::new_for_test();
    hub::use_hub(hub.clone());
    hub.spawn(|| {
        let t = Timeout::new(Some(Duration::from_millis(20)), ExcOrFactory::Suppress);
        let outcome = t.scope(|| {
            fiber::sleep(Duration::from_millis(10))?;
            Ok(())
        })?;
        assert_eq!(outcome, Outcome::Completed(()));
        assert!(!t.pending());
        fiber::sleep(Duration::from_millis(20))?;
        Ok(())
    });
    hub.run();
}

#[test]
fn pool_serializes_jobs_in_fifo_order_within_its_bound() {
    let hub = Hub::new_for_test();
    hub::use_hub(hub.clone());
    let printed = Arc::new(Mutex::new(Vec::new()));

    hub.spawn({
        let printed = printed.clone();
        move || {
            let pool = FiberPool::new(1, 2)?;
            for i in 1..=4 {
                let printed = printed.clone();
                pool.execute_async(move || {
                    printed.lock().unwrap().push(i);
                    Ok(())
                })?;
            }
            fiber::sleep(Duration::from_millis(50))?;
            pool.free();
            Ok(())
        }
    });
    hub.run();

    let printed = printed.lock().unwrap();
    assert_eq!(*printed, vec![1, 2, 3, 4]);
}

#[test]
fn tpool_job_panic_does_not_kill_the_worker() {
    let hub = Hub::new_for_test();
    hub::use_hub(hub.clone());
    hub.spawn(|| {
        let pool = Tpool::new(1)?;
        let err = pool
            .execute(|| 1 / std::hint::black_box(0))
            .unwrap_err();
        assert!(matches!(err, fiberhub::error::Error::TpoolPanic(_)));
        let v = pool.execute(|| 42)?;
        assert_eq!(v, 42);
        pool.killall();
        Ok(())
    });
    hub.run();
}

#[test]
fn nested_timeout_identity_outer_propagates() {
    let hub = Hub::new_for_test();
    hub::use_hub(hub.clone());
    hub.spawn(|| {
        let outer = Timeout::new(Some(Duration::from_millis(10)), ExcOrFactory::Suppress);
        let outer_outcome: Outcome<Outcome<()>> = outer.scope(|| {
            timeout(Some(Duration::from_millis(20)), || {
                fiber::sleep(Duration::from_millis(30))?;
                Ok(())
            })
        })?;
        assert_eq!(outer_outcome, Outcome::TimedOut);
        Ok(())
    });
    hub.run();
}

#[test]
fn mailbox_delivers_casts_in_order_to_a_single_owner() {
    let hub = Hub::new_for_test();
    hub::use_hub(hub.clone());
    let mailbox: Mailbox<&'static str> = Mailbox::new();
    let received = Arc::new(Mutex::new(Vec::new()));

    let mb = mailbox.clone();
    let r = received.clone();
    hub.spawn(move || {
        let mut n = 0;
        mb.run(|msg| {
            r.lock().unwrap().push(msg);
            n += 1;
            if n == 2 {
                Err(fiberhub::error::Error::Cancelled)
            } else {
                Ok(())
            }
        })
        .ok();
        Ok(())
    });

    let mb2 = mailbox.clone();
    hub.spawn(move || {
        fiber::reschedule()?;
        mb2.cast("first");
        mb2.cast("second");
        Ok(())
    });

    hub.run();
    assert_eq!(*received.lock().unwrap(), vec!["first", "second"]);
}
