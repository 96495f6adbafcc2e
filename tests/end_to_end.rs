use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use gfxhost_cdma::opcodes;
use gfxhost_channel::{
    simulated_host, ChannelConfig, Host, HostConfig, HwEvent, JobBuilder, JobDone, StepOutcome,
};
use gfxhost_syncpt::WaitOutcome;
use pretty_assertions::assert_eq;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn two_channels() -> HostConfig {
    HostConfig {
        syncpts: 8,
        push_buffer_words: 64,
        channels: vec![ChannelConfig::new("gr3d", 0x60), ChannelConfig::new("gr2d", 0x51)],
        ..HostConfig::default()
    }
}

#[test]
fn serialize_barrier_holds_gathers_until_prior_work_lands() {
    init_tracing();
    const S: u32 = 1;

    let (host, engines) = simulated_host(two_channels()).unwrap();
    let (gr3d, gr2d) = (&engines[0], &engines[1]);
    let incr = host
        .memory()
        .alloc_with(&[opcodes::imm_incr_syncpt(opcodes::COND_OP_DONE, S)])
        .unwrap();

    // Current value of S observed by each job's completion callback.
    let fired_at = Arc::new(Mutex::new(Vec::new()));
    let on_complete = |label: &'static str| {
        let fired_at = fired_at.clone();
        let registry = host.registry().clone();
        move |_: JobDone| {
            let current = registry.get(S).unwrap().read_current();
            fired_at.lock().unwrap().push((label, current));
        }
    };

    let a = JobBuilder::new()
        .incr(S, 1)
        .gather(&incr, 0, 1)
        .on_complete(on_complete("a"))
        .build();
    let a = host.submit(1, a).unwrap();
    assert_eq!(a.end_value(S), Some(1));

    let b = JobBuilder::new()
        .incr(S, 2)
        .gather(&incr, 0, 1)
        .gather(&incr, 0, 1)
        .serialize(true)
        .on_complete(on_complete("b"))
        .build();
    let b = host.submit(0, b).unwrap();
    assert_eq!(b.end_value(S), Some(3));

    // B's channel stops at the barrier; none of its gathers has been fetched.
    assert_eq!(
        gr3d.run_until_blocked(64),
        StepOutcome::Blocked {
            syncpt_id: S,
            thresh: 1
        }
    );
    assert!(!gr3d
        .events()
        .iter()
        .any(|e| matches!(e, HwEvent::Gather { .. })));
    assert!(fired_at.lock().unwrap().is_empty());

    assert_eq!(gr2d.run_until_blocked(64), StepOutcome::Idle);
    assert_eq!(*fired_at.lock().unwrap(), vec![("a", 1)]);

    assert_eq!(gr3d.run_until_blocked(64), StepOutcome::Idle);
    assert_eq!(
        gr3d.events(),
        vec![
            HwEvent::SetClass { class: 0x1 },
            HwEvent::Wait {
                syncpt_id: S,
                thresh: 1
            },
            HwEvent::Gather {
                iova: incr.iova(),
                words: 1
            },
            HwEvent::Incr {
                syncpt_id: S,
                value: 2
            },
            HwEvent::Gather {
                iova: incr.iova(),
                words: 1
            },
            HwEvent::Incr {
                syncpt_id: S,
                value: 3
            },
        ]
    );
    assert_eq!(*fired_at.lock().unwrap(), vec![("a", 1), ("b", 3)]);
    assert_eq!(incr.pin_count(), 0);
}

#[test]
fn concurrent_channels_get_disjoint_end_value_ranges() {
    init_tracing();
    const THREADS: u32 = 8;
    const JOBS: u32 = 20;
    const S: u32 = 2;

    let host = Arc::new(Host::new(two_channels()).unwrap());
    let buf = host.memory().alloc(4).unwrap();
    let ranges = Arc::new(Mutex::new(Vec::new()));

    let threads: Vec<_> = (0..THREADS)
        .map(|t| {
            let host = host.clone();
            let buf = buf.clone();
            let ranges = ranges.clone();
            thread::spawn(move || {
                let count = 1 + t % 3;
                for _ in 0..JOBS {
                    let job = JobBuilder::new().incr(S, count).gather(&buf, 0, 4).build();
                    let receipt = host.submit(t % 2, job).unwrap();
                    let end = receipt.end_value(S).unwrap();
                    ranges.lock().unwrap().push((end - count, end));
                    // Keep the rings drained.
                    for _ in 0..count {
                        host.cpu_incr(S).unwrap();
                    }
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    let mut ranges = ranges.lock().unwrap().clone();
    ranges.sort_unstable();
    let mut expected_start = 0;
    for (start, end) in &ranges {
        assert_eq!(*start, expected_start, "ranges overlap or leave a gap");
        expected_start = *end;
    }

    let sp = host.registry().get(S).unwrap();
    assert_eq!(sp.read_max(), expected_start);
    assert_eq!(sp.read_current(), sp.read_max());
    host.flush(Duration::from_secs(5)).unwrap();
    assert_eq!(buf.pin_count(), 0);
}

#[test]
fn repeated_advance_fires_each_action_once() {
    let host = Host::new(two_channels()).unwrap();
    let sp = host.registry().get(3).unwrap();
    let end = sp.increment_max(2);
    assert_eq!(sp.read_max(), end);

    let fired = Arc::new(AtomicUsize::new(0));
    {
        let fired = fired.clone();
        host.intr()
            .arm(
                3,
                end,
                Box::new(move |_| {
                    fired.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
    }

    host.intr().advance(3, end).unwrap();
    host.intr().advance(3, end).unwrap();
    assert_eq!(host.syncpt_irq(3), 0);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(host.intr().pending(3), 0);
}

#[test]
fn wait_reports_ready_or_timeout() {
    let host = Arc::new(Host::new(two_channels()).unwrap());
    let sp = host.registry().get(4).unwrap();
    let end = sp.increment_max(1);

    assert_eq!(
        host.wait(4, end, Duration::from_millis(20)).unwrap(),
        WaitOutcome::Timeout
    );

    let incr = {
        let host = host.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            host.cpu_incr(4).unwrap()
        })
    };
    let outcome = host.wait(4, end, Duration::from_secs(5)).unwrap();
    assert!(outcome.is_ready());
    assert_eq!(incr.join().unwrap(), end);
}

#[test]
fn stats_are_reported_per_channel() {
    let host = Host::new(two_channels()).unwrap();
    let buf = host.memory().alloc(4).unwrap();
    host.submit(1, JobBuilder::new().incr(1, 1).gather(&buf, 0, 4).build())
        .unwrap();
    assert!(host.submit(1, JobBuilder::new().build()).is_err());

    let json: serde_json::Value = serde_json::from_str(&host.stats_json().unwrap()).unwrap();
    assert_eq!(json["gr2d"]["submits"], 1);
    assert_eq!(json["gr2d"]["invalid_jobs"], 1);
    assert_eq!(json["gr2d"]["words_pushed"], 2);
    assert_eq!(json["gr3d"]["submits"], 0);
}
