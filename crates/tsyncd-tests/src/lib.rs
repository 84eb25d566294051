//! Scenario fixtures for exercising the tsyncd core end to end.
//!
//! The fixtures build instance statuses and engine configurations the way a
//! live daemon would see them; the scenario battery itself lives in the
//! test modules below.

use tsyncd_core::config::ModuleKind;
use tsyncd_core::sync::status::{Alarm, GrandmasterInfo, SyncInstanceStatus, SyncState};

/// A healthy slave status with the given priority and default quality.
pub fn slave_status(name: &str, priority: u8) -> SyncInstanceStatus {
    let mut s = SyncInstanceStatus::new(name, ModuleKind::Freerun, priority);
    s.state = SyncState::Slave;
    s.grandmaster = GrandmasterInfo {
        clock_class: 248,
        accuracy_ns: 1_000.0,
        steps_removed: 1,
        ..GrandmasterInfo::default()
    };
    s
}

/// The same status with alarm bits raised.
pub fn alarmed(mut status: SyncInstanceStatus, alarms: Alarm) -> SyncInstanceStatus {
    status.alarms = alarms;
    status
}

/// Adjust the grandmaster quality fields used by the selector ordering.
pub fn with_quality(
    mut status: SyncInstanceStatus,
    clock_class: u8,
    accuracy_ns: f64,
    steps_removed: u16,
) -> SyncInstanceStatus {
    status.grandmaster.clock_class = clock_class;
    status.grandmaster.accuracy_ns = accuracy_ns;
    status.grandmaster.steps_removed = steps_removed;
    status
}

#[cfg(test)]
mod selector_scenarios {
    //! The literal selection scenarios of the daemon's acceptance list.

    use super::*;
    use tsyncd_core::selector::Selector;

    #[test]
    fn test_two_freerun_instances_priority_tie_break() {
        // A (priority 128) and B (priority 64), both clean slaves with
        // identical quality: B must win.
        let statuses = vec![slave_status("a", 128), slave_status("b", 64)];
        let mut sel = Selector::new();
        let out = sel.select(&statuses);
        assert_eq!(out.index, Some(1));
    }

    #[test]
    fn test_better_candidate_alarmed_loses() {
        // B is stronger by priority but carries NO_FOLLOW_UPS: A is elected.
        let statuses = vec![
            slave_status("a", 128),
            alarmed(slave_status("b", 64), Alarm::NO_FOLLOW_UPS),
        ];
        let mut sel = Selector::new();
        assert_eq!(sel.select(&statuses).index, Some(0));
    }

    #[test]
    fn test_all_alarmed_falls_back_by_priority() {
        // Both alarmed: the relaxed pass ignores alarms, B wins on priority.
        let statuses = vec![
            alarmed(slave_status("a", 128), Alarm::NO_FOLLOW_UPS),
            alarmed(slave_status("b", 64), Alarm::NO_FOLLOW_UPS),
        ];
        let mut sel = Selector::new();
        assert_eq!(sel.select(&statuses).index, Some(1));
    }

    #[test]
    fn test_steps_removed_tie_break() {
        // Equal class and accuracy; A at 2 steps removed beats B at 5.
        let statuses = vec![
            with_quality(slave_status("a", 128), 6, 100.0, 2),
            with_quality(slave_status("b", 128), 6, 100.0, 5),
        ];
        let mut sel = Selector::new();
        assert_eq!(sel.select(&statuses).index, Some(0));
    }
}

#[cfg(test)]
mod link_table_scenarios {
    use tsyncd_core::error::Error;
    use tsyncd_core::link::{Link, LinkTableSet};

    fn rows() -> Vec<Link> {
        vec![Link::new(1, "eth0")]
    }

    #[test]
    fn test_refcount_ring_publication_protocol() {
        let ring = LinkTableSet::new();

        // v1 published with a committed consumer count of 3.
        let v1 = ring.publish(rows(), 3).unwrap();
        assert_eq!(ring.refcount(v1), Some(3));

        // Two consumers release; one reference remains.
        ring.release(v1).unwrap();
        ring.release(v1).unwrap();
        assert_eq!(ring.refcount(v1), Some(1));

        // Publishing v2 succeeds: v1's slot is not the ring head yet.
        let v2 = ring.publish(rows(), 1).unwrap();
        assert!(v2 > v1);

        // Fill the remaining slots while v1 and v2 stay referenced; the
        // wrap-around hits v1's held slot and must return try-again.
        ring.publish(rows(), 0).unwrap();
        ring.publish(rows(), 0).unwrap();
        let err = ring.publish(rows(), 0).unwrap_err();
        assert!(matches!(err, Error::TryAgain(_)));

        // Releasing the final v1 reference unblocks publication.
        ring.release(v1).unwrap();
        ring.publish(rows(), 0).unwrap();
    }

    #[test]
    fn test_refcount_underflow_is_fatal_error() {
        let ring = LinkTableSet::new();
        let v = ring.publish(rows(), 1).unwrap();
        ring.release(v).unwrap();
        assert!(matches!(
            ring.release(v),
            Err(Error::RefcountUnderflow(_))
        ));
    }

    #[test]
    fn test_versions_strictly_monotonic_for_consumers() {
        let ring = LinkTableSet::new();
        let mut last = 0;
        for _ in 0..16 {
            let v = ring.publish(rows(), 0).unwrap();
            assert!(v > last);
            last = v;
        }
    }
}

#[cfg(test)]
mod servo_scenarios {
    use tsyncd_core::config::ServoConfig;
    use tsyncd_core::servo::{Correction, Servo, ServoCtl};
    use tsyncd_core::time::TimeSpec;

    fn servo() -> Servo {
        let mut s = Servo::new("scenario", &ServoConfig::default());
        s.control(
            ServoCtl::CLOCK_CONTROL_ENABLED,
            ServoCtl::CLOCK_CONTROL_ENABLED,
        );
        s
    }

    #[test]
    fn test_leap_guard_suppresses_all_adjustments_then_resumes() {
        let mut s = servo();
        // An adjusting servo...
        assert!(matches!(
            s.update(1_000, TimeSpec::new(0, 0)),
            Correction::Slew(_)
        ));

        // ...with the guard asserted applies nothing, whatever the size.
        s.control(ServoCtl::LEAP_SECOND_GUARD, ServoCtl::LEAP_SECOND_GUARD);
        for (i, offset) in [100i64, 5_000_000_000, -250].into_iter().enumerate() {
            assert_eq!(
                s.update(offset, TimeSpec::new(1 + i as i64, 0)),
                Correction::None
            );
        }

        // Once cleared, adjustments resume from the next measurement.
        s.control(ServoCtl::LEAP_SECOND_GUARD, ServoCtl::empty());
        assert!(matches!(
            s.update(1_000, TimeSpec::new(10, 0)),
            Correction::Slew(_)
        ));
    }

    #[test]
    fn test_converged_servo_ignores_zero_offset() {
        let mut s = servo();
        for i in 0..4 {
            s.update(200, TimeSpec::new(i, 0));
        }
        for i in 4..20 {
            s.update(0, TimeSpec::new(i, 0));
        }
        let integral = s.integral();
        s.update(0, TimeSpec::new(30, 0));
        assert!((s.integral() - integral).abs() < 1e-12);
    }

    #[test]
    fn test_noisy_measurements_converge_with_outlier_rejection() {
        use rand::Rng;
        let mut s = servo();
        let mut rng = rand::rng();
        for i in 0..120 {
            // Steady 1 us offset with +-50 ns of noise and occasional spikes.
            let noise: i64 = rng.random_range(-50..50);
            let offset = if i % 37 == 0 { 80_000 } else { 1_000 + noise };
            s.update(offset, TimeSpec::new(i, 0));
        }
        let c = s.counters();
        assert!(c.outliers >= 1, "spikes should be rejected");
        assert_eq!(c.clock_steps, 0);
    }
}

#[cfg(test)]
mod runtime_scenarios {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tsyncd_core::config::ZombiePolicy;
    use tsyncd_core::error::Result;
    use tsyncd_core::message::multicast::MulticastBus;
    use tsyncd_core::message::pool::{Pool, PoolSet};
    use tsyncd_core::message::{msg_id, Body, Msg, ReplyQueue};
    use tsyncd_core::runtime::{Readiness, Runtime, ThreadContext, ThreadHandlers};

    fn runtime() -> Runtime {
        Runtime::new(
            Arc::new(MulticastBus::new()),
            PoolSet::new(32, 8, 8),
            ZombiePolicy::Immediate,
        )
    }

    struct Counter {
        seen: Arc<AtomicU64>,
    }

    impl ThreadHandlers for Counter {
        fn on_startup(&mut self, _ctx: &mut ThreadContext) -> Result<()> {
            Ok(())
        }
        fn on_shutdown(&mut self, _ctx: &mut ThreadContext, _code: i32) {}
        fn on_message(&mut self, ctx: &mut ThreadContext, msg: Msg) {
            self.seen.fetch_add(1, Ordering::Relaxed);
            ctx.reply(msg.into_reply(msg_id::STATUS_REPLY, Body::Empty));
        }
        fn on_user_fds(&mut self, _ctx: &mut ThreadContext, _ready: &[Readiness]) {}
    }

    #[test]
    fn test_every_message_delivered_exactly_once_and_freed() {
        let rt = runtime();
        let seen = Arc::new(AtomicU64::new(0));
        let child = rt
            .spawn("counter", Counter { seen: Arc::clone(&seen) }, None)
            .unwrap();

        let pool = Pool::new("scenario", 64);
        let replies = ReplyQueue::new();
        const N: u64 = 50;
        for _ in 0..N {
            let msg = pool.alloc("scenario", true).unwrap();
            let reply = child
                .mailbox()
                .send_wait(msg, msg_id::STATUS_GET, &replies, Duration::from_secs(2))
                .unwrap();
            drop(reply);
        }
        rt.destroy(&child).unwrap();

        assert_eq!(seen.load(Ordering::Relaxed), N);
        // Every envelope came back to the pool: alloc count equals free count.
        assert_eq!(pool.in_use(), 0);
        assert_eq!(
            pool.stats().allocs.load(Ordering::Relaxed),
            pool.stats().frees.load(Ordering::Relaxed)
        );
    }

    #[test]
    fn test_undrained_messages_freed_on_thread_exit() {
        struct Sleeper;
        impl ThreadHandlers for Sleeper {
            fn on_startup(&mut self, _ctx: &mut ThreadContext) -> Result<()> {
                Ok(())
            }
            fn on_shutdown(&mut self, _ctx: &mut ThreadContext, _code: i32) {
                // Leave queued messages undrained.
                std::thread::sleep(Duration::from_millis(30));
            }
            fn on_message(&mut self, _ctx: &mut ThreadContext, _msg: Msg) {
                std::thread::sleep(Duration::from_millis(20));
            }
            fn on_user_fds(&mut self, _ctx: &mut ThreadContext, _ready: &[Readiness]) {}
        }

        let rt = runtime();
        let child = rt.spawn("sleeper", Sleeper, None).unwrap();
        let pool = Pool::new("scenario", 16);
        for i in 0..8 {
            let msg = pool.alloc("burst", true).unwrap();
            child
                .mailbox()
                .send(msg, tsyncd_core::message::MsgId(i))
                .unwrap();
        }
        let _ = rt.destroy(&child);
        // Give teardown a moment; all envelopes must return.
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(pool.in_use(), 0);
    }
}

#[cfg(test)]
mod daemon_scenarios {
    //! Whole-daemon run: engine + netlink + freerun instances, driven over
    //! the control socket.

    use std::sync::Arc;
    use std::time::Duration;

    use tsyncd_core::clocks::{ClockRegistry, HardwareLock};
    use tsyncd_core::config::Config;
    use tsyncd_core::engine::Engine;
    use tsyncd_core::link::LinkTableSet;
    use tsyncd_core::message::multicast::MulticastBus;
    use tsyncd_core::message::pool::PoolSet;
    use tsyncd_core::runtime::Runtime;
    use tsyncd_core::sync::ModuleServices;

    fn send_control(path: &str, line: &str) {
        let fd = unsafe {
            libc::socket(libc::AF_UNIX, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0)
        };
        assert!(fd >= 0);
        let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        for (i, b) in path.bytes().enumerate() {
            addr.sun_path[i] = b as libc::c_char;
        }
        unsafe {
            libc::sendto(
                fd,
                line.as_ptr() as *const libc::c_void,
                line.len(),
                0,
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
            );
            libc::close(fd);
        }
    }

    #[test]
    fn test_engine_elects_by_priority_and_exits_on_command() {
        let dir = tempfile::tempdir().unwrap();
        let json = format!(
            r#"{{
                "instances": [
                    {{"name": "fr-a", "module": "freerun", "priority": 128, "clock": "system"}},
                    {{"name": "fr-b", "module": "freerun", "priority": 64, "clock": "system"}}
                ],
                "selection_interval_s": 0.2,
                "save_state_interval_s": 0.3,
                "lock_path": "{lock}",
                "state_dir": "{state}",
                "control_path": "{ctl}"
            }}"#,
            lock = dir.path().join("lock").display(),
            state = dir.path().join("state").display(),
            ctl = dir.path().join("ctl.sock").display(),
        );
        let mut cfg: Config = serde_json::from_str(&json).unwrap();
        cfg.validate().unwrap();

        let control_path = cfg.control_path.clone();
        let state_dir = std::path::PathBuf::from(&cfg.state_dir);

        let runtime = Runtime::new(
            Arc::new(MulticastBus::new()),
            PoolSet::new(64, 16, 16),
            cfg.zombie_policy,
        );
        let services = ModuleServices {
            registry: Arc::new(ClockRegistry::new(Arc::new(HardwareLock::new()))),
            tables: Arc::new(LinkTableSet::new()),
            state_dir: state_dir.clone(),
        };
        let rt2 = runtime.clone();
        let mut engine = Engine::new(cfg, rt2, services, None);
        let join = std::thread::spawn(move || runtime.run_root("engine", &mut engine));

        // Let a few selection and save-state ticks pass.
        std::thread::sleep(Duration::from_millis(1200));
        send_control(&control_path, "dumptables\n");
        std::thread::sleep(Duration::from_millis(300));
        send_control(&control_path, "exit\n");

        let code = join.join().unwrap().unwrap();
        assert_eq!(code, 0);

        // The stronger-priority instance won clock control; the other kept
        // timestamp processing only.
        let b = std::fs::read_to_string(state_dir.join("state-fr-b")).unwrap();
        assert!(b.contains("state: slave"), "state-fr-b:\n{b}");
        assert!(b.contains("clock-control"), "state-fr-b:\n{b}");
        let a = std::fs::read_to_string(state_dir.join("state-fr-a")).unwrap();
        assert!(!a.contains("clock-control"), "state-fr-a:\n{a}");
        assert!(a.contains("timestamp-processing"), "state-fr-a:\n{a}");
    }
}
