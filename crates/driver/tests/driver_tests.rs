//! Integration tests for the driver core
//!
//! Drives whole devices through the public [`Driver`] surface against the
//! simulated board:
//! - attach/detach and teardown ordering
//! - switch delivery over the interrupt endpoint
//! - bulk slot exclusion under concurrent opens
//! - suspend/resume
//! - the loopback and output scenarios
//!
//! Run with: `cargo test -p driver --test driver_tests`

use driver::test_utils::{DEFAULT_TEST_TIMEOUT, SimulatedFx2, board_endpoints};
use driver::{
    AccessMode, Attribute, DeviceContext, Driver, DriverConfig, DriverError, EndpointRole,
    MINOR_BASE, OutputReading, PowerMode, SignalFlag, TransferConfig,
};
use protocol::UsbError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

fn test_config() -> DriverConfig {
    DriverConfig {
        transfers: TransferConfig {
            bulk_read_timeout: Duration::from_millis(500),
            interrupt_poll: Duration::from_millis(5),
            ..TransferConfig::default()
        },
        ..DriverConfig::default()
    }
}

fn attached() -> (SimulatedFx2, Driver, u32) {
    let sim = SimulatedFx2::new();
    let driver = Driver::register(test_config());
    let minor = driver.attach(sim.bus()).unwrap();
    (sim, driver, minor)
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + DEFAULT_TEST_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

mod lifecycle {
    use super::*;

    #[test]
    fn test_attach_publishes_minor() {
        let (_sim, driver, minor) = attached();

        assert_eq!(minor, MINOR_BASE);
        assert_eq!(driver.minors(), vec![MINOR_BASE]);
        let ctx = driver.context(minor).unwrap();
        assert_eq!(ctx.name(), "osrfx2_0");
        assert!(ctx.transfers().interrupt_active());
    }

    #[test]
    fn test_minors_are_reused() {
        let driver = Driver::register(test_config());
        let first = SimulatedFx2::new();
        let second = SimulatedFx2::new();

        let a = driver.attach(first.bus()).unwrap();
        let b = driver.attach(second.bus()).unwrap();
        assert_eq!((a, b), (192, 193));

        driver.detach(a).unwrap();
        let third = SimulatedFx2::new();
        assert_eq!(driver.attach(third.bus()).unwrap(), 192);
    }

    #[test]
    fn test_detach_without_handles_destroys_once() {
        let (sim, driver, minor) = attached();

        driver.detach(minor).unwrap();
        assert_eq!(sim.bus_releases(), 1);
        assert!(matches!(
            driver.detach(minor),
            Err(DriverError::UnknownMinor(_))
        ));
        assert_eq!(sim.bus_releases(), 1);
    }

    #[test]
    fn test_detach_then_close_destroys_once() {
        let (sim, driver, minor) = attached();
        let reader = driver.open(minor, AccessMode::Read).unwrap();
        let writer = driver.open(minor, AccessMode::Write).unwrap();

        driver.detach(minor).unwrap();
        assert_eq!(sim.bus_releases(), 0);

        // Handles outlive the detach but see the device as gone
        let mut buf = [0u8; 8];
        assert!(matches!(reader.read(&mut buf), Err(DriverError::NoDevice)));
        assert!(matches!(writer.write(b"x"), Err(DriverError::NoDevice)));

        reader.close();
        assert_eq!(sim.bus_releases(), 0);
        writer.close();
        assert_eq!(sim.bus_releases(), 1);
    }

    #[test]
    fn test_close_then_detach_destroys_once() {
        let (sim, driver, minor) = attached();
        let file = driver.open(minor, AccessMode::ReadWrite).unwrap();

        file.close();
        assert_eq!(sim.bus_releases(), 0);
        driver.detach(minor).unwrap();
        assert_eq!(sim.bus_releases(), 1);
    }

    #[test]
    fn test_no_open_after_detach() {
        let (_sim, driver, minor) = attached();
        driver.detach(minor).unwrap();

        assert!(matches!(
            driver.open(minor, AccessMode::Read),
            Err(DriverError::UnknownMinor(m)) if m == minor
        ));
        assert!(matches!(
            driver.open_by_name("osrfx2_0", AccessMode::Read),
            Err(DriverError::UnknownMinor(_))
        ));
    }

    #[test]
    fn test_detached_device_cannot_rearm_switch_monitoring() {
        let (sim, driver, minor) = attached();
        let file = driver.open(minor, AccessMode::Read).unwrap();
        driver.detach(minor).unwrap();

        let ctx = file.context();
        let signal = SignalFlag::new();
        assert!(matches!(ctx.resume(&signal), Err(DriverError::NoDevice)));
        assert!(matches!(ctx.suspend(&signal), Err(DriverError::NoDevice)));
        assert!(matches!(
            ctx.transfers().submit_interrupt(),
            Err(DriverError::NoDevice)
        ));
        assert!(!ctx.transfers().interrupt_active());

        sim.press_switches(0x5A);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(ctx.switches().latest().generation, 0);
        assert_ne!(ctx.switches().current(), 0x5A);
    }

    #[test]
    fn test_non_matching_device_is_rejected() {
        let driver = Driver::register(test_config());
        let sim = SimulatedFx2::with_ids(0x1234, 0x5678);

        assert!(matches!(
            driver.attach(sim.bus()),
            Err(DriverError::NotMatched {
                vendor_id: 0x1234,
                product_id: 0x5678
            })
        ));
        assert_eq!(sim.bus_releases(), 1);
        assert!(driver.minors().is_empty());
    }

    #[test]
    fn test_missing_endpoint_unwinds_attach() {
        let driver = Driver::register(test_config());
        let endpoints = board_endpoints()
            .into_iter()
            .filter(|ep| ep.address != 0x06)
            .collect();
        let sim = SimulatedFx2::with_endpoints(endpoints);

        assert!(matches!(
            driver.attach(sim.bus()),
            Err(DriverError::MissingEndpoint(EndpointRole::BulkOut))
        ));
        assert_eq!(sim.bus_releases(), 1);

        // Minor was not leaked
        let good = SimulatedFx2::new();
        assert_eq!(driver.attach(good.bus()).unwrap(), MINOR_BASE);
    }

    #[test]
    fn test_failed_interrupt_submission_unwinds_attach() {
        let driver = Driver::register(test_config());
        let sim = SimulatedFx2::new();
        sim.set_hub_suspended(true);

        assert!(matches!(
            driver.attach(sim.bus()),
            Err(DriverError::TransferFailed(UsbError::HostUnreachable))
        ));
        assert_eq!(sim.bus_releases(), 1);
        assert!(driver.minors().is_empty());
    }

    #[test]
    fn test_unplug_then_detach() {
        let (sim, driver, minor) = attached();
        let ctx = driver.context(minor).unwrap();

        sim.unplug();
        assert!(wait_until(|| !ctx.transfers().interrupt_active()));
        drop(ctx);

        driver.detach(minor).unwrap();
        assert_eq!(sim.bus_releases(), 1);
    }

    #[test]
    fn test_deregister_detaches_everything() {
        let driver = Driver::register(test_config());
        let boards = [SimulatedFx2::new(), SimulatedFx2::new()];
        for board in &boards {
            driver.attach(board.bus()).unwrap();
        }

        driver.deregister();
        for board in &boards {
            assert_eq!(board.bus_releases(), 1);
        }
    }

    #[test]
    fn test_references_track_handles() {
        let (_sim, driver, minor) = attached();
        let ctx = driver.context(minor).unwrap();
        // Registry plus ours
        assert_eq!(DeviceContext::references(&ctx), 2);

        let file = driver.open(minor, AccessMode::Read).unwrap();
        assert_eq!(DeviceContext::references(&ctx), 3);
        file.close();
        assert_eq!(DeviceContext::references(&ctx), 2);
    }
}

mod switches {
    use super::*;

    #[test]
    fn test_switches_reflect_latest_interrupt() {
        let (sim, driver, minor) = attached();
        let attrs = driver.attributes(minor).unwrap();
        let ctx = driver.context(minor).unwrap();

        sim.press_switches(0x81);
        sim.press_switches(0x03);
        assert!(wait_until(|| ctx.switches().latest().generation == 2));

        assert_eq!(ctx.vendor().read_switches().0, 0x03);
        assert_eq!(attrs.show(Attribute::Switches).unwrap(), "00000011");
    }

    #[test]
    fn test_wait_switch_change() {
        let (sim, driver, minor) = attached();
        let ctx = driver.context(minor).unwrap();
        let seen = ctx.switches().latest().generation;

        let presser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            sim.press_switches(0x40);
            sim
        });

        let event = ctx
            .wait_switch_change(seen, DEFAULT_TEST_TIMEOUT)
            .expect("switch change");
        assert_eq!(event.state, 0x40);
        assert_eq!(event.generation, seen + 1);
        presser.join().unwrap();
    }

    #[test]
    fn test_interrupt_error_pauses_until_resume() {
        let (sim, driver, minor) = attached();
        let ctx = driver.context(minor).unwrap();
        let signal = SignalFlag::new();

        sim.fail_next_interrupt(UsbError::Io);
        assert!(wait_until(|| !ctx.transfers().interrupt_active()));

        sim.press_switches(0x11);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(ctx.vendor().read_switches().0, 0);

        driver.suspend(minor, &signal).unwrap();
        driver.resume(minor, &signal).unwrap();
        assert!(wait_until(|| ctx.vendor().read_switches().0 == 0x11));
    }

    #[tokio::test]
    async fn test_subscribe_switches() {
        let (sim, driver, minor) = attached();
        let ctx = driver.context(minor).unwrap();
        let rx = ctx.subscribe_switches();

        sim.press_switches(0x22);
        sim.press_switches(0x44);

        let first = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, rx.recv())
            .await
            .expect("timed out")
            .unwrap();
        let second = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, rx.recv())
            .await
            .expect("timed out")
            .unwrap();

        assert_eq!((first.state, second.state), (0x22, 0x44));
        assert!(second.generation > first.generation);
    }

    #[tokio::test]
    async fn test_subscription_ends_at_detach() {
        let (_sim, driver, minor) = attached();
        let ctx = driver.context(minor).unwrap();
        let rx = ctx.subscribe_switches();

        driver.detach(minor).unwrap();

        let ended = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, rx.recv())
            .await
            .expect("timed out");
        assert!(ended.is_err());
        assert!(ctx.subscribe_switches().is_closed());
    }
}

mod access_gate {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_concurrent_write_opens() {
        let (_sim, driver, minor) = attached();
        let driver = Arc::new(driver);
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let driver = Arc::clone(&driver);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    driver.open(minor, AccessMode::Write)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let opened = results.iter().filter(|r| r.is_ok()).count();
        let busy = results
            .iter()
            .filter(|r| matches!(r, Err(DriverError::Busy)))
            .count();

        assert_eq!(opened, 1);
        assert_eq!(busy, 1);
    }

    #[test]
    fn test_third_opener_is_busy_without_side_effects() {
        let (_sim, driver, minor) = attached();
        let reader = driver.open(minor, AccessMode::Read).unwrap();
        let writer = driver.open(minor, AccessMode::Write).unwrap();

        assert!(matches!(
            driver.open(minor, AccessMode::ReadWrite),
            Err(DriverError::Busy)
        ));
        let ctx = driver.context(minor).unwrap();
        assert!(ctx.gate().is_read_held());
        assert!(ctx.gate().is_write_held());

        drop(reader);
        assert!(!ctx.gate().is_read_held());
        assert!(ctx.gate().is_write_held());
        drop(writer);
    }

    #[test]
    fn test_random_interleavings_keep_slots_exclusive() {
        let (_sim, driver, minor) = attached();
        let driver = Arc::new(driver);
        let readers = Arc::new(AtomicUsize::new(0));
        let writers = Arc::new(AtomicUsize::new(0));
        let violations = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..6)
            .map(|_| {
                let driver = Arc::clone(&driver);
                let readers = Arc::clone(&readers);
                let writers = Arc::clone(&writers);
                let violations = Arc::clone(&violations);

                thread::spawn(move || {
                    let mut rng = rand::rng();
                    for _ in 0..200 {
                        let mode = match rng.random_range(0..3) {
                            0 => AccessMode::Read,
                            1 => AccessMode::Write,
                            _ => AccessMode::ReadWrite,
                        };

                        let file = match driver.open(minor, mode) {
                            Ok(file) => file,
                            Err(DriverError::Busy) => continue,
                            Err(e) => panic!("unexpected open error: {}", e),
                        };

                        if mode.reads() && readers.fetch_add(1, Ordering::SeqCst) != 0 {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                        if mode.writes() && writers.fetch_add(1, Ordering::SeqCst) != 0 {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }

                        if rng.random_bool(0.5) {
                            thread::yield_now();
                        }

                        if mode.reads() {
                            readers.fetch_sub(1, Ordering::SeqCst);
                        }
                        if mode.writes() {
                            writers.fetch_sub(1, Ordering::SeqCst);
                        }
                        file.close();
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(violations.load(Ordering::SeqCst), 0);
        let ctx = driver.context(minor).unwrap();
        assert!(!ctx.gate().is_read_held());
        assert!(!ctx.gate().is_write_held());
    }
}

mod power {
    use super::*;

    #[test]
    fn test_suspend_resume_restores_readings() {
        let (_sim, driver, minor) = attached();
        let attrs = driver.attributes(minor).unwrap();
        let signal = SignalFlag::new();

        attrs.store(Attribute::SevenSegment, "42").unwrap();
        driver.suspend(minor, &signal).unwrap();
        assert_eq!(attrs.show(Attribute::SevenSegment).unwrap(), "S ");
        assert_eq!(attrs.show(Attribute::Bargraph).unwrap(), "S ");

        driver.resume(minor, &signal).unwrap();
        let ctx = driver.context(minor).unwrap();
        assert_eq!(ctx.power_mode(), PowerMode::Active);
        assert_eq!(
            ctx.vendor().read_segments().unwrap(),
            OutputReading::Value(42)
        );
    }

    #[test]
    fn test_bulk_traffic_unaffected_by_suspend() {
        let (_sim, driver, minor) = attached();
        let file = driver.open(minor, AccessMode::ReadWrite).unwrap();
        driver.suspend(minor, &SignalFlag::new()).unwrap();

        file.write(b"still here").unwrap();
        let mut buf = [0u8; 32];
        let count = file.read(&mut buf).unwrap();
        assert_eq!(&buf[..count], b"still here");
    }

    #[test]
    fn test_switches_paused_while_suspended() {
        let (sim, driver, minor) = attached();
        let ctx = driver.context(minor).unwrap();
        let signal = SignalFlag::new();

        driver.suspend(minor, &signal).unwrap();
        assert!(!ctx.transfers().interrupt_active());
        sim.press_switches(0x0F);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(ctx.switches().latest().generation, 0);

        driver.resume(minor, &signal).unwrap();
        assert!(wait_until(|| ctx.vendor().read_switches().0 == 0x0F));
    }

    #[test]
    fn test_resume_with_suspended_hub_keeps_device_usable() {
        let (sim, driver, minor) = attached();
        let signal = SignalFlag::new();

        driver.suspend(minor, &signal).unwrap();
        sim.set_hub_suspended(true);
        driver.resume(minor, &signal).unwrap();

        let ctx = driver.context(minor).unwrap();
        assert!(!ctx.is_suspended());
        assert!(!ctx.transfers().interrupt_active());

        ctx.vendor().write_leds(3).unwrap();
        assert_eq!(ctx.vendor().read_leds().unwrap(), OutputReading::Value(3));
    }
}

mod scenarios {
    use super::*;

    #[test]
    fn test_loopback_packet() {
        let (_sim, driver, minor) = attached();
        let writer = driver.open_by_name("osrfx2_0", AccessMode::Write).unwrap();
        let reader = driver.open_by_name("osrfx2_0", AccessMode::Read).unwrap();

        let packet = b"Test packet 0";
        assert_eq!(writer.write(packet).unwrap(), 13);

        let mut buf = [0u8; 512];
        let count = reader.read(&mut buf).unwrap();
        assert_eq!(count, 13);
        assert_eq!(&buf[..count], packet);
        assert_eq!(driver.context(minor).unwrap().pending_bytes(), 0);
    }

    #[test]
    fn test_all_leds_on() {
        let (sim, driver, minor) = attached();
        let ctx = driver.context(minor).unwrap();

        ctx.vendor().write_leds(255).unwrap();
        assert_eq!(ctx.vendor().read_leds().unwrap().to_string(), "11111111");
        assert_eq!(sim.leds_wire(), 0xFF);
    }

    #[test]
    fn test_status_snapshot() {
        let (sim, driver, minor) = attached();
        let ctx = driver.context(minor).unwrap();
        sim.press_switches(0x80);
        assert!(wait_until(|| ctx.switches().current() == 0x80));
        drop(ctx);

        driver
            .attributes(minor)
            .unwrap()
            .store(Attribute::Bargraph, "1")
            .unwrap();

        let status = driver.status(minor).unwrap();
        assert_eq!(status.name, "osrfx2_0");
        assert_eq!(status.minor, MINOR_BASE);
        assert_eq!(status.switches, "10000000");
        assert_eq!(status.bargraph, "00000001");
        assert!(!status.suspended);
        assert_eq!(status.high_speed, Some(true));
    }
}
