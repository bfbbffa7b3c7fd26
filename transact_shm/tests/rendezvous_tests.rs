//! Rendezvous channel tests. Each peer is a thread with its own mapping of
//! the session file; futexes key on the shared inode, so this takes the same
//! path as two processes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use transact_shm::{Channel, ChannelOptions, Role, SessionState, ShmError, ShmResult};

const POLL: Duration = Duration::from_millis(20);

fn options(dir: &TempDir, token: u64) -> ChannelOptions {
    ChannelOptions {
        dir: dir.path().to_path_buf(),
        token,
        timeout: Some(Duration::from_secs(10)),
        liveness_poll: POLL,
    }
}

fn session_file(dir: &TempDir, name: &str) -> std::path::PathBuf {
    dir.path().join(format!("transact_{name}.session"))
}

#[test]
fn test_turns_alternate_strictly() -> ShmResult<()> {
    const ROUNDS: usize = 50;
    let dir = tempfile::tempdir()?;
    let running = Arc::new(AtomicBool::new(false));
    let log = Arc::new(Mutex::new(Vec::new()));

    let acceptor = {
        let opts = options(&dir, 7);
        let running = Arc::clone(&running);
        let log = Arc::clone(&log);
        thread::spawn(move || -> ShmResult<()> {
            let channel = Channel::open(Role::Acceptor, "alternate", &opts)?;
            for _ in 0..ROUNDS {
                assert!(!running.swap(true, Ordering::SeqCst), "both peers running");
                log.lock().unwrap().push(Role::Acceptor);
                running.store(false, Ordering::SeqCst);
                channel.yield_and_wait()?;
            }
            Ok(())
        })
    };

    let channel = Channel::open(Role::Initiator, "alternate", &options(&dir, 7))?;
    for _ in 0..ROUNDS {
        assert!(!running.swap(true, Ordering::SeqCst), "both peers running");
        log.lock().unwrap().push(Role::Initiator);
        running.store(false, Ordering::SeqCst);
        channel.yield_and_wait()?;
    }
    assert!(channel.has_turn());
    // The acceptor is blocked in its last wait; closing releases it.
    channel.close();
    assert!(matches!(acceptor.join().unwrap(), Err(ShmError::PeerDied)));

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 2 * ROUNDS);
    for (i, role) in log.iter().enumerate() {
        let expected = if i % 2 == 0 { Role::Initiator } else { Role::Acceptor };
        assert_eq!(*role, expected, "entry {i}");
    }
    Ok(())
}

#[test]
fn test_third_open_is_rejected() -> ShmResult<()> {
    let dir = tempfile::tempdir()?;
    let acceptor = {
        let opts = options(&dir, 1);
        thread::spawn(move || -> ShmResult<()> {
            let channel = Channel::open(Role::Acceptor, "crowded", &opts)?;
            channel.close();
            Ok(())
        })
    };

    let channel = Channel::open(Role::Initiator, "crowded", &options(&dir, 1))?;
    assert_eq!(channel.session_state(), SessionState::BothAttached);

    for role in [Role::Acceptor, Role::Initiator] {
        let third = Channel::open(role, "crowded", &options(&dir, 1));
        assert!(matches!(third, Err(ShmError::SessionFull { .. })));
    }
    // Rejected opens leave the session alone.
    assert_eq!(channel.session_state(), SessionState::BothAttached);

    assert!(matches!(channel.yield_and_wait(), Err(ShmError::PeerDied)));
    acceptor.join().unwrap()?;
    Ok(())
}

#[test]
fn test_mismatched_tokens_fail_both_then_retry() -> ShmResult<()> {
    let dir = tempfile::tempdir()?;
    let acceptor = {
        let opts = options(&dir, 0x100);
        thread::spawn(move || Channel::open(Role::Acceptor, "tokens", &opts).map(drop))
    };
    let initiator = Channel::open(Role::Initiator, "tokens", &options(&dir, 0x200));

    assert!(matches!(initiator, Err(ShmError::HandshakeMismatch { .. })));
    assert!(matches!(
        acceptor.join().unwrap(),
        Err(ShmError::HandshakeMismatch { .. })
    ));
    assert!(!session_file(&dir, "tokens").exists());

    // A corrected retry starts from a fresh session.
    let acceptor = {
        let opts = options(&dir, 0x200);
        thread::spawn(move || -> ShmResult<()> {
            let channel = Channel::open(Role::Acceptor, "tokens", &opts)?;
            channel.yield_and_wait()
        })
    };
    let initiator = Channel::open(Role::Initiator, "tokens", &options(&dir, 0x200))?;
    initiator.yield_and_wait()?;
    assert!(initiator.has_turn());
    initiator.close();

    assert!(matches!(acceptor.join().unwrap(), Err(ShmError::PeerDied)));
    assert!(!session_file(&dir, "tokens").exists());
    Ok(())
}

#[test]
fn test_close_wakes_waiting_peer_once() -> ShmResult<()> {
    let dir = tempfile::tempdir()?;
    let acceptor = {
        let opts = options(&dir, 3);
        thread::spawn(move || -> ShmResult<Duration> {
            let channel = Channel::open(Role::Acceptor, "closing", &opts)?;
            let first = channel.yield_and_wait();
            assert!(matches!(first, Err(ShmError::PeerDied)));
            assert_eq!(channel.session_state(), SessionState::Terminated);

            let start = Instant::now();
            let second = channel.yield_and_wait();
            assert!(matches!(second, Err(ShmError::PeerDied)));
            Ok(start.elapsed())
        })
    };

    let channel = Channel::open(Role::Initiator, "closing", &options(&dir, 3))?;
    channel.yield_and_wait()?;
    thread::sleep(Duration::from_millis(50));
    channel.close();

    let second_call = acceptor.join().unwrap()?;
    assert!(second_call < POLL, "second call blocked for {second_call:?}");
    Ok(())
}

#[test]
fn test_cancelled_wait_can_be_resumed() -> ShmResult<()> {
    let dir = tempfile::tempdir()?;
    let (tx, rx) = mpsc::channel();

    let acceptor = {
        let opts = options(&dir, 9);
        thread::spawn(move || -> ShmResult<()> {
            let channel = Channel::open(Role::Acceptor, "cancel", &opts)?;
            let canceller = channel.canceller();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                canceller.cancel();
            });

            let interrupted = channel.yield_and_wait();
            tx.send(matches!(interrupted, Err(ShmError::Interrupted)))
                .unwrap();
            // The turn stayed with the initiator; resume waiting for it.
            channel.yield_and_wait()?;
            assert!(channel.has_turn());
            Ok(())
        })
    };

    let channel = Channel::open(Role::Initiator, "cancel", &options(&dir, 9))?;
    channel.yield_and_wait()?;
    assert!(rx.recv().unwrap(), "acceptor wait was not interrupted");
    assert!(channel.has_turn());

    assert!(matches!(channel.yield_and_wait(), Err(ShmError::PeerDied)));
    acceptor.join().unwrap()?;
    Ok(())
}

#[test]
fn test_bounded_wait_times_out_and_resumes() -> ShmResult<()> {
    let dir = tempfile::tempdir()?;
    let (tx, rx) = mpsc::channel::<()>();

    let acceptor = {
        let opts = options(&dir, 5);
        thread::spawn(move || -> ShmResult<()> {
            let channel = Channel::open(Role::Acceptor, "bounded", &opts)?;
            // Hold the turn until the initiator has timed out once.
            rx.recv().unwrap();
            channel.yield_and_wait()
        })
    };

    let channel = Channel::open(Role::Initiator, "bounded", &options(&dir, 5))?;
    let timed_out = channel.yield_and_wait_timeout(Some(Duration::from_millis(60)));
    assert!(matches!(timed_out, Err(ShmError::TimedOut { .. })));
    assert!(!channel.has_turn());

    tx.send(()).unwrap();
    channel.yield_and_wait_timeout(Some(Duration::from_secs(10)))?;
    assert!(channel.has_turn());
    drop(channel);

    assert!(matches!(acceptor.join().unwrap(), Err(ShmError::PeerDied)));
    Ok(())
}

#[test]
fn test_acceptor_waits_for_initiator_token() -> ShmResult<()> {
    let dir = tempfile::tempdir()?;
    let opened = Arc::new(AtomicBool::new(false));
    let acceptor = {
        let opts = options(&dir, 2);
        let opened = Arc::clone(&opened);
        thread::spawn(move || -> ShmResult<()> {
            let channel = Channel::open(Role::Acceptor, "early", &opts)?;
            opened.store(true, Ordering::SeqCst);
            channel.close();
            Ok(())
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!opened.load(Ordering::SeqCst));

    let channel = Channel::open(Role::Initiator, "early", &options(&dir, 2))?;
    assert!(!opened.load(Ordering::SeqCst));
    assert!(matches!(channel.yield_and_wait(), Err(ShmError::PeerDied)));
    acceptor.join().unwrap()?;
    assert!(opened.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn test_acceptor_open_times_out_alone() -> ShmResult<()> {
    let dir = tempfile::tempdir()?;
    let opts = ChannelOptions {
        timeout: Some(Duration::from_millis(80)),
        ..options(&dir, 0)
    };
    let result = Channel::open(Role::Acceptor, "nobody", &opts);
    assert!(matches!(result, Err(ShmError::TimedOut { operation: "open" })));
    assert!(!session_file(&dir, "nobody").exists());
    Ok(())
}
