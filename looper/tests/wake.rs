use looper::{Looper, Poll};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_empty_looper_times_out_immediately() {
    init_logging();

    let looper = Looper::new(false).unwrap();

    let start = Instant::now();
    assert_eq!(looper.poll_once(0).unwrap(), Poll::TimedOut);
    assert!(start.elapsed() < Duration::from_millis(50));
}

#[test]
fn test_timeout_is_honoured() {
    let looper = Looper::new(false).unwrap();

    let start = Instant::now();
    assert_eq!(looper.poll_once(30).unwrap(), Poll::TimedOut);

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(30), "Returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "Returned late: {elapsed:?}");
}

#[test]
fn test_wake_before_poll_returns_woken() {
    let looper = Looper::new(false).unwrap();

    looper.wake();

    assert_eq!(looper.poll_once(1000).unwrap(), Poll::Woken);
    assert_eq!(looper.poll_once(0).unwrap(), Poll::TimedOut);
}

#[test]
fn test_concurrent_wakes_coalesce() {
    let looper = Arc::new(Looper::new(false).unwrap());

    let wakers: Vec<_> = (0..8)
        .map(|_| {
            let looper = looper.clone();
            std::thread::spawn(move || {
                for _ in 0..100 {
                    looper.wake();
                }
            })
        })
        .collect();

    for waker in wakers {
        waker.join().unwrap();
    }

    assert_eq!(looper.poll_once(0).unwrap(), Poll::Woken);
    assert_eq!(
        looper.poll_once(0).unwrap(),
        Poll::TimedOut,
        "All wakes before the drain collapse into one"
    );
}

#[test]
fn test_wake_interrupts_blocked_poll() {
    let looper = Arc::new(Looper::new(false).unwrap());

    let waker = {
        let looper = looper.clone();
        std::thread::spawn(move || {
            while !looper.is_polling() {
                std::thread::yield_now();
            }
            looper.wake();
        })
    };

    let start = Instant::now();
    let result = looper.poll_once(-1).unwrap();
    waker.join().unwrap();

    assert_eq!(result, Poll::Woken);
    assert!(start.elapsed() < Duration::from_millis(1000));
    assert!(!looper.is_polling());
}

#[test]
fn test_duration_timeout_variant() {
    let looper = Looper::new(false).unwrap();

    assert_eq!(
        looper.poll_once_timeout(Some(Duration::ZERO)).unwrap(),
        Poll::TimedOut
    );

    looper.wake();
    assert_eq!(looper.poll_once_timeout(None).unwrap(), Poll::Woken);
}

#[test]
fn test_poll_all_returns_first_non_callback_result() {
    use looper::{Message, MessageHandler};
    use std::sync::atomic::{AtomicUsize, Ordering};

    let looper = Looper::new(false).unwrap();
    let count = Arc::new(AtomicUsize::new(0));

    let handler: Arc<dyn MessageHandler> = {
        let count = count.clone();
        Arc::new(move |_: Message| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    };

    looper.send_message_delayed(Duration::from_millis(5), &handler, Message::new(1));
    looper.send_message_delayed(Duration::from_millis(15), &handler, Message::new(2));

    let start = Instant::now();
    assert_eq!(looper.poll_all(100).unwrap(), Poll::TimedOut);

    assert_eq!(count.load(Ordering::SeqCst), 2);
    assert!(start.elapsed() >= Duration::from_millis(100));
}

#[test]
fn test_rebuild_request_wakes_the_loop() {
    let looper = Looper::new(false).unwrap();

    looper.request_rebuild();

    assert_eq!(looper.poll_once(1000).unwrap(), Poll::Woken);
    assert_eq!(looper.poll_once(0).unwrap(), Poll::TimedOut);
}

extern "C" fn ignore_signal(_: libc::c_int) {}

/// Installs a handler that does nothing, so delivery interrupts blocking
/// calls without killing the process.
fn install_noop_handler(signal: libc::c_int) {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = ignore_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);

        assert_eq!(libc::sigaction(signal, &action, std::ptr::null_mut()), 0);
    }
}

#[test]
fn test_signal_interruptions_keep_waiting() {
    install_noop_handler(libc::SIGUSR1);

    let looper = Looper::new(false).unwrap();
    let target = unsafe { libc::pthread_self() };
    let done = Arc::new(AtomicBool::new(false));

    let interrupter = {
        let done = done.clone();
        std::thread::spawn(move || {
            for _ in 0..3 {
                std::thread::sleep(Duration::from_millis(50));
                if done.load(Ordering::SeqCst) {
                    return;
                }
                unsafe { libc::pthread_kill(target, libc::SIGUSR1) };
            }
        })
    };

    let start = Instant::now();
    let result = looper.poll_once(300).unwrap();
    let elapsed = start.elapsed();

    done.store(true, Ordering::SeqCst);
    interrupter.join().unwrap();

    assert_eq!(result, Poll::TimedOut);
    assert!(
        elapsed >= Duration::from_millis(300),
        "Interrupted wait returned early: {elapsed:?}"
    );
}
